//! Durable client-local storage.
//!
//! The behaviour profile and the critical-entry snapshot survive restarts as
//! JSON documents under fixed storage keys. `ProfileStorage` is the seam;
//! `FileStorage` writes one file per key, `MemoryStorage` backs tests and
//! ephemeral sessions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::Duration;
use tracing::{debug, info};

use super::entry::EntryStatus;
use super::keys::{EntityClass, QueryKey};
use super::layer::{CacheLayer, WriteOptions};
use super::lock;

const SOURCE: &str = "cache::persist";

/// Storage key of the behaviour profile.
pub const PROFILE_STORAGE_KEY: &str = "beekeeper.behavior";
/// Storage key of the critical cache snapshot.
pub const SNAPSHOT_STORAGE_KEY: &str = "beekeeper.critical";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("storage io failed for `{key}`: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("stored document `{key}` is malformed: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl PersistError {
    fn io(key: &str, source: std::io::Error) -> Self {
        Self::Io {
            key: key.to_string(),
            source,
        }
    }

    fn malformed(key: &str, source: serde_json::Error) -> Self {
        Self::Malformed {
            key: key.to_string(),
            source,
        }
    }
}

#[async_trait]
pub trait ProfileStorage: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>, PersistError>;
    async fn save(&self, key: &str, value: &str) -> Result<(), PersistError>;
    async fn remove(&self, key: &str) -> Result<(), PersistError>;
}

/// Stores each key as `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl ProfileStorage for FileStorage {
    async fn load(&self, key: &str) -> Result<Option<String>, PersistError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(PersistError::io(key, err)),
        }
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), PersistError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| PersistError::io(key, err))?;
        tokio::fs::write(self.path_for(key), value)
            .await
            .map_err(|err| PersistError::io(key, err))
    }

    async fn remove(&self, key: &str) -> Result<(), PersistError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(PersistError::io(key, err)),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ProfileStorage for MemoryStorage {
    async fn load(&self, key: &str) -> Result<Option<String>, PersistError> {
        Ok(lock::lock(&self.values, SOURCE, "memory.load").get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), PersistError> {
        lock::lock(&self.values, SOURCE, "memory.save").insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), PersistError> {
        lock::lock(&self.values, SOURCE, "memory.remove").remove(key);
        Ok(())
    }
}

/// Load and decode a JSON document; `None` when nothing was stored.
pub async fn load_json<T>(storage: &dyn ProfileStorage, key: &str) -> Result<Option<T>, PersistError>
where
    T: for<'de> Deserialize<'de>,
{
    let Some(raw) = storage.load(key).await? else {
        return Ok(None);
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|err| PersistError::malformed(key, err))
}

pub async fn save_json<T: Serialize>(
    storage: &dyn ProfileStorage,
    key: &str,
    value: &T,
) -> Result<(), PersistError> {
    let raw = serde_json::to_string(value).map_err(|err| PersistError::malformed(key, err))?;
    storage.save(key, &raw).await
}

pub(crate) fn unix_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

// ============================================================================
// Critical entry snapshot
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub key: QueryKey,
    pub data: Value,
}

/// User-profile and tag entries saved on shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticalSnapshot {
    #[serde(rename = "savedAt")]
    pub saved_at: i64,
    pub entries: Vec<SnapshotEntry>,
}

impl CriticalSnapshot {
    pub fn capture(layer: &CacheLayer) -> Self {
        let entries = layer
            .entries()
            .into_iter()
            .filter(|entry| entry.status == EntryStatus::Success)
            .filter(|entry| matches!(entry.key.class(), EntityClass::Users | EntityClass::Tags))
            .map(|entry| SnapshotEntry {
                key: entry.key,
                data: (*entry.data).clone(),
            })
            .collect();
        Self {
            saved_at: unix_millis(OffsetDateTime::now_utc()),
            entries,
        }
    }

    pub fn age(&self, now: OffsetDateTime) -> Duration {
        let elapsed = unix_millis(now).saturating_sub(self.saved_at).max(0);
        Duration::from_millis(elapsed as u64)
    }
}

/// Save the critical entries of `layer`. Returns how many were written.
pub async fn persist_critical(
    layer: &CacheLayer,
    storage: &dyn ProfileStorage,
) -> Result<usize, PersistError> {
    let snapshot = CriticalSnapshot::capture(layer);
    save_json(storage, SNAPSHOT_STORAGE_KEY, &snapshot).await?;
    debug!(entries = snapshot.entries.len(), "critical snapshot persisted");
    Ok(snapshot.entries.len())
}

/// Rehydrate critical entries saved less than `max_age` ago. Older snapshots
/// are discarded. Returns how many entries were restored.
pub async fn restore_critical(
    layer: &CacheLayer,
    storage: &dyn ProfileStorage,
    max_age: Duration,
) -> Result<usize, PersistError> {
    let Some(snapshot) = load_json::<CriticalSnapshot>(storage, SNAPSHOT_STORAGE_KEY).await? else {
        return Ok(0);
    };
    let age = snapshot.age(OffsetDateTime::now_utc());
    if age > max_age {
        info!(age_ms = age.as_millis() as u64, "critical snapshot too old; discarding");
        storage.remove(SNAPSHOT_STORAGE_KEY).await?;
        return Ok(0);
    }

    let restored = snapshot.entries.len();
    for entry in snapshot.entries {
        layer.write(&entry.key, entry.data, WriteOptions::default());
    }
    info!(restored, "critical snapshot restored");
    Ok(restored)
}
