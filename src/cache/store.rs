//! Entry store.
//!
//! Holds cache entries keyed by their canonical key serialisation, bounded by
//! an LRU capacity. Maintains a secondary id↔slug index for article detail
//! entries so the same article cached under both keys can be found without
//! inspecting payloads of unrelated entries.
//!
//! `find_by_prefix` is a linear scan over the store; acceptable below roughly
//! ten thousand entries.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::RwLock;

use lru::LruCache;
use metrics::counter;
use serde_json::Value;
use tokio::time::Instant;

use super::entry::CacheEntry;
use super::keys::{self, KeyToken, QueryKey};
use super::lock;

const SOURCE: &str = "cache::store";
const METRIC_CACHE_EVICT_TOTAL: &str = "beekeeper_cache_evict_total";

#[derive(Default)]
struct SlugIndex {
    id_to_slug: HashMap<i64, String>,
    slug_to_id: HashMap<String, i64>,
}

/// Key/value store of cache entries.
pub struct EntryStore {
    entries: RwLock<LruCache<String, CacheEntry>>,
    index: RwLock<SlugIndex>,
}

impl EntryStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
            index: RwLock::new(SlugIndex::default()),
        }
    }

    /// Look up an entry, promoting it in LRU order.
    pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
        lock::write(&self.entries, SOURCE, "get")
            .get(key.serialized())
            .cloned()
    }

    /// Insert or replace an entry. Returns the key evicted to make room, if any.
    pub fn set(&self, entry: CacheEntry) -> Option<QueryKey> {
        if entry.has_data() {
            self.index_article(&entry.key, &entry.data);
        }
        let serialized = entry.key.serialized().to_string();
        let mut entries = lock::write(&self.entries, SOURCE, "set");
        let evicted = entries
            .push(serialized.clone(), entry)
            .filter(|(evicted_key, _)| *evicted_key != serialized)
            .map(|(_, evicted)| evicted.key);
        if let Some(evicted) = &evicted {
            counter!(METRIC_CACHE_EVICT_TOTAL).increment(1);
            self.prune_index(&entries, evicted);
        }
        evicted
    }

    /// Mutate an entry in place without changing LRU order.
    pub fn update<R>(&self, key: &QueryKey, f: impl FnOnce(&mut CacheEntry) -> R) -> Option<R> {
        lock::write(&self.entries, SOURCE, "update")
            .peek_mut(key.serialized())
            .map(f)
    }

    /// Mutate every entry whose key starts with `prefix`. Returns how many
    /// calls of `f` reported a change.
    pub fn update_prefix(&self, prefix: &QueryKey, mut f: impl FnMut(&mut CacheEntry) -> bool) -> usize {
        let mut entries = lock::write(&self.entries, SOURCE, "update_prefix");
        let mut count = 0;
        for (_, entry) in entries.iter_mut() {
            if entry.key.starts_with(prefix) && f(entry) {
                count += 1;
            }
        }
        count
    }

    pub fn remove(&self, key: &QueryKey) -> Option<CacheEntry> {
        let mut entries = lock::write(&self.entries, SOURCE, "remove");
        let removed = entries.pop(key.serialized());
        if removed.is_some() {
            self.prune_index(&entries, key);
        }
        removed
    }

    /// Remove every entry whose key starts with `prefix`.
    pub fn remove_prefix(&self, prefix: &QueryKey) -> usize {
        self.remove_where(|entry| entry.key.starts_with(prefix))
    }

    /// Remove entries past their GC deadline.
    pub fn remove_expired(&self, now: Instant) -> usize {
        self.remove_where(|entry| entry.is_expired(now))
    }

    fn remove_where(&self, predicate: impl Fn(&CacheEntry) -> bool) -> usize {
        let mut entries = lock::write(&self.entries, SOURCE, "remove_where");
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(serialized, _)| serialized.clone())
            .collect();
        for serialized in &doomed {
            if let Some(removed) = entries.pop(serialized) {
                self.prune_index(&entries, &removed.key);
            }
        }
        doomed.len()
    }

    /// All entries whose key starts with `prefix`.
    pub fn find_by_prefix(&self, prefix: &QueryKey) -> Vec<CacheEntry> {
        lock::read(&self.entries, SOURCE, "find_by_prefix")
            .iter()
            .filter(|(_, entry)| entry.key.starts_with(prefix))
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    /// Snapshot of every entry, most recently used first.
    pub fn entries(&self) -> Vec<CacheEntry> {
        lock::read(&self.entries, SOURCE, "entries")
            .iter()
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        lock::read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock::write(&self.entries, SOURCE, "clear").clear();
        let mut index = lock::write(&self.index, SOURCE, "clear.index");
        index.id_to_slug.clear();
        index.slug_to_id.clear();
    }

    // ========================================================================
    // Article id <-> slug index
    // ========================================================================

    /// Record the id↔slug pair carried by an article detail payload.
    pub fn index_article(&self, key: &QueryKey, data: &Value) {
        if ArticleKey::of(key).is_none() {
            return;
        }
        let (Some(id), Some(slug)) = (
            data.get("id").and_then(Value::as_i64),
            data.get("slug").and_then(Value::as_str),
        ) else {
            return;
        };
        self.link_article(id, slug);
    }

    /// Explicitly link an article id and slug.
    pub fn link_article(&self, id: i64, slug: &str) {
        let mut index = lock::write(&self.index, SOURCE, "link_article");
        if let Some(previous) = index.id_to_slug.insert(id, slug.to_string())
            && previous != slug
        {
            index.slug_to_id.remove(&previous);
        }
        index.slug_to_id.insert(slug.to_string(), id);
    }

    pub fn slug_for_id(&self, id: i64) -> Option<String> {
        lock::read(&self.index, SOURCE, "slug_for_id")
            .id_to_slug
            .get(&id)
            .cloned()
    }

    pub fn id_for_slug(&self, slug: &str) -> Option<i64> {
        lock::read(&self.index, SOURCE, "id_for_slug")
            .slug_to_id
            .get(slug)
            .copied()
    }

    pub fn slug_key_for_id(&self, id: i64) -> Option<QueryKey> {
        self.slug_for_id(id).map(|slug| keys::article_slug(&slug))
    }

    pub fn id_key_for_slug(&self, slug: &str) -> Option<QueryKey> {
        self.id_for_slug(slug).map(keys::article_detail)
    }

    /// Drop the id↔slug pair once neither of its detail entries is cached.
    /// Called with the entries lock held; lock order is entries, then index.
    fn prune_index(&self, entries: &LruCache<String, CacheEntry>, removed: &QueryKey) {
        let Some(article) = ArticleKey::of(removed) else {
            return;
        };
        let mut index = lock::write(&self.index, SOURCE, "prune_index");
        let (id, slug) = match article {
            ArticleKey::Id(id) => match index.id_to_slug.get(&id) {
                Some(slug) => (id, slug.clone()),
                None => return,
            },
            ArticleKey::Slug(slug) => match index.slug_to_id.get(&slug) {
                Some(id) => (*id, slug),
                None => return,
            },
        };
        let still_cached = entries.contains(keys::article_detail(id).serialized())
            || entries.contains(keys::article_slug(&slug).serialized());
        if !still_cached {
            index.id_to_slug.remove(&id);
            index.slug_to_id.remove(&slug);
        }
    }
}

/// Article detail key, addressed by id or by slug.
enum ArticleKey {
    Id(i64),
    Slug(String),
}

impl ArticleKey {
    fn of(key: &QueryKey) -> Option<Self> {
        match key.tokens() {
            [KeyToken::Str(root), KeyToken::Str(kind), KeyToken::Int(id)]
                if root == "articles" && kind == "detail" =>
            {
                Some(Self::Id(*id))
            }
            [KeyToken::Str(root), KeyToken::Str(kind), KeyToken::Str(slug)]
                if root == "articles" && kind == "slug" =>
            {
                Some(Self::Slug(slug.clone()))
            }
            _ => None,
        }
    }
}
