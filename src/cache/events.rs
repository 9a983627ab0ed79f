//! Domain events.
//!
//! Feature code announces what changed through a closed set of events with
//! typed payloads; the invalidation manager maps each kind to its rules.
//! Events can be emitted immediately or queued for a batched flush.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use super::lock;

const SOURCE: &str = "cache::events";

/// Monotonic epoch for ordering events within this process.
pub type Epoch = u64;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleCreated {
    pub article_id: Option<i64>,
    pub slug: Option<String>,
    /// Owner of the new article.
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleUpdated {
    pub article_id: i64,
    pub slug: Option<String>,
    pub user_id: Option<i64>,
    #[serde(default)]
    pub tags_changed: bool,
    #[serde(default)]
    pub status_changed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleDeleted {
    pub article_id: i64,
    pub slug: Option<String>,
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentChange {
    pub article_id: i64,
    pub comment_id: Option<i64>,
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikeToggled {
    pub article_id: i64,
    pub slug: Option<String>,
    #[serde(rename = "isLiked", alias = "is_liked")]
    pub is_liked: bool,
    #[serde(rename = "likeCount", alias = "like_count")]
    pub like_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagChange {
    pub tag_id: Option<i64>,
    pub slug: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserUpdated {
    pub user_id: i64,
}

/// Everything that can change cached data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum DomainEvent {
    #[serde(rename = "article.created")]
    ArticleCreated(ArticleCreated),
    #[serde(rename = "article.updated")]
    ArticleUpdated(ArticleUpdated),
    #[serde(rename = "article.deleted")]
    ArticleDeleted(ArticleDeleted),
    #[serde(rename = "comment.created")]
    CommentCreated(CommentChange),
    #[serde(rename = "comment.updated")]
    CommentUpdated(CommentChange),
    #[serde(rename = "comment.deleted")]
    CommentDeleted(CommentChange),
    #[serde(rename = "like.toggled")]
    LikeToggled(LikeToggled),
    #[serde(rename = "tag.created")]
    TagCreated(TagChange),
    #[serde(rename = "tag.updated")]
    TagUpdated(TagChange),
    #[serde(rename = "tag.deleted")]
    TagDeleted(TagChange),
    #[serde(rename = "user.updated")]
    UserUpdated(UserUpdated),
    #[serde(rename = "time.hourly")]
    HourlyTick,
    #[serde(rename = "time.daily")]
    DailyTick,
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ArticleCreated(_) => EventKind::ArticleCreated,
            Self::ArticleUpdated(_) => EventKind::ArticleUpdated,
            Self::ArticleDeleted(_) => EventKind::ArticleDeleted,
            Self::CommentCreated(_) => EventKind::CommentCreated,
            Self::CommentUpdated(_) => EventKind::CommentUpdated,
            Self::CommentDeleted(_) => EventKind::CommentDeleted,
            Self::LikeToggled(_) => EventKind::LikeToggled,
            Self::TagCreated(_) => EventKind::TagCreated,
            Self::TagUpdated(_) => EventKind::TagUpdated,
            Self::TagDeleted(_) => EventKind::TagDeleted,
            Self::UserUpdated(_) => EventKind::UserUpdated,
            Self::HourlyTick => EventKind::HourlyTick,
            Self::DailyTick => EventKind::DailyTick,
        }
    }
}

/// Payload-free discriminant of a `DomainEvent`; the rule table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ArticleCreated,
    ArticleUpdated,
    ArticleDeleted,
    CommentCreated,
    CommentUpdated,
    CommentDeleted,
    LikeToggled,
    TagCreated,
    TagUpdated,
    TagDeleted,
    UserUpdated,
    HourlyTick,
    DailyTick,
}

impl EventKind {
    pub const ALL: [EventKind; 13] = [
        Self::ArticleCreated,
        Self::ArticleUpdated,
        Self::ArticleDeleted,
        Self::CommentCreated,
        Self::CommentUpdated,
        Self::CommentDeleted,
        Self::LikeToggled,
        Self::TagCreated,
        Self::TagUpdated,
        Self::TagDeleted,
        Self::UserUpdated,
        Self::HourlyTick,
        Self::DailyTick,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ArticleCreated => "article.created",
            Self::ArticleUpdated => "article.updated",
            Self::ArticleDeleted => "article.deleted",
            Self::CommentCreated => "comment.created",
            Self::CommentUpdated => "comment.updated",
            Self::CommentDeleted => "comment.deleted",
            Self::LikeToggled => "like.toggled",
            Self::TagCreated => "tag.created",
            Self::TagUpdated => "tag.updated",
            Self::TagDeleted => "tag.deleted",
            Self::UserUpdated => "user.updated",
            Self::HourlyTick => "time.hourly",
            Self::DailyTick => "time.daily",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event stamped for idempotency and ordering.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub id: Uuid,
    pub epoch: Epoch,
    pub event: DomainEvent,
    pub timestamp: OffsetDateTime,
}

impl CacheEvent {
    pub fn new(event: DomainEvent, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            event,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// In-memory FIFO of events awaiting a batched flush.
pub struct EventQueue {
    queue: Mutex<VecDeque<CacheEvent>>,
    epoch_counter: AtomicU64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Stamp and enqueue an event.
    pub fn publish(&self, event: DomainEvent) -> CacheEvent {
        let stamped = CacheEvent::new(event, self.next_epoch());
        info!(
            event_id = %stamped.id,
            event_epoch = stamped.epoch,
            event_kind = %stamped.event.kind(),
            "Cache event enqueued"
        );
        lock::lock(&self.queue, SOURCE, "publish").push_back(stamped.clone());
        stamped
    }

    /// Drain up to `limit` events in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<CacheEvent> {
        let mut queue = lock::lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        queue.drain(..count).collect()
    }

    pub fn len(&self) -> usize {
        lock::lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock::lock(&self.queue, SOURCE, "clear").clear();
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
