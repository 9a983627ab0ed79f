//! Cache trigger service.
//!
//! The imperative API feature code calls after a successful write to announce
//! what changed. Each method builds the matching `DomainEvent` and either
//! applies it immediately or queues it for the next batched flush.

use std::sync::Arc;

use tracing::debug;

use super::events::{
    ArticleCreated, ArticleDeleted, ArticleUpdated, CommentChange, DomainEvent, LikeToggled,
    TagChange, UserUpdated,
};
use super::invalidation::InvalidationManager;

/// Publishes domain events to an `InvalidationManager`.
///
/// # Usage
///
/// ```ignore
/// // After the like endpoint answered:
/// trigger.like_toggled(article.id, Some(&article.slug), true, 11);
/// ```
#[derive(Clone)]
pub struct CacheTrigger {
    enabled: bool,
    manager: Arc<InvalidationManager>,
}

impl CacheTrigger {
    pub fn new(manager: Arc<InvalidationManager>) -> Self {
        Self {
            enabled: manager.layer().config().enabled,
            manager,
        }
    }

    /// Publish an event. With `apply_now` the plan runs before returning,
    /// otherwise the event joins the pending batch.
    pub fn trigger(&self, event: DomainEvent, apply_now: bool) {
        if !self.enabled {
            debug!(event_kind = %event.kind(), "Cache trigger skipped: cache disabled");
            return;
        }

        if apply_now {
            self.manager.emit(event);
        } else {
            self.manager.enqueue(event);
        }
    }

    pub fn article_created(&self, article_id: Option<i64>, slug: Option<&str>, user_id: Option<i64>) {
        self.trigger(
            DomainEvent::ArticleCreated(ArticleCreated {
                article_id,
                slug: slug.map(str::to_string),
                user_id,
            }),
            true,
        );
    }

    pub fn article_updated(&self, payload: ArticleUpdated) {
        self.trigger(DomainEvent::ArticleUpdated(payload), true);
    }

    pub fn article_deleted(&self, article_id: i64, slug: Option<&str>, user_id: Option<i64>) {
        self.trigger(
            DomainEvent::ArticleDeleted(ArticleDeleted {
                article_id,
                slug: slug.map(str::to_string),
                user_id,
            }),
            true,
        );
    }

    pub fn comment_created(&self, article_id: i64, comment_id: Option<i64>) {
        self.trigger(DomainEvent::CommentCreated(comment(article_id, comment_id)), true);
    }

    pub fn comment_updated(&self, article_id: i64, comment_id: Option<i64>) {
        self.trigger(DomainEvent::CommentUpdated(comment(article_id, comment_id)), true);
    }

    pub fn comment_deleted(&self, article_id: i64, comment_id: Option<i64>) {
        self.trigger(DomainEvent::CommentDeleted(comment(article_id, comment_id)), true);
    }

    pub fn like_toggled(&self, article_id: i64, slug: Option<&str>, is_liked: bool, like_count: i64) {
        self.trigger(
            DomainEvent::LikeToggled(LikeToggled {
                article_id,
                slug: slug.map(str::to_string),
                is_liked,
                like_count,
            }),
            true,
        );
    }

    pub fn tag_created(&self, slug: Option<&str>) {
        self.trigger(DomainEvent::TagCreated(tag(slug)), true);
    }

    pub fn tag_updated(&self, slug: Option<&str>) {
        self.trigger(DomainEvent::TagUpdated(tag(slug)), true);
    }

    pub fn tag_deleted(&self, slug: Option<&str>) {
        self.trigger(DomainEvent::TagDeleted(tag(slug)), true);
    }

    pub fn user_updated(&self, user_id: i64) {
        self.trigger(DomainEvent::UserUpdated(UserUpdated { user_id }), true);
    }

    pub fn manager(&self) -> &Arc<InvalidationManager> {
        &self.manager
    }
}

fn comment(article_id: i64, comment_id: Option<i64>) -> CommentChange {
    CommentChange {
        article_id,
        comment_id,
        user_id: None,
    }
}

fn tag(slug: Option<&str>) -> TagChange {
    TagChange {
        tag_id: None,
        slug: slug.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::keys;
    use crate::cache::layer::{CacheLayer, WriteOptions};

    fn create_trigger(enabled: bool) -> CacheTrigger {
        let layer = CacheLayer::create(CacheConfig {
            enabled,
            ..Default::default()
        });
        CacheTrigger::new(InvalidationManager::create(layer))
    }

    #[tokio::test]
    async fn trigger_queues_when_deferred() {
        let trigger = create_trigger(true);
        trigger.trigger(DomainEvent::HourlyTick, false);
        assert_eq!(trigger.manager().pending_events(), 1);
        trigger.manager().dispose();
    }

    #[tokio::test]
    async fn trigger_respects_disabled_config() {
        let trigger = create_trigger(false);
        trigger.tag_created(Some("honey"));
        assert_eq!(trigger.manager().stats().events_emitted, 0);
    }

    #[tokio::test]
    async fn like_toggled_patches_cached_article() {
        let trigger = create_trigger(true);
        let layer = trigger.manager().layer();
        layer.write(&keys::article_detail(42), json!({"id": 42, "likes": 10}), WriteOptions::default());

        trigger.like_toggled(42, None, true, 11);

        let entry = layer.read(&keys::article_detail(42)).expect("article");
        assert_eq!(entry.data["likes"], json!(11));
    }

    #[tokio::test]
    async fn convenience_methods_emit_one_event_each() {
        let trigger = create_trigger(true);

        trigger.article_created(Some(1), Some("first"), Some(9));
        trigger.article_updated(ArticleUpdated {
            article_id: 1,
            ..Default::default()
        });
        trigger.article_deleted(1, Some("first"), None);
        trigger.comment_created(1, Some(2));
        trigger.comment_updated(1, Some(2));
        trigger.comment_deleted(1, Some(2));
        trigger.like_toggled(1, None, false, 0);
        trigger.tag_created(None);
        trigger.tag_updated(None);
        trigger.tag_deleted(None);
        trigger.user_updated(9);

        let stats = trigger.manager().stats();
        assert_eq!(stats.events_emitted, 11);
        assert_eq!(stats.by_event.len(), 11);
        assert_eq!(stats.failed_rules, 0);
    }
}
