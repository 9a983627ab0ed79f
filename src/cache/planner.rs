//! Invalidation plans.
//!
//! Rules do not touch the cache directly; they describe what should happen in
//! an `InvalidationPlan`. Plans from several rules (or several queued events)
//! are merged so each prefix is invalidated once.

use std::collections::HashSet;
use std::fmt;

use serde_json::{Value, json};

use super::keys::QueryKey;

const LIKE_COUNT_FIELDS: [&str; 3] = ["likes", "like_count", "likes_count"];
const LIKED_FLAG_FIELDS: [&str; 2] = ["is_liked", "liked_by_me"];
const COMMENT_COUNT_FIELDS: [&str; 2] = ["comment_count", "comments_count"];

/// In-place edit of a cached article, applied to both its id and slug entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchAction {
    LikeCount {
        article_id: i64,
        slug: Option<String>,
        is_liked: bool,
        like_count: i64,
    },
    CommentCount {
        article_id: i64,
        delta: i64,
    },
}

impl PatchAction {
    pub fn article_id(&self) -> i64 {
        match self {
            Self::LikeCount { article_id, .. } | Self::CommentCount { article_id, .. } => {
                *article_id
            }
        }
    }

    pub fn slug(&self) -> Option<&str> {
        match self {
            Self::LikeCount { slug, .. } => slug.as_deref(),
            Self::CommentCount { .. } => None,
        }
    }

    /// Apply the edit to an article payload. Non-object payloads are left alone.
    pub fn apply(&self, data: &mut Value) {
        let Some(article) = data.as_object_mut() else {
            return;
        };
        match self {
            Self::LikeCount {
                is_liked,
                like_count,
                ..
            } => {
                let mut counted = false;
                for field in LIKE_COUNT_FIELDS {
                    if let Some(slot) = article.get_mut(field) {
                        *slot = json!(like_count);
                        counted = true;
                    }
                }
                if !counted {
                    article.insert(LIKE_COUNT_FIELDS[0].to_string(), json!(like_count));
                }

                let mut flagged = false;
                for field in LIKED_FLAG_FIELDS {
                    if let Some(slot) = article.get_mut(field) {
                        *slot = json!(is_liked);
                        flagged = true;
                    }
                }
                if !flagged {
                    article.insert(LIKED_FLAG_FIELDS[0].to_string(), json!(is_liked));
                }
            }
            Self::CommentCount { delta, .. } => {
                // Without a known base count there is nothing safe to adjust.
                for field in COMMENT_COUNT_FIELDS {
                    if let Some(slot) = article.get_mut(field)
                        && let Some(current) = slot.as_i64()
                    {
                        *slot = json!((current + delta).max(0));
                    }
                }
            }
        }
    }
}

/// Work produced by the rules for one or more events.
#[derive(Debug, Default, Clone)]
pub struct InvalidationPlan {
    prefixes: Vec<QueryKey>,
    seen: HashSet<QueryKey>,
    pub patches: Vec<PatchAction>,
    /// Derived invalidations fired by conditional rules.
    pub cascades: u64,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InvalidationPlan {{ invalidate: {}, patches: {}, cascades: {} }}",
            self.prefixes.len(),
            self.patches.len(),
            self.cascades,
        )
    }
}

impl InvalidationPlan {
    /// Queue a prefix for invalidation. Duplicates are ignored.
    pub fn invalidate(&mut self, prefix: QueryKey) -> &mut Self {
        if self.seen.insert(prefix.clone()) {
            self.prefixes.push(prefix);
        }
        self
    }

    /// Queue a derived group of invalidations and count it as one cascade.
    pub fn cascade(&mut self, prefixes: impl IntoIterator<Item = QueryKey>) -> &mut Self {
        self.cascades += 1;
        for prefix in prefixes {
            self.invalidate(prefix);
        }
        self
    }

    pub fn patch(&mut self, action: PatchAction) -> &mut Self {
        self.patches.push(action);
        self
    }

    /// Prefixes in insertion order.
    pub fn prefixes(&self) -> &[QueryKey] {
        &self.prefixes
    }

    pub fn contains(&self, prefix: &QueryKey) -> bool {
        self.seen.contains(prefix)
    }

    pub fn merge(&mut self, other: InvalidationPlan) {
        for prefix in other.prefixes {
            self.invalidate(prefix);
        }
        self.patches.extend(other.patches);
        self.cascades += other.cascades;
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty() && self.patches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::keys;

    #[test]
    fn duplicate_prefixes_are_merged() {
        let mut plan = InvalidationPlan::default();
        plan.invalidate(keys::article_lists())
            .invalidate(keys::article_lists())
            .invalidate(keys::popular_tags());
        assert_eq!(plan.prefixes().len(), 2);

        let mut other = InvalidationPlan::default();
        other
            .cascade([keys::tags(), keys::article_lists()])
            .invalidate(keys::popular_tags());
        plan.merge(other);
        assert_eq!(plan.prefixes().len(), 3);
        assert_eq!(plan.cascades, 1);
        assert!(plan.contains(&keys::tags()));
    }

    #[test]
    fn like_patch_updates_existing_fields() {
        let mut article = json!({"id": 42, "likes": 10, "is_liked": false, "title": "Hives"});
        PatchAction::LikeCount {
            article_id: 42,
            slug: None,
            is_liked: true,
            like_count: 11,
        }
        .apply(&mut article);
        assert_eq!(article["likes"], json!(11));
        assert_eq!(article["is_liked"], json!(true));
        assert_eq!(article["title"], json!("Hives"));
    }

    #[test]
    fn like_patch_inserts_missing_fields() {
        let mut article = json!({"id": 42});
        PatchAction::LikeCount {
            article_id: 42,
            slug: None,
            is_liked: false,
            like_count: 3,
        }
        .apply(&mut article);
        assert_eq!(article["likes"], json!(3));
        assert_eq!(article["is_liked"], json!(false));
    }

    #[test]
    fn comment_patch_never_goes_negative() {
        let mut article = json!({"comment_count": 0});
        PatchAction::CommentCount {
            article_id: 1,
            delta: -1,
        }
        .apply(&mut article);
        assert_eq!(article["comment_count"], json!(0));

        let mut untouched = json!({"id": 1});
        PatchAction::CommentCount {
            article_id: 1,
            delta: 1,
        }
        .apply(&mut untouched);
        assert_eq!(untouched, json!({"id": 1}));
    }

    #[test]
    fn display_format() {
        let plan = InvalidationPlan::default();
        let display = format!("{plan}");
        assert!(display.contains("InvalidationPlan"));
        assert!(display.contains("invalidate: 0"));
        assert!(plan.is_empty());
    }
}
