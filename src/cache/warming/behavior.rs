//! Behaviour profile.
//!
//! What the reader has been doing: recently viewed articles, the tags and
//! categories they read most, and route-to-route navigation counts. Every
//! collection is bounded; inserting past the bound evicts the oldest or the
//! least frequent item.

use serde::{Deserialize, Serialize};

const MAX_RECENT_ARTICLES: usize = 10;
const MAX_RANKED: usize = 5;
const MAX_NAVIGATION_PATTERNS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentArticle {
    pub slug: String,
    /// Unix milliseconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCount {
    pub slug: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationPattern {
    pub from: String,
    pub to: String,
    pub count: u64,
}

/// Persisted as JSON under `beekeeper.behavior`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BehaviorProfile {
    pub recent_articles: Vec<RecentArticle>,
    pub frequent_tags: Vec<TagCount>,
    /// Category slugs, most viewed first.
    pub preferred_categories: Vec<String>,
    pub navigation_patterns: Vec<NavigationPattern>,
    category_counts: Vec<TagCount>,
}

impl BehaviorProfile {
    /// Record an article view; `now_ms` is the view time in unix milliseconds.
    pub fn record_article_view(
        &mut self,
        slug: &str,
        tags: &[String],
        category: Option<&str>,
        now_ms: i64,
    ) {
        self.recent_articles.retain(|recent| recent.slug != slug);
        self.recent_articles.insert(
            0,
            RecentArticle {
                slug: slug.to_string(),
                timestamp: now_ms,
            },
        );
        self.recent_articles.truncate(MAX_RECENT_ARTICLES);

        for tag in tags {
            self.record_tag(tag);
        }
        if let Some(category) = category {
            self.record_category(category);
        }
    }

    pub fn record_tag(&mut self, slug: &str) {
        bump_ranked(&mut self.frequent_tags, slug);
    }

    pub fn record_category(&mut self, slug: &str) {
        bump_ranked(&mut self.category_counts, slug);
        self.preferred_categories = self
            .category_counts
            .iter()
            .map(|category| category.slug.clone())
            .collect();
    }

    pub fn record_navigation(&mut self, from: &str, to: &str) {
        if from == to {
            return;
        }
        if let Some(position) = self
            .navigation_patterns
            .iter()
            .position(|pattern| pattern.from == from && pattern.to == to)
        {
            let mut pattern = self.navigation_patterns.remove(position);
            pattern.count += 1;
            self.navigation_patterns.insert(0, pattern);
        } else {
            self.navigation_patterns.insert(
                0,
                NavigationPattern {
                    from: from.to_string(),
                    to: to.to_string(),
                    count: 1,
                },
            );
            self.navigation_patterns.truncate(MAX_NAVIGATION_PATTERNS);
        }
    }

    pub fn top_tag(&self) -> Option<&str> {
        self.frequent_tags.first().map(|tag| tag.slug.as_str())
    }

    pub fn top_category(&self) -> Option<&str> {
        self.preferred_categories.first().map(String::as_str)
    }

    /// Most frequent destination from `route`, if any navigation was seen.
    pub fn likely_next(&self, route: &str) -> Option<&str> {
        self.navigation_patterns
            .iter()
            .filter(|pattern| pattern.from == route)
            .max_by_key(|pattern| pattern.count)
            .map(|pattern| pattern.to.as_str())
    }

    pub fn recent_slugs(&self) -> impl Iterator<Item = &str> {
        self.recent_articles.iter().map(|recent| recent.slug.as_str())
    }
}

/// Count a view of `slug` in a top-N list. Newcomers enter ahead of older
/// items with the same count, so the oldest of the least viewed is evicted.
fn bump_ranked(ranked: &mut Vec<TagCount>, slug: &str) {
    match ranked.iter().position(|item| item.slug == slug) {
        Some(position) => ranked[position].count += 1,
        None => ranked.insert(
            0,
            TagCount {
                slug: slug.to_string(),
                count: 1,
            },
        ),
    }
    ranked.sort_by(|a, b| b.count.cmp(&a.count));
    ranked.truncate(MAX_RANKED);
}
