//! Routes, prefetch targets and next-step prediction.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::behavior::BehaviorProfile;
use crate::cache::keys::{self, QueryKey};

/// A parsed client route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Home,
    ArticleList,
    /// `/articles/42` or `/articles/hive-care`.
    ArticleDetail(ArticleRef),
    Tag(String),
    Category(String),
    User(i64),
    Search,
    Admin,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArticleRef {
    Id(i64),
    Slug(String),
}

impl Route {
    pub fn parse(path: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        match segments.as_slice() {
            [] => Self::Home,
            ["articles"] => Self::ArticleList,
            ["articles", reference] => Self::ArticleDetail(match reference.parse::<i64>() {
                Ok(id) => ArticleRef::Id(id),
                Err(_) => ArticleRef::Slug((*reference).to_string()),
            }),
            ["tags", slug] => Self::Tag((*slug).to_string()),
            ["categories", slug] => Self::Category((*slug).to_string()),
            ["users", id] => match id.parse() {
                Ok(id) => Self::User(id),
                Err(_) => Self::Other(path.to_string()),
            },
            ["search", ..] => Self::Search,
            ["admin", ..] => Self::Admin,
            _ => Self::Other(path.to_string()),
        }
    }

    /// What a visit to this route would load first.
    pub fn target(&self) -> Option<PrefetchTarget> {
        match self {
            Self::Home | Self::ArticleList => Some(PrefetchTarget::first_page()),
            Self::ArticleDetail(ArticleRef::Id(id)) => Some(PrefetchTarget::Article {
                id: Some(*id),
                slug: None,
            }),
            Self::ArticleDetail(ArticleRef::Slug(slug)) => Some(PrefetchTarget::Article {
                id: None,
                slug: Some(slug.clone()),
            }),
            Self::Tag(slug) => Some(PrefetchTarget::TagArticles { tag: slug.clone() }),
            Self::Category(slug) => Some(PrefetchTarget::CategoryArticles {
                category: slug.clone(),
            }),
            Self::User(id) => Some(PrefetchTarget::UserProfile { user_id: *id }),
            Self::Search | Self::Admin | Self::Other(_) => None,
        }
    }
}

/// Something the engine may fetch ahead of time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "snake_case")]
pub enum PrefetchTarget {
    Article {
        id: Option<i64>,
        slug: Option<String>,
    },
    ArticleList {
        #[serde(default)]
        filters: Value,
    },
    Related {
        article_id: i64,
    },
    Comments {
        article_id: i64,
    },
    TagArticles {
        tag: String,
    },
    CategoryArticles {
        category: String,
    },
    PopularTags,
    CurrentUser,
    UserProfile {
        user_id: i64,
    },
    UserArticles {
        user_id: i64,
    },
    Applications,
    Key(QueryKey),
}

impl PrefetchTarget {
    /// First page of the default article list.
    pub fn first_page() -> Self {
        Self::ArticleList {
            filters: json!({"page": 1}),
        }
    }

    pub fn key(&self) -> Option<QueryKey> {
        Some(match self {
            Self::Article { id: Some(id), .. } => keys::article_detail(*id),
            Self::Article {
                id: None,
                slug: Some(slug),
            } => keys::article_slug(slug),
            Self::Article { .. } => return None,
            Self::ArticleList { filters } => keys::article_list(filters_or_empty(filters)),
            Self::Related { article_id } => keys::article_related(*article_id),
            Self::Comments { article_id } => keys::article_comments(*article_id),
            Self::TagArticles { tag } => keys::articles_by_tag(tag),
            Self::CategoryArticles { category } => keys::articles_by_category(category),
            Self::PopularTags => keys::popular_tags(),
            Self::CurrentUser => keys::current_user(),
            Self::UserProfile { user_id } => keys::user_profile(*user_id),
            Self::UserArticles { user_id } => keys::user_articles(*user_id),
            Self::Applications => keys::applications(),
            Self::Key(key) => key.clone(),
        })
    }

    /// The default article list: no filters beyond page size, first page only.
    pub fn is_general_list(&self) -> bool {
        let Self::ArticleList { filters } = self else {
            return false;
        };
        match filters {
            Value::Null => true,
            Value::Object(map) => map.iter().all(|(name, value)| match name.as_str() {
                "page" => value.as_i64() == Some(1),
                "limit" => true,
                _ => false,
            }),
            _ => false,
        }
    }
}

fn filters_or_empty(filters: &Value) -> Value {
    if filters.is_null() {
        json!({})
    } else {
        filters.clone()
    }
}

/// Predict the next targets from the current route and the reader's habits.
/// Results are deduplicated by key and capped at `limit`.
pub fn predict(route: &Route, profile: &BehaviorProfile, path: &str, limit: usize) -> Vec<PrefetchTarget> {
    let mut candidates = Vec::new();

    if let Some(next) = profile.likely_next(path) {
        candidates.extend(Route::parse(next).target());
    }

    match route {
        Route::Home => {
            candidates.push(PrefetchTarget::first_page());
            candidates.push(PrefetchTarget::PopularTags);
        }
        Route::ArticleList => {
            candidates.extend(profile.recent_slugs().take(2).map(|slug| PrefetchTarget::Article {
                id: None,
                slug: Some(slug.to_string()),
            }));
        }
        Route::ArticleDetail(reference) => {
            if let ArticleRef::Id(id) = reference {
                candidates.push(PrefetchTarget::Related { article_id: *id });
                candidates.push(PrefetchTarget::Comments { article_id: *id });
            }
            candidates.push(PrefetchTarget::first_page());
        }
        Route::Tag(_) | Route::Category(_) => candidates.push(PrefetchTarget::PopularTags),
        Route::User(_) | Route::Search | Route::Admin | Route::Other(_) => {}
    }

    if let Some(tag) = profile.top_tag() {
        candidates.push(PrefetchTarget::TagArticles {
            tag: tag.to_string(),
        });
    }
    if let Some(category) = profile.top_category() {
        candidates.push(PrefetchTarget::CategoryArticles {
            category: category.to_string(),
        });
    }

    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|target| target.key().is_some_and(|key| seen.insert(key)))
        .take(limit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_blog_routes() {
        assert_eq!(Route::parse("/"), Route::Home);
        assert_eq!(Route::parse("/articles?page=2"), Route::ArticleList);
        assert_eq!(
            Route::parse("/articles/42"),
            Route::ArticleDetail(ArticleRef::Id(42))
        );
        assert_eq!(
            Route::parse("/articles/hive-care/"),
            Route::ArticleDetail(ArticleRef::Slug("hive-care".into()))
        );
        assert_eq!(Route::parse("/tags/honey"), Route::Tag("honey".into()));
        assert_eq!(Route::parse("/admin/users"), Route::Admin);
        assert_eq!(Route::parse("/forum/1"), Route::Other("/forum/1".into()));
    }

    #[test]
    fn target_wire_format() {
        let target: PrefetchTarget =
            serde_json::from_value(json!({"type": "article", "params": {"id": 42}}))
                .expect("article target");
        assert_eq!(target.key(), Some(keys::article_detail(42)));

        let list = PrefetchTarget::first_page();
        assert_eq!(list.key(), Some(keys::article_list(json!({}))));
    }

    #[test]
    fn only_the_default_first_page_is_a_general_list() {
        assert!(PrefetchTarget::first_page().is_general_list());
        assert!(PrefetchTarget::ArticleList { filters: Value::Null }.is_general_list());
        assert!(PrefetchTarget::ArticleList {
            filters: json!({"limit": 8})
        }
        .is_general_list());
        assert!(!PrefetchTarget::ArticleList {
            filters: json!({"page": 3, "status": "draft"})
        }
        .is_general_list());
        assert!(!PrefetchTarget::ArticleList {
            filters: json!({"page": 2})
        }
        .is_general_list());
        assert!(!PrefetchTarget::PopularTags.is_general_list());
    }

    #[test]
    fn predictions_are_capped_and_unique() {
        let mut profile = BehaviorProfile::default();
        profile.record_article_view("a", &["bees".into()], Some("care"), 1);
        profile.record_navigation("/articles/7", "/tags/bees");

        let route = Route::parse("/articles/7");
        let predicted = predict(&route, &profile, "/articles/7", 5);
        assert!(predicted.len() <= 5);
        assert_eq!(
            predicted[0],
            PrefetchTarget::TagArticles { tag: "bees".into() }
        );
        let keys: HashSet<_> = predicted.iter().filter_map(PrefetchTarget::key).collect();
        assert_eq!(keys.len(), predicted.len());

        let capped = predict(&route, &profile, "/articles/7", 2);
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn home_predicts_first_page() {
        let predicted = predict(&Route::Home, &BehaviorProfile::default(), "/", 5);
        assert_eq!(
            predicted,
            vec![PrefetchTarget::first_page(), PrefetchTarget::PopularTags]
        );
    }
}
