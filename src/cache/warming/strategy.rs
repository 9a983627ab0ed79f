//! Warming strategies.
//!
//! A strategy names the signals it reacts to and turns a `WarmContext` plus
//! the behaviour profile into prefetch targets. The engine does the fetching.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::behavior::BehaviorProfile;
use super::predict::{PrefetchTarget, Route, predict};

pub const SIGNAL_APP_INIT: &str = "app.init";
pub const SIGNAL_ARTICLE_VIEW: &str = "article.view";
pub const SIGNAL_USER_LOGIN: &str = "user.login";
pub const SIGNAL_LINK_HOVER: &str = "link.hover";
pub const SIGNAL_SCROLL_BOTTOM: &str = "scroll.bottom";
pub const SIGNAL_IDLE: &str = "idle";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    #[default]
    Reader,
    Author,
    Admin,
}

/// Inputs a strategy may use.
#[derive(Debug, Clone, Default)]
pub struct WarmContext {
    /// Current route path.
    pub route: String,
    pub article_id: Option<i64>,
    pub article_slug: Option<String>,
    pub user_id: Option<i64>,
    pub role: UserRole,
    /// Route of the link under the pointer.
    pub hovered: Option<String>,
    pub max_predictions: usize,
}

impl WarmContext {
    pub fn at(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            ..Default::default()
        }
    }

    pub fn parsed_route(&self) -> Route {
        Route::parse(&self.route)
    }
}

pub type PrefetchFn = dyn Fn(&WarmContext, &BehaviorProfile) -> Vec<PrefetchTarget> + Send + Sync;

#[derive(Clone)]
pub struct Strategy {
    pub name: String,
    pub priority: Priority,
    pub triggers: Vec<String>,
    prefetch: Arc<PrefetchFn>,
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strategy")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("triggers", &self.triggers)
            .finish_non_exhaustive()
    }
}

impl Strategy {
    pub fn new<F>(name: impl Into<String>, priority: Priority, triggers: &[&str], prefetch: F) -> Self
    where
        F: Fn(&WarmContext, &BehaviorProfile) -> Vec<PrefetchTarget> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            priority,
            triggers: triggers.iter().map(|t| t.to_string()).collect(),
            prefetch: Arc::new(prefetch),
        }
    }

    pub fn responds_to(&self, signal: &str) -> bool {
        self.triggers.iter().any(|trigger| trigger == signal)
    }

    pub fn targets(&self, context: &WarmContext, profile: &BehaviorProfile) -> Vec<PrefetchTarget> {
        (self.prefetch)(context, profile)
    }
}

/// The strategies every engine starts with.
pub fn builtin() -> Vec<Strategy> {
    vec![
        Strategy::new("app-init", Priority::Critical, &[SIGNAL_APP_INIT], |_, _| {
            vec![PrefetchTarget::first_page(), PrefetchTarget::PopularTags]
        }),
        Strategy::new("article-view", Priority::High, &[SIGNAL_ARTICLE_VIEW], |ctx, _| {
            let Some(article_id) = ctx.article_id else {
                return Vec::new();
            };
            vec![
                PrefetchTarget::Related { article_id },
                PrefetchTarget::Comments { article_id },
            ]
        }),
        Strategy::new("user-login", Priority::High, &[SIGNAL_USER_LOGIN], |ctx, _| {
            let mut targets = vec![PrefetchTarget::CurrentUser];
            let Some(user_id) = ctx.user_id else {
                return targets;
            };
            targets.push(PrefetchTarget::UserProfile { user_id });
            if matches!(ctx.role, UserRole::Author | UserRole::Admin) {
                targets.push(PrefetchTarget::UserArticles { user_id });
            }
            if ctx.role == UserRole::Admin {
                targets.push(PrefetchTarget::Applications);
            }
            targets
        }),
        Strategy::new(
            "navigation-predict",
            Priority::Medium,
            &[SIGNAL_LINK_HOVER, SIGNAL_SCROLL_BOTTOM],
            |ctx, profile| {
                let mut targets: Vec<PrefetchTarget> = ctx
                    .hovered
                    .as_deref()
                    .and_then(|hovered| Route::parse(hovered).target())
                    .into_iter()
                    .collect();
                targets.extend(predict(
                    &ctx.parsed_route(),
                    profile,
                    &ctx.route,
                    ctx.max_predictions,
                ));
                targets.truncate(ctx.max_predictions);
                targets
            },
        ),
        Strategy::new("idle-prefetch", Priority::Low, &[SIGNAL_IDLE], |ctx, profile| {
            predict(&ctx.parsed_route(), profile, &ctx.route, ctx.max_predictions)
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(name: &str) -> Strategy {
        builtin()
            .into_iter()
            .find(|s| s.name == name)
            .expect("builtin strategy")
    }

    #[test]
    fn priorities_order_critical_first() {
        let mut strategies = builtin();
        strategies.sort_by_key(|s| s.priority);
        assert_eq!(strategies[0].name, "app-init");
        assert_eq!(strategies.last().map(|s| s.name.as_str()), Some("idle-prefetch"));
    }

    #[test]
    fn user_login_depends_on_role() {
        let login = strategy("user-login");
        let reader = WarmContext {
            user_id: Some(3),
            ..Default::default()
        };
        assert_eq!(login.targets(&reader, &BehaviorProfile::default()).len(), 2);

        let admin = WarmContext {
            user_id: Some(3),
            role: UserRole::Admin,
            ..Default::default()
        };
        let targets = login.targets(&admin, &BehaviorProfile::default());
        assert!(targets.contains(&PrefetchTarget::UserArticles { user_id: 3 }));
        assert!(targets.contains(&PrefetchTarget::Applications));
    }

    #[test]
    fn navigation_predict_puts_hovered_link_first() {
        let navigate = strategy("navigation-predict");
        assert!(navigate.responds_to(SIGNAL_LINK_HOVER));
        assert!(navigate.responds_to(SIGNAL_SCROLL_BOTTOM));

        let ctx = WarmContext {
            route: "/".into(),
            hovered: Some("/articles/9".into()),
            max_predictions: 5,
            ..Default::default()
        };
        let targets = navigate.targets(&ctx, &BehaviorProfile::default());
        assert_eq!(
            targets[0],
            PrefetchTarget::Article {
                id: Some(9),
                slug: None
            }
        );
        assert!(targets.len() <= 5);
    }

    #[test]
    fn article_view_needs_an_id() {
        let view = strategy("article-view");
        assert!(view.targets(&WarmContext::default(), &BehaviorProfile::default()).is_empty());
    }
}
