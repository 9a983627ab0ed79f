//! Behaviour-driven cache warming.
//!
//! Strategies react to navigation signals and name prefetch targets; the
//! engine fetches them through the cache layer and tracks outcomes.

mod behavior;
mod engine;
mod predict;
mod strategy;

pub use behavior::{BehaviorProfile, NavigationPattern, RecentArticle, TagCount};
pub use engine::{StrategyStats, WarmOutcome, WarmReport, WarmingEngine, WarmingStats};
pub use predict::{ArticleRef, PrefetchTarget, Route, predict};
pub use strategy::{
    PrefetchFn, Priority, SIGNAL_APP_INIT, SIGNAL_ARTICLE_VIEW, SIGNAL_IDLE, SIGNAL_LINK_HOVER,
    SIGNAL_SCROLL_BOTTOM, SIGNAL_USER_LOGIN, Strategy, UserRole, WarmContext, builtin,
};
