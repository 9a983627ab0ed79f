//! Warming engine.
//!
//! Observes navigation signals, keeps the behaviour profile, and runs
//! strategies whose targets are fetched through `CacheLayer::fetch`, so warmed
//! entries are ordinary cache entries. Prefetch failures are counted and
//! logged, never returned.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use futures::future::join_all;
use metrics::histogram;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, info, warn};

use super::behavior::BehaviorProfile;
use super::predict::{ArticleRef, PrefetchTarget, Route};
use super::strategy::{
    self, SIGNAL_APP_INIT, SIGNAL_ARTICLE_VIEW, SIGNAL_IDLE, SIGNAL_LINK_HOVER,
    SIGNAL_SCROLL_BOTTOM, SIGNAL_USER_LOGIN, Strategy, UserRole, WarmContext,
};
use crate::cache::fetcher::Fetcher;
use crate::cache::keys::{self, QueryKey};
use crate::cache::layer::CacheLayer;
use crate::cache::lock;
use crate::cache::persist::{
    self, PROFILE_STORAGE_KEY, PersistError, ProfileStorage, load_json, save_json, unix_millis,
};

const SOURCE: &str = "cache::warming";
const METRIC_CACHE_WARM_MS: &str = "beekeeper_cache_warm_ms";

/// Result of one prefetch target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmOutcome {
    Warmed,
    Failed,
    /// Blocked by a guard; nothing was fetched.
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WarmReport {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl WarmReport {
    fn record(&mut self, outcome: WarmOutcome) {
        match outcome {
            WarmOutcome::Warmed => self.succeeded += 1,
            WarmOutcome::Failed => self.failed += 1,
            WarmOutcome::Skipped => self.skipped += 1,
        }
    }

    fn absorb(&mut self, other: WarmReport) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct StrategyStats {
    pub runs: u64,
    pub successful: u64,
    pub failed: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct WarmingStats {
    pub total_warmups: u64,
    pub successful_warmups: u64,
    pub failed_warmups: u64,
    pub skipped_warmups: u64,
    pub by_strategy: BTreeMap<String, StrategyStats>,
    pub average_duration_ms: f64,
}

#[derive(Default)]
struct StatsState {
    stats: WarmingStats,
    timed: u64,
    total_duration_ms: f64,
}

pub struct WarmingEngine {
    layer: Arc<CacheLayer>,
    fetcher: Arc<dyn Fetcher>,
    storage: Arc<dyn ProfileStorage>,
    strategies: RwLock<Vec<Strategy>>,
    profile: Mutex<BehaviorProfile>,
    current: Mutex<WarmContext>,
    stats: Mutex<StatsState>,
    idle: Mutex<Option<JoinHandle<()>>>,
    idle_delay: Duration,
    max_predictions: usize,
    snapshot_max_age: Duration,
}

impl WarmingEngine {
    /// Construct an engine with the built-in strategies and an empty profile.
    pub fn create(
        layer: Arc<CacheLayer>,
        fetcher: Arc<dyn Fetcher>,
        storage: Arc<dyn ProfileStorage>,
    ) -> Arc<Self> {
        let config = layer.config();
        let max_predictions = config.max_predictions;
        Arc::new(Self {
            idle_delay: config.idle_prefetch_delay(),
            snapshot_max_age: config.snapshot_max_age(),
            max_predictions,
            layer,
            fetcher,
            storage,
            strategies: RwLock::new(strategy::builtin()),
            profile: Mutex::new(BehaviorProfile::default()),
            current: Mutex::new(WarmContext {
                route: "/".to_string(),
                max_predictions,
                ..Default::default()
            }),
            stats: Mutex::new(StatsState::default()),
            idle: Mutex::new(None),
        })
    }

    /// Add a strategy; one with the same name is replaced.
    pub fn register(&self, strategy: Strategy) {
        let mut strategies = lock::write(&self.strategies, SOURCE, "register");
        strategies.retain(|existing| existing.name != strategy.name);
        debug!(strategy = %strategy.name, priority = ?strategy.priority, "warming strategy registered");
        strategies.push(strategy);
    }

    pub fn strategy_names(&self) -> Vec<String> {
        lock::read(&self.strategies, SOURCE, "strategy_names")
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    // ========================================================================
    // Profile persistence
    // ========================================================================

    /// Load the persisted profile. A missing or unreadable profile starts empty.
    pub async fn load_profile(&self) {
        match load_json::<BehaviorProfile>(self.storage.as_ref(), PROFILE_STORAGE_KEY).await {
            Ok(Some(profile)) => {
                debug!(recent = profile.recent_articles.len(), "behaviour profile loaded");
                *lock::lock(&self.profile, SOURCE, "load_profile") = profile;
            }
            Ok(None) => {}
            Err(error) => warn!(error = %error, "behaviour profile unreadable; starting empty"),
        }
    }

    pub async fn persist_profile(&self) -> Result<(), PersistError> {
        let profile = self.profile();
        save_json(self.storage.as_ref(), PROFILE_STORAGE_KEY, &profile).await
    }

    pub fn profile(&self) -> BehaviorProfile {
        lock::lock(&self.profile, SOURCE, "profile").clone()
    }

    /// Save user-profile and tag entries for the next start.
    pub async fn persist_critical(&self) -> usize {
        persist::persist_critical(&self.layer, self.storage.as_ref())
            .await
            .unwrap_or_else(|error| {
                warn!(error = %error, "critical snapshot not saved");
                0
            })
    }

    /// Restore critical entries saved within the configured max age.
    pub async fn restore_critical(&self) -> usize {
        persist::restore_critical(&self.layer, self.storage.as_ref(), self.snapshot_max_age)
            .await
            .unwrap_or_else(|error| {
                warn!(error = %error, "critical snapshot not restored");
                0
            })
    }

    // ========================================================================
    // Signals
    // ========================================================================

    /// Move to `route`, recording the transition and restarting the idle timer.
    pub fn navigate(self: &Arc<Self>, route: &str) {
        let previous = {
            let mut current = lock::lock(&self.current, SOURCE, "navigate");
            let previous = std::mem::replace(&mut current.route, route.to_string());
            match Route::parse(route) {
                Route::ArticleDetail(ArticleRef::Id(id)) => {
                    current.article_id = Some(id);
                    current.article_slug = None;
                }
                Route::ArticleDetail(ArticleRef::Slug(slug)) => {
                    current.article_id = None;
                    current.article_slug = Some(slug);
                }
                _ => {
                    current.article_id = None;
                    current.article_slug = None;
                }
            }
            current.hovered = None;
            previous
        };
        lock::lock(&self.profile, SOURCE, "navigate.profile").record_navigation(&previous, route);
        self.record_input();
    }

    /// Restart the idle timer; idle-prefetch runs once input stops.
    pub fn record_input(self: &Arc<Self>) {
        let engine = Arc::downgrade(self);
        let delay = self.idle_delay;
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            if let Some(engine) = engine.upgrade() {
                engine.signal(SIGNAL_IDLE).await;
            }
        });
        if let Some(previous) = lock::lock(&self.idle, SOURCE, "record_input").replace(handle) {
            previous.abort();
        }
    }

    pub async fn app_init(&self) -> WarmReport {
        self.signal(SIGNAL_APP_INIT).await
    }

    /// The reader opened an article.
    pub async fn article_view(
        self: &Arc<Self>,
        article_id: Option<i64>,
        slug: &str,
        tags: &[String],
        category: Option<&str>,
    ) -> WarmReport {
        if let Some(id) = article_id {
            self.layer.link_article(id, slug);
        }
        {
            let mut current = lock::lock(&self.current, SOURCE, "article_view");
            current.article_id = article_id.or(current.article_id);
            current.article_slug = Some(slug.to_string());
        }
        lock::lock(&self.profile, SOURCE, "article_view.profile").record_article_view(
            slug,
            tags,
            category,
            unix_millis(OffsetDateTime::now_utc()),
        );
        if let Err(error) = self.persist_profile().await {
            warn!(error = %error, "behaviour profile not saved");
        }
        self.record_input();
        self.signal(SIGNAL_ARTICLE_VIEW).await
    }

    pub async fn user_login(&self, user_id: i64, role: UserRole) -> WarmReport {
        {
            let mut current = lock::lock(&self.current, SOURCE, "user_login");
            current.user_id = Some(user_id);
            current.role = role;
        }
        self.signal(SIGNAL_USER_LOGIN).await
    }

    /// The pointer rests on a link to `route`.
    pub async fn link_hover(self: &Arc<Self>, route: &str) -> WarmReport {
        self.record_input();
        let mut context = self.context();
        context.hovered = Some(route.to_string());
        self.run_signal(SIGNAL_LINK_HOVER, &context).await
    }

    pub async fn scroll_near_bottom(self: &Arc<Self>) -> WarmReport {
        self.record_input();
        self.signal(SIGNAL_SCROLL_BOTTOM).await
    }

    /// Run every strategy listening to `signal`, highest priority first.
    pub async fn signal(&self, signal: &str) -> WarmReport {
        let context = self.context();
        self.run_signal(signal, &context).await
    }

    async fn run_signal(&self, signal: &str, context: &WarmContext) -> WarmReport {
        let mut strategies: Vec<Strategy> = lock::read(&self.strategies, SOURCE, "signal")
            .iter()
            .filter(|s| s.responds_to(signal))
            .cloned()
            .collect();
        strategies.sort_by_key(|s| s.priority);

        let mut report = WarmReport::default();
        for strategy in strategies {
            report.absorb(self.run_strategy(&strategy, context).await);
        }
        report
    }

    /// Run one strategy by name with an explicit context.
    pub async fn warm(&self, name: &str, context: Option<WarmContext>) -> WarmReport {
        let strategy = lock::read(&self.strategies, SOURCE, "warm")
            .iter()
            .find(|s| s.name == name)
            .cloned();
        let Some(strategy) = strategy else {
            warn!(strategy = name, "unknown warming strategy");
            return WarmReport::default();
        };
        let mut context = context.unwrap_or_else(|| self.context());
        if context.max_predictions == 0 {
            context.max_predictions = self.max_predictions;
        }
        self.run_strategy(&strategy, &context).await
    }

    async fn run_strategy(&self, strategy: &Strategy, context: &WarmContext) -> WarmReport {
        let targets = strategy.targets(context, &self.profile());
        let outcomes = join_all(
            targets
                .iter()
                .map(|target| self.prefetch_timed(&strategy.name, target, context)),
        )
        .await;

        let mut report = WarmReport::default();
        for outcome in outcomes {
            report.record(outcome);
        }

        let mut state = lock::lock(&self.stats, SOURCE, "run_strategy");
        let per_strategy = state.stats.by_strategy.entry(strategy.name.clone()).or_default();
        per_strategy.runs += 1;
        per_strategy.successful += report.succeeded as u64;
        per_strategy.failed += report.failed as u64;
        per_strategy.skipped += report.skipped as u64;
        drop(state);

        info!(
            strategy = %strategy.name,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "warming strategy finished"
        );
        report
    }

    // ========================================================================
    // Prefetch path
    // ========================================================================

    /// Prefetch one target outside any strategy, guarded by the current view.
    pub async fn prefetch(&self, target: &PrefetchTarget) -> WarmOutcome {
        let context = self.context();
        self.prefetch_timed("direct", target, &context).await
    }

    async fn prefetch_timed(
        &self,
        strategy: &str,
        target: &PrefetchTarget,
        context: &WarmContext,
    ) -> WarmOutcome {
        let Some(key) = target.key() else {
            debug!(strategy, ?target, "prefetch target has no key");
            return self.finish(WarmOutcome::Skipped, None);
        };
        if let Some(reason) = self.guard(target, &key, context) {
            debug!(strategy, %key, reason, "prefetch skipped");
            return self.finish(WarmOutcome::Skipped, None);
        }

        let started = Instant::now();
        let outcome = match self.layer.fetch_with(&key, Arc::clone(&self.fetcher)).await {
            Ok(_) => WarmOutcome::Warmed,
            Err(error) => {
                warn!(strategy, %key, error = %error, "prefetch failed");
                WarmOutcome::Failed
            }
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_CACHE_WARM_MS, "strategy" => strategy.to_string()).record(elapsed_ms);
        self.finish(outcome, Some(elapsed_ms))
    }

    fn finish(&self, outcome: WarmOutcome, elapsed_ms: Option<f64>) -> WarmOutcome {
        let mut state = lock::lock(&self.stats, SOURCE, "finish");
        state.stats.total_warmups += 1;
        match outcome {
            WarmOutcome::Warmed => state.stats.successful_warmups += 1,
            WarmOutcome::Failed => state.stats.failed_warmups += 1,
            WarmOutcome::Skipped => state.stats.skipped_warmups += 1,
        }
        if let Some(elapsed_ms) = elapsed_ms {
            state.timed += 1;
            state.total_duration_ms += elapsed_ms;
            state.stats.average_duration_ms = state.total_duration_ms / state.timed as f64;
        }
        outcome
    }

    /// Reason to leave `target` alone while the reader is on the view
    /// described by `context`.
    fn guard(
        &self,
        target: &PrefetchTarget,
        key: &QueryKey,
        context: &WarmContext,
    ) -> Option<&'static str> {
        let Route::ArticleDetail(reference) = context.parsed_route() else {
            return None;
        };
        if target.is_general_list() {
            return Some("general list while on article detail");
        }
        if self.viewed_article_keys(context, reference).contains(key) {
            return Some("article currently viewed");
        }
        None
    }

    fn viewed_article_keys(&self, context: &WarmContext, reference: ArticleRef) -> Vec<QueryKey> {
        let (mut id, mut slug) = (context.article_id, context.article_slug.clone());
        match reference {
            ArticleRef::Id(from_route) => id = id.or(Some(from_route)),
            ArticleRef::Slug(from_route) => slug = slug.or(Some(from_route)),
        }

        let mut viewed = Vec::new();
        if let Some(id) = id {
            viewed.push(keys::article_detail(id));
            viewed.extend(self.layer.slug_key_for_id(id));
        }
        if let Some(slug) = &slug {
            viewed.push(keys::article_slug(slug));
            viewed.extend(self.layer.id_key_for_slug(slug));
        }
        viewed
    }

    fn context(&self) -> WarmContext {
        let mut context = lock::lock(&self.current, SOURCE, "context").clone();
        context.max_predictions = self.max_predictions;
        context
    }

    pub fn stats(&self) -> WarmingStats {
        lock::lock(&self.stats, SOURCE, "stats").stats.clone()
    }

    pub fn is_idle_timer_armed(&self) -> bool {
        lock::lock(&self.idle, SOURCE, "idle_armed")
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the idle timer and persist the profile.
    pub async fn dispose(&self) {
        if let Some(handle) = lock::lock(&self.idle, SOURCE, "dispose").take() {
            handle.abort();
        }
        if let Err(error) = self.persist_profile().await {
            warn!(error = %error, "behaviour profile not saved on dispose");
        }
        info!("warming engine disposed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{Value, json};

    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::fetcher::FnFetcher;
    use crate::cache::persist::MemoryStorage;
    use crate::cache::retry::FetchError;

    struct Harness {
        engine: Arc<WarmingEngine>,
        layer: Arc<CacheLayer>,
        calls: Arc<AtomicUsize>,
        storage: Arc<MemoryStorage>,
    }

    fn harness(fail: bool) -> Harness {
        let layer = CacheLayer::create(CacheConfig {
            max_retries: 0,
            ..Default::default()
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let fetcher = Arc::new(FnFetcher(move |key: QueryKey| {
            counted.fetch_add(1, Ordering::SeqCst);
            async move {
                if fail {
                    Err(FetchError::network("offline"))
                } else {
                    Ok(json!({"key": key.serialized()}))
                }
            }
        }));
        let storage = MemoryStorage::new();
        let engine = WarmingEngine::create(Arc::clone(&layer), fetcher, storage.clone());
        Harness {
            engine,
            layer,
            calls,
            storage,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn app_init_warms_first_page() {
        let h = harness(false);
        let report = h.engine.app_init().await;
        assert_eq!(report.succeeded, 2);
        assert!(h.layer.read(&keys::article_list(json!({}))).is_some());
        assert!(h.layer.read(&keys::popular_tags()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn currently_viewed_article_is_never_prefetched() {
        let h = harness(false);
        h.engine.navigate("/articles/42");

        let outcome = h
            .engine
            .prefetch(&PrefetchTarget::Article {
                id: Some(42),
                slug: None,
            })
            .await;
        assert_eq!(outcome, WarmOutcome::Skipped);
        let list = h.engine.prefetch(&PrefetchTarget::first_page()).await;
        assert_eq!(list, WarmOutcome::Skipped);
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.engine.stats().skipped_warmups, 2);
        h.engine.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_context_guards_the_viewed_article() {
        let h = harness(false);
        let context = WarmContext {
            article_id: Some(42),
            hovered: Some("/articles/42".to_string()),
            ..WarmContext::at("/articles/42")
        };

        let report = h.engine.warm("navigation-predict", Some(context)).await;

        assert_eq!(report.skipped, 2);
        assert_eq!(report.succeeded, 2);
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
        assert!(h.layer.read(&keys::article_detail(42)).is_none());
        assert!(h.layer.read(&keys::article_list(json!({}))).is_none());
        assert!(h.layer.read(&keys::article_related(42)).is_some());
        h.engine.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn filtered_lists_pass_the_detail_guard() {
        let h = harness(false);
        h.engine.navigate("/articles/42");
        let filtered = PrefetchTarget::ArticleList {
            filters: json!({"page": 3, "status": "draft"}),
        };
        assert_eq!(h.engine.prefetch(&filtered).await, WarmOutcome::Warmed);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        h.engine.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_counted_not_raised() {
        let h = harness(true);
        let report = h.engine.app_init().await;
        assert_eq!(report.failed, 2);
        let stats = h.engine.stats();
        assert_eq!(stats.failed_warmups, 2);
        assert_eq!(stats.by_strategy["app-init"].failed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_prefetch_runs_after_quiet_period() {
        let h = harness(false);
        h.engine.navigate("/");
        sleep(Duration::from_millis(2_000)).await;
        h.engine.record_input();
        sleep(Duration::from_millis(2_000)).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(1_500)).await;
        assert!(h.calls.load(Ordering::SeqCst) > 0);
        assert_eq!(h.engine.stats().by_strategy["idle-prefetch"].runs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_stops_idle_timer_and_saves_profile() {
        let h = harness(false);
        h.engine.navigate("/articles");
        h.engine
            .article_view(Some(7), "hive-care", &["bees".into()], Some("care"))
            .await;
        assert!(h.engine.is_idle_timer_armed());

        h.engine.dispose().await;
        assert!(!h.engine.is_idle_timer_armed());
        sleep(Duration::from_secs(10)).await;
        assert!(h.engine.stats().by_strategy.get("idle-prefetch").is_none());

        let saved = h
            .storage
            .load(PROFILE_STORAGE_KEY)
            .await
            .expect("load")
            .expect("profile saved");
        let profile: Value = serde_json::from_str(&saved).expect("json");
        assert_eq!(profile["recentArticles"][0]["slug"], "hive-care");
    }

    #[tokio::test(start_paused = true)]
    async fn article_view_warms_related_and_comments() {
        let h = harness(false);
        h.engine.navigate("/articles/7");
        let report = h
            .engine
            .article_view(Some(7), "hive-care", &[], None)
            .await;
        assert_eq!(report.succeeded, 2);
        assert!(h.layer.read(&keys::article_related(7)).is_some());
        assert!(h.layer.read(&keys::article_comments(7)).is_some());
        h.engine.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_strategy_is_a_no_op() {
        let h = harness(false);
        assert_eq!(h.engine.warm("mobile-sticky", None).await, WarmReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn profile_survives_reload() {
        let h = harness(false);
        h.engine
            .article_view(None, "smoker-basics", &["tools".into()], None)
            .await;
        h.engine.dispose().await;

        let reloaded = WarmingEngine::create(
            Arc::clone(&h.layer),
            Arc::new(FnFetcher(|_key: QueryKey| async { Ok::<_, FetchError>(Value::Null) })),
            h.storage.clone(),
        );
        reloaded.load_profile().await;
        assert_eq!(reloaded.profile().top_tag(), Some("tools"));
    }
}
