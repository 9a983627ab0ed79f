//! Invalidation manager.
//!
//! Maps domain events to cache invalidations through a rule table. Each rule
//! writes into its own `InvalidationPlan`; a failing or panicking rule is
//! counted and skipped while the remaining rules still apply. Patches edit
//! cached articles in place under both their id and slug keys.
//!
//! The manager also owns the time-based ticks (`time.hourly`, `time.daily`)
//! and a batched queue for callers that prefer to coalesce bursts of events.

use std::collections::{BTreeMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use metrics::counter;
use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Duration, MissedTickBehavior, interval, sleep};
use tracing::{debug, info, instrument, warn};

use super::events::{DomainEvent, EventKind, EventQueue};
use super::keys::{self, KeyToken, QueryKey};
use super::layer::CacheLayer;
use super::lock;
use super::planner::{InvalidationPlan, PatchAction};

const SOURCE: &str = "cache::invalidation";
const METRIC_CACHE_INVALIDATION_TOTAL: &str = "beekeeper_cache_invalidation_total";

/// A rule rejected an event.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct RuleError(String);

impl RuleError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }

    fn mismatch(expected: EventKind, event: &DomainEvent) -> Self {
        Self(format!(
            "rule for `{expected}` received `{}`",
            event.kind()
        ))
    }
}

pub type RuleResult = Result<(), RuleError>;
type RuleFn = dyn Fn(&DomainEvent, &mut InvalidationPlan) -> RuleResult + Send + Sync;

struct Rule {
    name: String,
    handler: Box<RuleFn>,
}

/// Outcome of one emitted event or flushed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitReport {
    pub prefixes: usize,
    pub entries: usize,
    pub patches: usize,
    pub cascades: u64,
    pub failed_rules: usize,
}

/// Snapshot of manager counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationStats {
    pub events_emitted: u64,
    /// Prefix invalidations executed.
    pub total_invalidations: u64,
    /// Cache entries marked stale by those invalidations.
    pub entries_invalidated: u64,
    pub cascade_invalidations: u64,
    pub patches_applied: u64,
    pub failed_rules: u64,
    pub by_event: BTreeMap<&'static str, u64>,
}

#[derive(Default)]
struct Counters {
    events_emitted: AtomicU64,
    total_invalidations: AtomicU64,
    entries_invalidated: AtomicU64,
    cascade_invalidations: AtomicU64,
    patches_applied: AtomicU64,
    failed_rules: AtomicU64,
}

/// Event-driven invalidation over one `CacheLayer`.
pub struct InvalidationManager {
    layer: Arc<CacheLayer>,
    rules: RwLock<BTreeMap<&'static str, Vec<Arc<Rule>>>>,
    counters: Counters,
    by_event: Mutex<BTreeMap<&'static str, u64>>,
    queue: EventQueue,
    flush_scheduled: AtomicBool,
    batch_delay: Duration,
    batch_limit: usize,
    ticks: Mutex<Vec<JoinHandle<()>>>,
    flushes: Mutex<JoinSet<()>>,
}

impl InvalidationManager {
    /// Construct a manager with the default rule table.
    pub fn create(layer: Arc<CacheLayer>) -> Arc<Self> {
        let manager = Self::bare(layer);
        register_default_rules(&manager);
        Arc::new(manager)
    }

    /// Construct a manager with an empty rule table.
    pub fn without_rules(layer: Arc<CacheLayer>) -> Arc<Self> {
        Arc::new(Self::bare(layer))
    }

    fn bare(layer: Arc<CacheLayer>) -> Self {
        let config = layer.config();
        Self {
            batch_delay: config.batch_delay(),
            batch_limit: config.batch_limit.max(1),
            layer,
            rules: RwLock::new(BTreeMap::new()),
            counters: Counters::default(),
            by_event: Mutex::new(BTreeMap::new()),
            queue: EventQueue::new(),
            flush_scheduled: AtomicBool::new(false),
            ticks: Mutex::new(Vec::new()),
            flushes: Mutex::new(JoinSet::new()),
        }
    }

    pub fn layer(&self) -> &Arc<CacheLayer> {
        &self.layer
    }

    // ========================================================================
    // Rule table
    // ========================================================================

    /// Register a rule for `kind`. Rules run in registration order.
    pub fn add_rule<F>(&self, kind: EventKind, name: impl Into<String>, handler: F)
    where
        F: Fn(&DomainEvent, &mut InvalidationPlan) -> RuleResult + Send + Sync + 'static,
    {
        let rule = Arc::new(Rule {
            name: name.into(),
            handler: Box::new(handler),
        });
        debug!(event_kind = %kind, rule = %rule.name, "registered invalidation rule");
        lock::write(&self.rules, SOURCE, "add_rule")
            .entry(kind.as_str())
            .or_default()
            .push(rule);
    }

    /// Remove every rule registered for `kind`.
    pub fn clear_rules(&self, kind: EventKind) -> usize {
        lock::write(&self.rules, SOURCE, "clear_rules")
            .remove(kind.as_str())
            .map_or(0, |rules| rules.len())
    }

    pub fn rule_count(&self, kind: EventKind) -> usize {
        lock::read(&self.rules, SOURCE, "rule_count")
            .get(kind.as_str())
            .map_or(0, Vec::len)
    }

    // ========================================================================
    // Emission
    // ========================================================================

    /// Run every rule for `event` and execute the resulting plan immediately.
    /// Never fails; rule errors are logged and counted.
    #[instrument(skip_all, fields(event_kind = %event.kind()))]
    pub fn emit(&self, event: DomainEvent) -> EmitReport {
        let (plan, failed_rules) = self.plan_for(&event);
        let mut report = self.execute(&plan);
        report.failed_rules = failed_rules;
        info!(plan = %plan, entries = report.entries, failed_rules, "cache event applied");
        report
    }

    fn plan_for(&self, event: &DomainEvent) -> (InvalidationPlan, usize) {
        let kind = event.kind();
        self.counters.events_emitted.fetch_add(1, Ordering::Relaxed);
        *lock::lock(&self.by_event, SOURCE, "emit.by_event")
            .entry(kind.as_str())
            .or_default() += 1;

        let rules: Vec<Arc<Rule>> = lock::read(&self.rules, SOURCE, "emit.rules")
            .get(kind.as_str())
            .cloned()
            .unwrap_or_default();
        if rules.is_empty() {
            warn!(
                event_kind = %kind,
                warning = "cache_consistency",
                "no invalidation rule registered for event"
            );
        }

        let mut plan = InvalidationPlan::default();
        let mut failed = 0;
        for rule in rules {
            let mut partial = InvalidationPlan::default();
            let outcome = catch_unwind(AssertUnwindSafe(|| (rule.handler)(event, &mut partial)));
            match outcome {
                Ok(Ok(())) => plan.merge(partial),
                Ok(Err(error)) => {
                    failed += 1;
                    warn!(event_kind = %kind, rule = %rule.name, error = %error, "invalidation rule failed");
                }
                Err(_) => {
                    failed += 1;
                    warn!(event_kind = %kind, rule = %rule.name, "invalidation rule panicked");
                }
            }
        }
        self.counters
            .failed_rules
            .fetch_add(failed as u64, Ordering::Relaxed);
        (plan, failed)
    }

    fn execute(&self, plan: &InvalidationPlan) -> EmitReport {
        let mut report = EmitReport {
            cascades: plan.cascades,
            ..Default::default()
        };
        for prefix in plan.prefixes() {
            report.entries += self.invalidate_prefix(prefix);
            report.prefixes += 1;
        }
        for action in &plan.patches {
            report.patches += self.apply_patch(action);
        }
        self.counters
            .cascade_invalidations
            .fetch_add(plan.cascades, Ordering::Relaxed);
        report
    }

    /// Invalidate every entry under `prefix`. Article detail and slug keys also
    /// invalidate their counterpart through the id/slug index.
    pub fn invalidate_prefix(&self, prefix: &QueryKey) -> usize {
        let mut entries = self.layer.invalidate(prefix);
        if let Some(counterpart) = self.counterpart(prefix) {
            entries += self.layer.invalidate(&counterpart);
        }
        self.counters
            .total_invalidations
            .fetch_add(1, Ordering::Relaxed);
        self.counters
            .entries_invalidated
            .fetch_add(entries as u64, Ordering::Relaxed);
        counter!(METRIC_CACHE_INVALIDATION_TOTAL).increment(1);
        entries
    }

    fn counterpart(&self, key: &QueryKey) -> Option<QueryKey> {
        match key.tokens() {
            [KeyToken::Str(root), KeyToken::Str(kind), KeyToken::Int(id)]
                if root == "articles" && kind == "detail" =>
            {
                self.layer.slug_key_for_id(*id)
            }
            [KeyToken::Str(root), KeyToken::Str(kind), KeyToken::Str(slug)]
                if root == "articles" && kind == "slug" =>
            {
                self.layer.id_key_for_slug(slug)
            }
            _ => None,
        }
    }

    /// Apply a patch to the id-keyed and slug-keyed entries of its article.
    /// Returns the number of entries edited.
    fn apply_patch(&self, action: &PatchAction) -> usize {
        let article_id = action.article_id();
        if let Some(slug) = action.slug() {
            self.layer.link_article(article_id, slug);
        }

        let mut targets = vec![keys::article_detail(article_id)];
        if let Some(slug_key) = action
            .slug()
            .map(keys::article_slug)
            .or_else(|| self.layer.slug_key_for_id(article_id))
        {
            targets.push(slug_key);
        }

        let mut seen = HashSet::new();
        let mut applied = 0;
        for key in targets {
            if !seen.insert(key.clone()) || self.layer.read(&key).is_none() {
                continue;
            }
            if self.layer.patch(&key, |data| action.apply(data)) {
                applied += 1;
            }
        }
        if applied == 0 {
            debug!(article_id, "patch found no cached article entries");
        }
        self.counters
            .patches_applied
            .fetch_add(applied as u64, Ordering::Relaxed);
        applied
    }

    // ========================================================================
    // Batched emission
    // ========================================================================

    /// Queue `event`; queued events are flushed together after the batch delay.
    pub fn enqueue(self: &Arc<Self>, event: DomainEvent) {
        self.queue.publish(event);
        if self.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::downgrade(self);
        let delay = self.batch_delay;
        let mut flushes = lock::lock(&self.flushes, SOURCE, "enqueue");
        while flushes.try_join_next().is_some() {}
        flushes.spawn(async move {
            sleep(delay).await;
            if let Some(manager) = manager.upgrade() {
                manager.flush_scheduled.store(false, Ordering::SeqCst);
                manager.flush();
            }
        });
    }

    /// Apply every queued event as one merged plan.
    pub fn flush(&self) -> EmitReport {
        let mut total = EmitReport::default();
        loop {
            let events = self.queue.drain(self.batch_limit);
            if events.is_empty() {
                return total;
            }

            let mut seen_ids = HashSet::new();
            let mut merged = InvalidationPlan::default();
            let mut failed_rules = 0;
            let count = events.len();
            for stamped in events.into_iter().filter(|e| seen_ids.insert(e.id)) {
                let (plan, failed) = self.plan_for(&stamped.event);
                merged.merge(plan);
                failed_rules += failed;
            }

            let report = self.execute(&merged);
            info!(event_count = count, plan = %merged, "cache event batch applied");
            total.prefixes += report.prefixes;
            total.entries += report.entries;
            total.patches += report.patches;
            total.cascades += report.cascades;
            total.failed_rules += failed_rules;
        }
    }

    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    // ========================================================================
    // Scheduler
    // ========================================================================

    /// Start the hourly and daily ticks. Calling twice restarts them.
    pub fn start(self: &Arc<Self>) {
        let config = self.layer.config();
        let hourly = spawn_tick(Arc::downgrade(self), config.hourly_tick(), DomainEvent::HourlyTick);
        let daily = spawn_tick(Arc::downgrade(self), config.daily_tick(), DomainEvent::DailyTick);

        let mut ticks = lock::lock(&self.ticks, SOURCE, "start");
        for previous in ticks.drain(..) {
            previous.abort();
        }
        ticks.push(hourly);
        ticks.push(daily);
        info!("invalidation ticks started");
    }

    /// Stop the ticks and any pending batch flush.
    pub fn stop(&self) {
        let mut ticks = lock::lock(&self.ticks, SOURCE, "stop");
        let running = !ticks.is_empty();
        for handle in ticks.drain(..) {
            handle.abort();
        }
        drop(ticks);
        lock::lock(&self.flushes, SOURCE, "stop").abort_all();
        self.flush_scheduled.store(false, Ordering::SeqCst);
        if running {
            info!("invalidation ticks stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        !lock::lock(&self.ticks, SOURCE, "is_running").is_empty()
    }

    pub fn dispose(&self) {
        self.stop();
        self.queue.clear();
    }

    pub fn stats(&self) -> InvalidationStats {
        let c = &self.counters;
        InvalidationStats {
            events_emitted: c.events_emitted.load(Ordering::Relaxed),
            total_invalidations: c.total_invalidations.load(Ordering::Relaxed),
            entries_invalidated: c.entries_invalidated.load(Ordering::Relaxed),
            cascade_invalidations: c.cascade_invalidations.load(Ordering::Relaxed),
            patches_applied: c.patches_applied.load(Ordering::Relaxed),
            failed_rules: c.failed_rules.load(Ordering::Relaxed),
            by_event: lock::lock(&self.by_event, SOURCE, "stats").clone(),
        }
    }
}

fn spawn_tick(
    manager: Weak<InvalidationManager>,
    period: Duration,
    event: DomainEvent,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(manager) = manager.upgrade() else {
                break;
            };
            manager.emit(event.clone());
        }
    })
}

// ============================================================================
// Default rule table
// ============================================================================

fn register_default_rules(manager: &InvalidationManager) {
    manager.add_rule(EventKind::ArticleCreated, "article-lists", |event, plan| {
        let DomainEvent::ArticleCreated(payload) = event else {
            return Err(RuleError::mismatch(EventKind::ArticleCreated, event));
        };
        plan.invalidate(keys::article_lists())
            .invalidate(keys::article_search())
            .invalidate(keys::popular_tags());
        if let Some(user_id) = payload.user_id {
            plan.invalidate(keys::user_articles(user_id));
        }
        Ok(())
    });

    manager.add_rule(EventKind::ArticleUpdated, "article-detail", |event, plan| {
        let DomainEvent::ArticleUpdated(payload) = event else {
            return Err(RuleError::mismatch(EventKind::ArticleUpdated, event));
        };
        plan.invalidate(keys::article_detail(payload.article_id))
            .invalidate(keys::article_related(payload.article_id))
            .invalidate(keys::article_lists());
        if let Some(slug) = &payload.slug {
            plan.invalidate(keys::article_slug(slug));
        }
        if let Some(user_id) = payload.user_id {
            plan.invalidate(keys::user_articles(user_id));
        }
        Ok(())
    });

    manager.add_rule(EventKind::ArticleUpdated, "tag-cascade", |event, plan| {
        if let DomainEvent::ArticleUpdated(payload) = event
            && payload.tags_changed
        {
            plan.cascade([keys::tags(), keys::tagged_articles()]);
        }
        Ok(())
    });

    manager.add_rule(EventKind::ArticleUpdated, "status-cascade", |event, plan| {
        if let DomainEvent::ArticleUpdated(payload) = event
            && payload.status_changed
        {
            plan.cascade(keys::all_article_lists());
        }
        Ok(())
    });

    manager.add_rule(EventKind::ArticleDeleted, "article-family", |event, plan| {
        let DomainEvent::ArticleDeleted(payload) = event else {
            return Err(RuleError::mismatch(EventKind::ArticleDeleted, event));
        };
        plan.invalidate(keys::articles())
            .invalidate(keys::article_comments(payload.article_id))
            .invalidate(keys::popular_tags());
        Ok(())
    });

    for kind in [
        EventKind::CommentCreated,
        EventKind::CommentUpdated,
        EventKind::CommentDeleted,
    ] {
        manager.add_rule(kind, "comment-list", move |event, plan| {
            let (DomainEvent::CommentCreated(payload)
            | DomainEvent::CommentUpdated(payload)
            | DomainEvent::CommentDeleted(payload)) = event
            else {
                return Err(RuleError::mismatch(kind, event));
            };
            plan.invalidate(keys::article_comments(payload.article_id));
            let delta = match event {
                DomainEvent::CommentCreated(_) => 1,
                DomainEvent::CommentDeleted(_) => -1,
                _ => 0,
            };
            if delta != 0 {
                plan.patch(PatchAction::CommentCount {
                    article_id: payload.article_id,
                    delta,
                });
            }
            Ok(())
        });
    }

    manager.add_rule(EventKind::LikeToggled, "like-patch", |event, plan| {
        let DomainEvent::LikeToggled(payload) = event else {
            return Err(RuleError::mismatch(EventKind::LikeToggled, event));
        };
        plan.patch(PatchAction::LikeCount {
            article_id: payload.article_id,
            slug: payload.slug.clone(),
            is_liked: payload.is_liked,
            like_count: payload.like_count,
        });
        Ok(())
    });

    for kind in [EventKind::TagCreated, EventKind::TagUpdated, EventKind::TagDeleted] {
        manager.add_rule(kind, "tag-family", move |event, plan| {
            match event {
                DomainEvent::TagCreated(_) | DomainEvent::TagUpdated(_) => {
                    plan.invalidate(keys::tags());
                }
                DomainEvent::TagDeleted(_) => {
                    plan.invalidate(keys::tags())
                        .invalidate(keys::article_lists());
                }
                _ => return Err(RuleError::mismatch(kind, event)),
            }
            Ok(())
        });
    }

    manager.add_rule(EventKind::UserUpdated, "user-family", |event, plan| {
        let DomainEvent::UserUpdated(payload) = event else {
            return Err(RuleError::mismatch(EventKind::UserUpdated, event));
        };
        plan.invalidate(keys::user_profile(payload.user_id))
            .invalidate(keys::user_articles(payload.user_id))
            .invalidate(keys::user_comments(payload.user_id));
        Ok(())
    });

    manager.add_rule(EventKind::HourlyTick, "search-refresh", |_, plan| {
        plan.invalidate(keys::article_search())
            .invalidate(keys::search());
        Ok(())
    });

    manager.add_rule(EventKind::DailyTick, "popular-refresh", |_, plan| {
        plan.invalidate(keys::article_popular())
            .invalidate(keys::popular_tags());
        Ok(())
    });
}
