//! BeeKeeper cache system
//!
//! Client-side data cache for the BeeKeeper's Blog REST API:
//!
//! - **Entry store**: normalised query keys, LRU-bounded entries, id↔slug index
//! - **Result cache**: stale/GC lifetimes, request dedup, retry with backoff
//! - **Invalidation**: domain events mapped to prefix invalidations, cascades
//!   and in-place patches
//! - **Warming**: behaviour profile and strategies that prefetch ahead of the reader
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `beekeeper.toml`:
//!
//! ```toml
//! [cache]
//! enabled = true
//! max_entries = 2000
//! idle_prefetch_ms = 3000
//! # ... see config.rs for all options
//! ```

mod config;
mod dedup;
mod entry;
pub mod events;
mod fetcher;
mod invalidation;
pub mod keys;
mod layer;
mod lock;
pub mod persist;
mod planner;
mod query;
mod retry;
mod store;
mod trigger;
pub mod warming;

pub use config::{CacheConfig, StaleTimes};
pub use dedup::{DedupStats, FetchResult, RequestDeduplicator};
pub use entry::{CacheEntry, EntryStatus};
pub use events::{CacheEvent, DomainEvent, Epoch, EventKind, EventQueue};
pub use fetcher::{Fetcher, FnFetcher};
pub use invalidation::{
    EmitReport, InvalidationManager, InvalidationStats, RuleError, RuleResult,
};
pub use keys::{EntityClass, KeyToken, QueryKey};
pub use layer::{CacheLayer, CacheStats, WriteOptions};
pub use persist::{FileStorage, MemoryStorage, PersistError, ProfileStorage};
pub use planner::{InvalidationPlan, PatchAction};
pub use query::{Mutation, MutationStatus, QueryState, QueryStatus};
pub use retry::{FetchError, RetryPolicy};
pub use store::EntryStore;
pub use trigger::CacheTrigger;
pub use warming::WarmingEngine;
