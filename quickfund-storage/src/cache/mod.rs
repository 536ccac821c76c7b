//! Staleness-aware record cache with LRU eviction.
//!
//! # Design Philosophy
//!
//! A fund record is three independently published datasets glued together.
//! Refetching the whole record whenever any part may have moved wastes most
//! of the network round trips, so freshness is decided per field group by
//! [`StalenessPolicy`] and only stale groups are fetched again. Every rule
//! fails closed: when in doubt, refetch.
//!
//! The store is bounded by [`RecencyList`], an LRU order with amortized
//! O(1) touch and eviction. Eviction only runs after a whole batch, so a
//! record refreshed in a batch is never evicted by that batch unless the
//! batch alone exceeds capacity.
//!
//! # Example
//!
//! ```ignore
//! let config = CacheConfig::from_env();
//! let store = Arc::new(quickfund_storage::open_store(&config)?);
//! let cache = CacheOrchestrator::open(store, Arc::new(fetcher), config)?;
//!
//! let outcome = cache.get_or_refresh(&codes).await?;
//! for (code, errors) in &outcome.errors {
//!     tracing::warn!(%code, count = errors.len(), "partial refresh");
//! }
//! ```

pub mod lmdb_backend;
pub mod orchestrator;
pub mod recency;
pub mod staleness;
pub mod traits;

pub use lmdb_backend::{LmdbRecordStore, LmdbStoreError};
pub use orchestrator::{CacheOrchestrator, RefreshOutcome};
pub use recency::{RecencyList, RecencySnapshot, COMPACTION_THRESHOLD};
pub use staleness::StalenessPolicy;
pub use traits::{RecordFetcher, RecordStore, RefreshStats};
