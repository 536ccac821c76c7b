//! QuickFund Core - Data Model
//!
//! Fund codes, records and their field groups, the trading calendar, the
//! error taxonomy and configuration. All other crates depend on this one.
//! Nothing here performs I/O except [`telemetry::init_tracing`].

pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod market;
pub mod record;
pub mod telemetry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    default_cache_dir, CacheConfig, CACHE_APP_NAME, DEFAULT_CACHE_CAPACITY,
    DEFAULT_FETCH_TIMEOUT_SECS, DEFAULT_MAP_SIZE_MB, SCHEMA_VERSION,
};
pub use error::{
    ConfigError, FetchError, QuickFundError, QuickFundResult, RecencyError, StorageError,
    ValidationError,
};
pub use identity::FundCode;
pub use market::{Session, TradingCalendar, MARKET_UTC_OFFSET_SECS};
pub use record::{
    EstimateSnapshot, FieldGroup, Rank, RankingSnapshot, Record, SnapshotUpdate, ValueSnapshot,
};
pub use telemetry::{init_tracing, TelemetryConfig};
