//! QuickFund Storage - Record Cache and Store Implementations
//!
//! Defines the record store abstraction, the LMDB and in-memory stores, and
//! the orchestrator that keeps cached fund records fresh.

pub mod cache;

pub use cache::{
    CacheOrchestrator, LmdbRecordStore, LmdbStoreError, RecencyList, RecencySnapshot,
    RecordFetcher, RecordStore, RefreshOutcome, RefreshStats, StalenessPolicy,
    COMPACTION_THRESHOLD,
};

use quickfund_core::{
    CacheConfig, FundCode, QuickFundResult, Record, StorageError,
};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

// ============================================================================
// STORE SELECTION
// ============================================================================

/// Open the store described by `config`.
///
/// With `disable_cache` set the store lives in memory and nothing is read
/// from or written to `cache_dir`.
pub fn open_store(config: &CacheConfig) -> QuickFundResult<Box<dyn RecordStore>> {
    config.validate()?;

    if config.disable_cache {
        tracing::debug!("cache disabled, using in-memory record store");
        return Ok(Box::new(InMemoryRecordStore::new()));
    }

    let store = LmdbRecordStore::open(&config.cache_dir, config.map_size_mb).map_err(|e| {
        StorageError::Open {
            path: config.cache_dir.display().to_string(),
            reason: e.to_string(),
        }
    })?;
    Ok(Box::new(store))
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<FundCode, Record>,
    schema_version: Option<String>,
    recency: Option<RecencySnapshot<FundCode>>,
}

/// In-memory record store.
///
/// Used when caching is disabled and in tests. Cloning shares the
/// underlying state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecordStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> QuickFundResult<std::sync::RwLockReadGuard<'_, MemoryState>> {
        self.state.read().map_err(|_| StorageError::LockPoisoned.into())
    }

    fn write(&self) -> QuickFundResult<std::sync::RwLockWriteGuard<'_, MemoryState>> {
        self.state.write().map_err(|_| StorageError::LockPoisoned.into())
    }
}

impl RecordStore for InMemoryRecordStore {
    fn get(&self, code: &FundCode) -> QuickFundResult<Option<Record>> {
        Ok(self.read()?.records.get(code).cloned())
    }

    fn put(&self, record: &Record) -> QuickFundResult<()> {
        self.write()?.records.insert(record.code.clone(), record.clone());
        Ok(())
    }

    fn delete(&self, code: &FundCode) -> QuickFundResult<bool> {
        Ok(self.write()?.records.remove(code).is_some())
    }

    fn contains(&self, code: &FundCode) -> QuickFundResult<bool> {
        Ok(self.read()?.records.contains_key(code))
    }

    fn keys(&self) -> QuickFundResult<Vec<FundCode>> {
        Ok(self.read()?.records.keys().cloned().collect())
    }

    fn len(&self) -> QuickFundResult<usize> {
        Ok(self.read()?.records.len())
    }

    fn clear(&self) -> QuickFundResult<()> {
        *self.write()? = MemoryState::default();
        Ok(())
    }

    fn schema_version(&self) -> QuickFundResult<Option<String>> {
        Ok(self.read()?.schema_version.clone())
    }

    fn set_schema_version(&self, version: &str) -> QuickFundResult<()> {
        self.write()?.schema_version = Some(version.to_string());
        Ok(())
    }

    fn load_recency(&self) -> QuickFundResult<Option<RecencySnapshot<FundCode>>> {
        Ok(self.read()?.recency.clone())
    }

    fn save_recency(&self, snapshot: &RecencySnapshot<FundCode>) -> QuickFundResult<()> {
        self.write()?.recency = Some(snapshot.clone());
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
