//! Store and fetcher traits used by the orchestrator.
//!
//! Both are seams: the orchestrator never knows whether records live in
//! LMDB or in memory, or where the fetcher gets its data from.

use std::sync::Arc;

use async_trait::async_trait;
use quickfund_core::{
    EstimateSnapshot, FetchError, FundCode, QuickFundResult, RankingSnapshot, Record,
    ValueSnapshot,
};

use super::recency::RecencySnapshot;

/// Source of fresh fund data, one method per field group.
///
/// Implementations must be cancel-safe: the orchestrator drops in-flight
/// fetches when the batch aborts or a fetch times out.
#[async_trait]
pub trait RecordFetcher: Send + Sync {
    async fn fetch_value(&self, code: &FundCode) -> Result<ValueSnapshot, FetchError>;

    async fn fetch_estimate(&self, code: &FundCode) -> Result<EstimateSnapshot, FetchError>;

    async fn fetch_ranking(&self, code: &FundCode) -> Result<RankingSnapshot, FetchError>;

    /// Fetch all three groups concurrently and combine them.
    ///
    /// Fails with the first group error; a partial record is never returned.
    async fn fetch_full(&self, code: &FundCode) -> Result<Record, FetchError> {
        let (value, estimate, ranking) = futures_util::try_join!(
            self.fetch_value(code),
            self.fetch_estimate(code),
            self.fetch_ranking(code),
        )?;
        Ok(Record::combine(code.clone(), value, estimate, ranking))
    }
}

#[async_trait]
impl<F: RecordFetcher + ?Sized> RecordFetcher for Arc<F> {
    async fn fetch_value(&self, code: &FundCode) -> Result<ValueSnapshot, FetchError> {
        (**self).fetch_value(code).await
    }

    async fn fetch_estimate(&self, code: &FundCode) -> Result<EstimateSnapshot, FetchError> {
        (**self).fetch_estimate(code).await
    }

    async fn fetch_ranking(&self, code: &FundCode) -> Result<RankingSnapshot, FetchError> {
        (**self).fetch_ranking(code).await
    }

    async fn fetch_full(&self, code: &FundCode) -> Result<Record, FetchError> {
        (**self).fetch_full(code).await
    }
}

/// Persistent key-value store for records plus the cache envelope.
///
/// `get`, `put` and `delete` are idempotent. Any error is fatal for the
/// batch that hit it.
pub trait RecordStore: Send + Sync {
    fn get(&self, code: &FundCode) -> QuickFundResult<Option<Record>>;

    /// Insert or overwrite the record under `record.code`.
    fn put(&self, record: &Record) -> QuickFundResult<()>;

    /// Returns `true` if a record was removed.
    fn delete(&self, code: &FundCode) -> QuickFundResult<bool>;

    fn contains(&self, code: &FundCode) -> QuickFundResult<bool> {
        Ok(self.get(code)?.is_some())
    }

    fn keys(&self) -> QuickFundResult<Vec<FundCode>>;

    fn len(&self) -> QuickFundResult<usize>;

    fn is_empty(&self) -> QuickFundResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove every record and all envelope metadata.
    fn clear(&self) -> QuickFundResult<()>;

    fn schema_version(&self) -> QuickFundResult<Option<String>>;

    fn set_schema_version(&self, version: &str) -> QuickFundResult<()>;

    fn load_recency(&self) -> QuickFundResult<Option<RecencySnapshot<FundCode>>>;

    fn save_recency(&self, snapshot: &RecencySnapshot<FundCode>) -> QuickFundResult<()>;
}

macro_rules! forward_record_store {
    ($wrapper:ty) => {
        impl<S: RecordStore + ?Sized> RecordStore for $wrapper {
            fn get(&self, code: &FundCode) -> QuickFundResult<Option<Record>> {
                (**self).get(code)
            }
            fn put(&self, record: &Record) -> QuickFundResult<()> {
                (**self).put(record)
            }
            fn delete(&self, code: &FundCode) -> QuickFundResult<bool> {
                (**self).delete(code)
            }
            fn contains(&self, code: &FundCode) -> QuickFundResult<bool> {
                (**self).contains(code)
            }
            fn keys(&self) -> QuickFundResult<Vec<FundCode>> {
                (**self).keys()
            }
            fn len(&self) -> QuickFundResult<usize> {
                (**self).len()
            }
            fn clear(&self) -> QuickFundResult<()> {
                (**self).clear()
            }
            fn schema_version(&self) -> QuickFundResult<Option<String>> {
                (**self).schema_version()
            }
            fn set_schema_version(&self, version: &str) -> QuickFundResult<()> {
                (**self).set_schema_version(version)
            }
            fn load_recency(&self) -> QuickFundResult<Option<RecencySnapshot<FundCode>>> {
                (**self).load_recency()
            }
            fn save_recency(&self, snapshot: &RecencySnapshot<FundCode>) -> QuickFundResult<()> {
                (**self).save_recency(snapshot)
            }
        }
    };
}

forward_record_store!(Box<S>);
forward_record_store!(Arc<S>);

/// Counters for one `get_or_refresh` batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshStats {
    /// Keys requested after de-duplication.
    pub requested: u64,
    /// Groups served from the store without fetching.
    pub fresh_hits: u64,
    /// Groups refreshed successfully on cached records.
    pub groups_refreshed: u64,
    /// Whole-record fetches for keys that were not cached.
    pub full_fetches: u64,
    /// Failed fetches of any kind.
    pub failures: u64,
    /// Records evicted after the batch.
    pub evictions: u64,
}

impl RefreshStats {
    /// Fraction of looked-at groups that did not need a fetch.
    pub fn hit_rate(&self) -> f64 {
        let looked_at = self.fresh_hits + self.groups_refreshed + self.failures + self.full_fetches * 3;
        if looked_at == 0 {
            0.0
        } else {
            self.fresh_hits as f64 / looked_at as f64
        }
    }

    pub fn fetches(&self) -> u64 {
        self.groups_refreshed + self.full_fetches + self.failures
    }
}
