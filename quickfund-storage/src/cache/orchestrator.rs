//! Incremental refresh of cached fund records.
//!
//! [`CacheOrchestrator::get_or_refresh`] drives one batch:
//!
//! 1. every requested code is processed concurrently: absent codes get a
//!    full fetch, cached ones get a fetch for each stale group only
//! 2. each code's fetches are awaited together, then merged into the record
//!    and written back under the orchestrator's lock
//! 3. every code that ended up with a record is touched once, in request order
//! 4. least recently used records beyond capacity are evicted
//! 5. the recency order is persisted
//!
//! Fetch failures are collected per code and never abort the batch. Store
//! failures abort it; outstanding fetches are dropped with the batch future.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures_util::future::try_join_all;
use quickfund_core::{
    CacheConfig, Clock, FetchError, FieldGroup, FundCode, QuickFundResult, Record,
    SnapshotUpdate, StorageError, SystemClock,
};

use super::recency::{RecencyList, RecencySnapshot};
use super::staleness::StalenessPolicy;
use super::traits::{RecordFetcher, RecordStore, RefreshStats};

/// Result of one `get_or_refresh` batch.
#[derive(Debug, Clone, Default)]
pub struct RefreshOutcome {
    /// Best known record per requested code. Codes whose first fetch failed
    /// are absent.
    pub records: HashMap<FundCode, Record>,
    /// Fetch failures per code. A code may have both a record and errors
    /// when only some of its groups could be refreshed.
    pub errors: HashMap<FundCode, Vec<FetchError>>,
    /// Codes evicted from the store after the batch.
    pub evicted: Vec<FundCode>,
    pub stats: RefreshStats,
}

impl RefreshOutcome {
    /// Records in the order of `codes`, skipping codes without a record.
    /// Repeated codes yield the same record repeatedly.
    pub fn records_in_order<'a>(&'a self, codes: &'a [FundCode]) -> impl Iterator<Item = &'a Record> + 'a {
        codes.iter().filter_map(|code| self.records.get(code))
    }

    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Outcome of processing a single code.
struct KeyOutcome {
    code: FundCode,
    record: Option<Record>,
    errors: Vec<FetchError>,
    stats: RefreshStats,
}

/// Owns the store handle and recency order for one cache directory.
///
/// # Example
///
/// ```ignore
/// let store = Arc::new(LmdbRecordStore::open(&config.cache_dir, config.map_size_mb)?);
/// let cache = CacheOrchestrator::open(store, Arc::new(fetcher), config)?;
/// let outcome = cache.get_or_refresh(&codes).await?;
/// for record in outcome.records_in_order(&codes) {
///     println!("{}", record.code);
/// }
/// ```
pub struct CacheOrchestrator<S, F> {
    store: Arc<S>,
    fetcher: Arc<F>,
    clock: Arc<dyn Clock>,
    policy: StalenessPolicy,
    config: CacheConfig,
    /// Serializes record write-back, recency mutations and eviction.
    recency: Mutex<RecencyList<FundCode>>,
}

impl<S, F> CacheOrchestrator<S, F>
where
    S: RecordStore,
    F: RecordFetcher,
{
    /// Open the cache on `store`.
    ///
    /// Clears the store when its schema marker differs from
    /// `config.schema_version`, then restores the persisted recency order.
    pub fn open(store: Arc<S>, fetcher: Arc<F>, config: CacheConfig) -> QuickFundResult<Self> {
        config.validate()?;

        let stored_version = store.schema_version()?;
        if stored_version.as_deref() != Some(config.schema_version.as_str()) {
            tracing::info!(
                found = ?stored_version,
                expected = %config.schema_version,
                "schema version mismatch, clearing record store"
            );
            store.clear()?;
            store.set_schema_version(&config.schema_version)?;
        }

        let recency = restore_recency(store.as_ref())?;
        tracing::debug!(tracked = recency.size(), capacity = config.capacity, "record cache opened");

        Ok(Self {
            store,
            fetcher,
            clock: Arc::new(SystemClock),
            policy: StalenessPolicy::default(),
            config,
            recency: Mutex::new(recency),
        })
    }

    /// Use `clock` instead of the wall clock for freshness decisions.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_policy(mut self, policy: StalenessPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> &StalenessPolicy {
        &self.policy
    }

    /// Number of tracked records.
    pub fn len(&self) -> QuickFundResult<usize> {
        Ok(self.lock()?.size())
    }

    pub fn is_empty(&self) -> QuickFundResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn recency_snapshot(&self) -> QuickFundResult<RecencySnapshot<FundCode>> {
        Ok(self.lock()?.snapshot())
    }

    /// Return fresh records for `codes`, fetching only what is missing or stale.
    pub async fn get_or_refresh(&self, codes: &[FundCode]) -> QuickFundResult<RefreshOutcome> {
        let unique = dedupe(codes);
        let now = self.clock.now();

        let per_key = unique.iter().map(|code| self.refresh_one(code, now));
        let results = match try_join_all(per_key).await {
            Ok(results) => results,
            Err(e) => {
                if let Err(resync) = self.track_written(&unique) {
                    tracing::warn!(error = %resync, "could not resync recency after aborted batch");
                }
                return Err(e);
            }
        };

        let mut outcome = RefreshOutcome::default();
        outcome.stats.requested = unique.len() as u64;
        let mut touched = Vec::with_capacity(results.len());

        for key in results {
            accumulate(&mut outcome.stats, &key.stats);
            if !key.errors.is_empty() {
                outcome.errors.insert(key.code.clone(), key.errors);
            }
            if let Some(record) = key.record {
                touched.push(key.code.clone());
                outcome.records.insert(key.code, record);
            }
        }

        {
            let mut recency = self.lock()?;
            recency.touch_many(touched);
            outcome.evicted = self.evict_locked(&mut recency)?;
            self.store.save_recency(&recency.snapshot())?;
        }
        outcome.stats.evictions = outcome.evicted.len() as u64;

        tracing::info!(
            requested = outcome.stats.requested,
            fresh_hits = outcome.stats.fresh_hits,
            groups_refreshed = outcome.stats.groups_refreshed,
            full_fetches = outcome.stats.full_fetches,
            failures = outcome.stats.failures,
            evictions = outcome.stats.evictions,
            "refresh batch complete"
        );

        Ok(outcome)
    }

    /// Evict least recently used records until at most `capacity` remain.
    pub fn evict_to_capacity(&self) -> QuickFundResult<Vec<FundCode>> {
        let mut recency = self.lock()?;
        let evicted = self.evict_locked(&mut recency)?;
        if !evicted.is_empty() {
            self.store.save_recency(&recency.snapshot())?;
        }
        Ok(evicted)
    }

    /// Drop every record and start over with an empty store.
    pub fn clear(&self) -> QuickFundResult<()> {
        let mut recency = self.lock()?;
        self.store.clear()?;
        self.store.set_schema_version(&self.config.schema_version)?;
        *recency = RecencyList::new();
        tracing::info!("record cache cleared");
        Ok(())
    }

    pub fn into_store(self) -> Arc<S> {
        self.store
    }

    fn lock(&self) -> QuickFundResult<MutexGuard<'_, RecencyList<FundCode>>> {
        self.recency
            .lock()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    /// Track codes an aborted batch already wrote, so the store and the
    /// recency order hold the same keys.
    fn track_written(&self, codes: &[FundCode]) -> QuickFundResult<()> {
        let mut recency = self.lock()?;
        let mut adopted = 0usize;
        for code in codes {
            if !recency.contains(code) && self.store.contains(code)? {
                recency.touch(code.clone());
                adopted += 1;
            }
        }
        if adopted > 0 {
            tracing::debug!(adopted, "tracked records written before batch abort");
            self.store.save_recency(&recency.snapshot())?;
        }
        Ok(())
    }

    fn evict_locked(&self, recency: &mut RecencyList<FundCode>) -> QuickFundResult<Vec<FundCode>> {
        let mut evicted = Vec::new();
        while recency.size() > self.config.capacity {
            let code = recency.evict_oldest()?;
            self.store.delete(&code)?;
            evicted.push(code);
        }
        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), capacity = self.config.capacity, "evicted records");
        }
        Ok(evicted)
    }

    async fn refresh_one(&self, code: &FundCode, now: DateTime<Utc>) -> QuickFundResult<KeyOutcome> {
        let mut stats = RefreshStats::default();

        let Some(mut record) = self.store.get(code)? else {
            return match self.timed(code, FieldGroup::Full, self.fetcher.fetch_full(code)).await {
                Ok(mut record) => {
                    if record.code != *code {
                        tracing::warn!(%code, returned = %record.code, "fetcher returned a record for another code");
                        record.code = code.clone();
                    }
                    {
                        let _guard = self.lock()?;
                        self.store.put(&record)?;
                    }
                    stats.full_fetches += 1;
                    tracing::debug!(%code, "cached new record");
                    Ok(KeyOutcome {
                        code: code.clone(),
                        record: Some(record),
                        errors: Vec::new(),
                        stats,
                    })
                }
                Err(e) => {
                    stats.failures += 1;
                    tracing::warn!(%code, error = %e, "full fetch failed");
                    Ok(KeyOutcome {
                        code: code.clone(),
                        record: None,
                        errors: vec![e],
                        stats,
                    })
                }
            };
        };

        let stale = self.policy.stale_groups(&record, now);
        stats.fresh_hits = (FieldGroup::PARTIAL.len() - stale.len()) as u64;
        if stale.is_empty() {
            tracing::debug!(%code, "all groups fresh");
            return Ok(KeyOutcome {
                code: code.clone(),
                record: Some(record),
                errors: Vec::new(),
                stats,
            });
        }

        let wants = |group| stale.contains(&group);
        let value = async {
            if wants(FieldGroup::Value) {
                Some(
                    self.timed(code, FieldGroup::Value, self.fetcher.fetch_value(code))
                        .await
                        .map(SnapshotUpdate::Value),
                )
            } else {
                None
            }
        };
        let estimate = async {
            if wants(FieldGroup::Estimate) {
                Some(
                    self.timed(code, FieldGroup::Estimate, self.fetcher.fetch_estimate(code))
                        .await
                        .map(SnapshotUpdate::Estimate),
                )
            } else {
                None
            }
        };
        let ranking = async {
            if wants(FieldGroup::Ranking) {
                Some(
                    self.timed(code, FieldGroup::Ranking, self.fetcher.fetch_ranking(code))
                        .await
                        .map(SnapshotUpdate::Ranking),
                )
            } else {
                None
            }
        };
        let (value, estimate, ranking) = tokio::join!(value, estimate, ranking);

        let mut errors = Vec::new();
        let mut changed = false;
        for result in [value, estimate, ranking].into_iter().flatten() {
            match result {
                Ok(update) => {
                    tracing::debug!(%code, group = %update.group(), "refreshed group");
                    changed |= record.apply(update);
                    stats.groups_refreshed += 1;
                }
                Err(e) => {
                    tracing::warn!(%code, group = %e.group(), error = %e, "group refresh failed, keeping cached value");
                    stats.failures += 1;
                    errors.push(e);
                }
            }
        }

        if changed {
            let _guard = self.lock()?;
            self.store.put(&record)?;
        }

        Ok(KeyOutcome {
            code: code.clone(),
            record: Some(record),
            errors,
            stats,
        })
    }

    /// Bound `fut` by the configured fetch timeout.
    async fn timed<T, Fut>(&self, code: &FundCode, group: FieldGroup, fut: Fut) -> Result<T, FetchError>
    where
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let after = self.config.fetch_timeout;
        match tokio::time::timeout(after, fut).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                code: code.clone(),
                group,
                after,
            }),
        }
    }
}

/// Rebuild the recency order from the store.
///
/// Snapshot entries without a record are dropped. Records missing from the
/// snapshot are treated as the oldest, in key order.
fn restore_recency<S: RecordStore + ?Sized>(store: &S) -> QuickFundResult<RecencyList<FundCode>> {
    let stored = store.keys()?;
    let snapshot = store.load_recency()?.unwrap_or_default();

    let stored_set: HashSet<&FundCode> = stored.iter().collect();
    let in_snapshot: HashSet<&FundCode> = snapshot.keys.iter().collect();

    let mut list = RecencyList::new();
    list.touch_many(stored.iter().filter(|code| !in_snapshot.contains(code)).cloned());
    for code in &snapshot.keys {
        if stored_set.contains(code) && !list.contains(code) {
            list.touch(code.clone());
        }
    }

    if list.size() != snapshot.keys.len() {
        tracing::debug!(
            tracked = list.size(),
            snapshot = snapshot.keys.len(),
            "recency snapshot reconciled with stored records"
        );
    }
    Ok(list)
}

fn dedupe(codes: &[FundCode]) -> Vec<FundCode> {
    let mut seen = HashSet::with_capacity(codes.len());
    codes
        .iter()
        .filter(|code| seen.insert(*code))
        .cloned()
        .collect()
}

fn accumulate(total: &mut RefreshStats, key: &RefreshStats) {
    total.fresh_hits += key.fresh_hits;
    total.groups_refreshed += key.groups_refreshed;
    total.full_fetches += key.full_fetches;
    total.failures += key.failures;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryRecordStore;
    use async_trait::async_trait;
    use chrono::{FixedOffset, NaiveDate, TimeZone};
    use quickfund_core::{
        EstimateSnapshot, ManualClock, Rank, RankingSnapshot, ValueSnapshot,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// Saturday 2024-03-09 10:00 market time: Friday's data is the latest.
    fn saturday() -> DateTime<Utc> {
        FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 9, 10, 0, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn code(n: u32) -> FundCode {
        FundCode::new_unchecked(format!("{n:06}"))
    }

    fn value(as_of: NaiveDate) -> ValueSnapshot {
        ValueSnapshot {
            as_of,
            value: 1.5,
            daily_change: 0.01,
            previous_value: 1.485,
            previous_date: as_of.pred_opt().unwrap(),
            annotation: String::new(),
        }
    }

    fn estimate(code: &FundCode) -> EstimateSnapshot {
        EstimateSnapshot {
            code: code.clone(),
            name: format!("Fund {code}"),
            as_of: date(2024, 3, 8).and_hms_opt(15, 0, 0).unwrap(),
            estimate: 1.51,
            change_ratio: 0.006,
        }
    }

    fn ranking(as_of: NaiveDate) -> RankingSnapshot {
        let rank = Rank::new(10, 100).unwrap();
        RankingSnapshot {
            as_of,
            one_week: rank,
            one_month: rank,
            three_months: rank,
            six_months: rank,
            year_to_date: rank,
            one_year: rank,
            two_years: rank,
            three_years: rank,
        }
    }

    /// Serves data that is fresh on `saturday()`.
    #[derive(Default)]
    struct CountingFetcher {
        value_calls: AtomicUsize,
        estimate_calls: AtomicUsize,
        ranking_calls: AtomicUsize,
        fail_value: bool,
    }

    #[async_trait]
    impl RecordFetcher for CountingFetcher {
        async fn fetch_value(&self, code: &FundCode) -> Result<ValueSnapshot, FetchError> {
            self.value_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_value {
                return Err(FetchError::Transport {
                    code: code.clone(),
                    group: FieldGroup::Value,
                    reason: "connection refused".to_string(),
                });
            }
            Ok(value(date(2024, 3, 8)))
        }

        async fn fetch_estimate(&self, code: &FundCode) -> Result<EstimateSnapshot, FetchError> {
            self.estimate_calls.fetch_add(1, Ordering::SeqCst);
            Ok(estimate(code))
        }

        async fn fetch_ranking(&self, _code: &FundCode) -> Result<RankingSnapshot, FetchError> {
            self.ranking_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ranking(date(2024, 3, 9)))
        }
    }

    fn orchestrator(
        fetcher: CountingFetcher,
        capacity: usize,
    ) -> CacheOrchestrator<InMemoryRecordStore, CountingFetcher> {
        let config = CacheConfig::development("/unused").with_capacity(capacity);
        CacheOrchestrator::open(Arc::new(InMemoryRecordStore::new()), Arc::new(fetcher), config)
            .unwrap()
            .with_clock(ManualClock::new(saturday()))
    }

    #[tokio::test]
    async fn test_absent_key_full_fetch() {
        let cache = orchestrator(CountingFetcher::default(), 10);
        let outcome = cache.get_or_refresh(&[code(1)]).await.unwrap();

        let stored = cache.store().get(&code(1)).unwrap().unwrap();
        assert_eq!(outcome.records[&code(1)], stored);
        assert!(stored.is_complete());
        assert_eq!(cache.len().unwrap(), 1);
        assert_eq!(outcome.stats.full_fetches, 1);
    }

    #[tokio::test]
    async fn test_second_batch_is_all_hits() {
        let cache = orchestrator(CountingFetcher::default(), 10);
        cache.get_or_refresh(&[code(1)]).await.unwrap();
        let outcome = cache.get_or_refresh(&[code(1)]).await.unwrap();

        assert_eq!(outcome.stats.fresh_hits, 3);
        assert_eq!(outcome.stats.fetches(), 0);
        assert_eq!(cache.fetcher.value_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicates_processed_once() {
        let cache = orchestrator(CountingFetcher::default(), 10);
        let codes = [code(1), code(2), code(1)];
        let outcome = cache.get_or_refresh(&codes).await.unwrap();

        assert_eq!(outcome.stats.requested, 2);
        assert_eq!(cache.fetcher.value_calls.load(Ordering::SeqCst), 2);
        let ordered: Vec<&FundCode> = outcome.records_in_order(&codes).map(|r| &r.code).collect();
        assert_eq!(ordered, vec![&code(1), &code(2), &code(1)]);
    }

    #[tokio::test]
    async fn test_failed_group_keeps_prior_value() {
        let store = Arc::new(InMemoryRecordStore::new());
        let mut prior = Record::combine(
            code(1),
            value(date(2024, 3, 7)),
            estimate(&code(1)),
            ranking(date(2024, 3, 9)),
        );
        prior.value.as_mut().unwrap().value = 0.9;
        store.put(&prior).unwrap();
        store.set_schema_version(quickfund_core::SCHEMA_VERSION).unwrap();

        let fetcher = CountingFetcher {
            fail_value: true,
            ..Default::default()
        };
        let config = CacheConfig::development("/unused");
        let cache = CacheOrchestrator::open(store, Arc::new(fetcher), config)
            .unwrap()
            .with_clock(ManualClock::new(saturday()));

        let outcome = cache.get_or_refresh(&[code(1)]).await.unwrap();
        assert_eq!(outcome.records[&code(1)], prior);
        assert_eq!(outcome.errors[&code(1)].len(), 1);
        assert_eq!(outcome.errors[&code(1)][0].group(), FieldGroup::Value);
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_eviction_after_batch() {
        let cache = orchestrator(CountingFetcher::default(), 3);
        let codes: Vec<FundCode> = (1..=5).map(code).collect();
        let outcome = cache.get_or_refresh(&codes).await.unwrap();

        assert_eq!(outcome.evicted, vec![code(1), code(2)]);
        assert_eq!(outcome.records.len(), 5);
        assert_eq!(cache.len().unwrap(), 3);
        assert_eq!(cache.store().len().unwrap(), 3);
        assert!(cache.store().get(&code(1)).unwrap().is_none());
    }

    struct SlowFetcher;

    #[async_trait]
    impl RecordFetcher for SlowFetcher {
        async fn fetch_value(&self, _code: &FundCode) -> Result<ValueSnapshot, FetchError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(value(date(2024, 3, 8)))
        }

        async fn fetch_estimate(&self, code: &FundCode) -> Result<EstimateSnapshot, FetchError> {
            Ok(estimate(code))
        }

        async fn fetch_ranking(&self, _code: &FundCode) -> Result<RankingSnapshot, FetchError> {
            Ok(ranking(date(2024, 3, 9)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_fetch_error() {
        let config = CacheConfig::development("/unused").with_fetch_timeout(Duration::from_secs(1));
        let cache = CacheOrchestrator::open(
            Arc::new(InMemoryRecordStore::new()),
            Arc::new(SlowFetcher),
            config,
        )
        .unwrap();

        let outcome = cache.get_or_refresh(&[code(1)]).await.unwrap();
        assert!(outcome.records.is_empty());
        assert!(matches!(
            outcome.errors[&code(1)][..],
            [FetchError::Timeout { group: FieldGroup::Full, .. }]
        ));
        assert_eq!(cache.len().unwrap(), 0);
    }

    /// Answers every full fetch with the record of another fund.
    struct MisnamedFetcher;

    #[async_trait]
    impl RecordFetcher for MisnamedFetcher {
        async fn fetch_value(&self, _code: &FundCode) -> Result<ValueSnapshot, FetchError> {
            Ok(value(date(2024, 3, 8)))
        }

        async fn fetch_estimate(&self, code: &FundCode) -> Result<EstimateSnapshot, FetchError> {
            Ok(estimate(code))
        }

        async fn fetch_ranking(&self, _code: &FundCode) -> Result<RankingSnapshot, FetchError> {
            Ok(ranking(date(2024, 3, 9)))
        }

        async fn fetch_full(&self, _code: &FundCode) -> Result<Record, FetchError> {
            Ok(Record::combine(
                code(99),
                value(date(2024, 3, 8)),
                estimate(&code(99)),
                ranking(date(2024, 3, 9)),
            ))
        }
    }

    #[tokio::test]
    async fn test_full_fetch_stored_under_requested_code() {
        let cache = CacheOrchestrator::open(
            Arc::new(InMemoryRecordStore::new()),
            Arc::new(MisnamedFetcher),
            CacheConfig::development("/unused"),
        )
        .unwrap()
        .with_clock(ManualClock::new(saturday()));

        let outcome = cache.get_or_refresh(&[code(1)]).await.unwrap();
        assert_eq!(outcome.records[&code(1)].code, code(1));
        assert_eq!(cache.store().keys().unwrap(), vec![code(1)]);
        assert_eq!(cache.recency_snapshot().unwrap().keys, vec![code(1)]);
    }

    #[test]
    fn test_restore_recency_reconciles() {
        let store = InMemoryRecordStore::new();
        for n in [1, 2, 3] {
            store.put(&Record::empty(code(n))).unwrap();
        }
        store
            .save_recency(&RecencySnapshot {
                keys: vec![code(3), code(9), code(1)],
            })
            .unwrap();

        let list = restore_recency(&store).unwrap();
        let order: Vec<FundCode> = list.iter().cloned().collect();
        assert_eq!(order, vec![code(2), code(3), code(1)]);
    }

    #[test]
    fn test_dedupe_keeps_first_occurrence() {
        assert_eq!(
            dedupe(&[code(2), code(1), code(2), code(3), code(1)]),
            vec![code(2), code(1), code(3)]
        );
    }
}
