//! QuickFund Test Utilities
//!
//! Centralized test infrastructure for the QuickFund workspace:
//! - Proptest generators for codes, snapshots and records
//! - A mock fetcher with call counters and failure injection
//! - Fixtures producing data that is fresh or stale at a given instant
//! - Custom assertions for refresh outcomes

// Re-export the in-memory store from its source crate
pub use quickfund_storage::InMemoryRecordStore;

// Re-export core types for convenience
pub use quickfund_core::{
    CacheConfig, Clock, EstimateSnapshot, FetchError, FieldGroup, FundCode, ManualClock,
    QuickFundError, QuickFundResult, Rank, RankingSnapshot, Record, StorageError,
    TradingCalendar, ValueSnapshot,
};
pub use quickfund_storage::{
    CacheOrchestrator, RecencySnapshot, RecordFetcher, RecordStore, RefreshOutcome,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

// ============================================================================
// MOCK FETCHER
// ============================================================================

/// Fetcher that serves data fresh at its clock's current time.
///
/// Every call is counted per group. Failures can be injected per code and
/// group; a failing group also fails `fetch_full` for that code.
#[derive(Debug)]
pub struct MockFetcher {
    clock: ManualClock,
    calendar: TradingCalendar,
    value_calls: AtomicUsize,
    estimate_calls: AtomicUsize,
    ranking_calls: AtomicUsize,
    full_calls: AtomicUsize,
    failures: Mutex<HashSet<(FundCode, FieldGroup)>>,
    delay: Option<Duration>,
}

impl MockFetcher {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            calendar: TradingCalendar::default(),
            value_calls: AtomicUsize::new(0),
            estimate_calls: AtomicUsize::new(0),
            ranking_calls: AtomicUsize::new(0),
            full_calls: AtomicUsize::new(0),
            failures: Mutex::new(HashSet::new()),
            delay: None,
        }
    }

    /// Sleep for `delay` before answering any call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make fetches of `group` for `code` fail with a transport error.
    pub fn fail(&self, code: &FundCode, group: FieldGroup) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert((code.clone(), group));
        }
    }

    pub fn recover(&self, code: &FundCode, group: FieldGroup) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(&(code.clone(), group));
        }
    }

    /// Number of calls made for `group`. `Full` counts `fetch_full` calls.
    pub fn calls(&self, group: FieldGroup) -> usize {
        self.counter(group).load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        [FieldGroup::Value, FieldGroup::Estimate, FieldGroup::Ranking, FieldGroup::Full]
            .into_iter()
            .map(|g| self.calls(g))
            .sum()
    }

    pub fn reset_calls(&self) {
        for group in [FieldGroup::Value, FieldGroup::Estimate, FieldGroup::Ranking, FieldGroup::Full] {
            self.counter(group).store(0, Ordering::SeqCst);
        }
    }

    fn counter(&self, group: FieldGroup) -> &AtomicUsize {
        match group {
            FieldGroup::Value => &self.value_calls,
            FieldGroup::Estimate => &self.estimate_calls,
            FieldGroup::Ranking => &self.ranking_calls,
            FieldGroup::Full => &self.full_calls,
        }
    }

    fn is_failing(&self, code: &FundCode, group: FieldGroup) -> bool {
        self.failures
            .lock()
            .map(|f| f.contains(&(code.clone(), group)))
            .unwrap_or(false)
    }

    async fn enter(&self, code: &FundCode, group: FieldGroup) -> Result<DateTime<Utc>, FetchError> {
        self.counter(group).fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.is_failing(code, group) {
            return Err(FetchError::Transport {
                code: code.clone(),
                group,
                reason: "injected failure".to_string(),
            });
        }
        Ok(self.clock.now())
    }
}

#[async_trait]
impl RecordFetcher for MockFetcher {
    async fn fetch_value(&self, code: &FundCode) -> Result<ValueSnapshot, FetchError> {
        let now = self.enter(code, FieldGroup::Value).await?;
        Ok(fixtures::fresh_value(&self.calendar, now))
    }

    async fn fetch_estimate(&self, code: &FundCode) -> Result<EstimateSnapshot, FetchError> {
        let now = self.enter(code, FieldGroup::Estimate).await?;
        Ok(fixtures::fresh_estimate(&self.calendar, code, now))
    }

    async fn fetch_ranking(&self, code: &FundCode) -> Result<RankingSnapshot, FetchError> {
        let now = self.enter(code, FieldGroup::Ranking).await?;
        Ok(fixtures::fresh_ranking(&self.calendar, now))
    }

    async fn fetch_full(&self, code: &FundCode) -> Result<Record, FetchError> {
        let now = self.enter(code, FieldGroup::Full).await?;
        if let Some(group) = FieldGroup::PARTIAL
            .into_iter()
            .find(|g| self.is_failing(code, *g))
        {
            return Err(FetchError::Transport {
                code: code.clone(),
                group,
                reason: "injected failure".to_string(),
            });
        }
        Ok(fixtures::fresh_record(&self.calendar, code, now))
    }
}

// ============================================================================
// FAULTY STORE
// ============================================================================

/// In-memory store whose writes fail for chosen codes.
///
/// Everything else is delegated to an [`InMemoryRecordStore`].
#[derive(Debug, Clone, Default)]
pub struct FaultyStore {
    inner: InMemoryRecordStore,
    failing_puts: std::sync::Arc<Mutex<HashSet<FundCode>>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `put` of `code` fail with a write error.
    pub fn fail_put(&self, code: &FundCode) {
        if let Ok(mut failing) = self.failing_puts.lock() {
            failing.insert(code.clone());
        }
    }
}

impl RecordStore for FaultyStore {
    fn get(&self, code: &FundCode) -> QuickFundResult<Option<Record>> {
        self.inner.get(code)
    }

    fn put(&self, record: &Record) -> QuickFundResult<()> {
        let failing = self
            .failing_puts
            .lock()
            .map(|f| f.contains(&record.code))
            .unwrap_or(true);
        if failing {
            return Err(StorageError::Write {
                key: record.code.to_string(),
                reason: "injected write failure".to_string(),
            }
            .into());
        }
        self.inner.put(record)
    }

    fn delete(&self, code: &FundCode) -> QuickFundResult<bool> {
        self.inner.delete(code)
    }

    fn keys(&self) -> QuickFundResult<Vec<FundCode>> {
        self.inner.keys()
    }

    fn len(&self) -> QuickFundResult<usize> {
        self.inner.len()
    }

    fn clear(&self) -> QuickFundResult<()> {
        self.inner.clear()
    }

    fn schema_version(&self) -> QuickFundResult<Option<String>> {
        self.inner.schema_version()
    }

    fn set_schema_version(&self, version: &str) -> QuickFundResult<()> {
        self.inner.set_schema_version(version)
    }

    fn load_recency(&self) -> QuickFundResult<Option<RecencySnapshot<FundCode>>> {
        self.inner.load_recency()
    }

    fn save_recency(&self, snapshot: &RecencySnapshot<FundCode>) -> QuickFundResult<()> {
        self.inner.save_recency(snapshot)
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating QuickFund types.

    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};
    use proptest::prelude::*;

    /// Generate a valid fund code.
    pub fn arb_fund_code() -> impl Strategy<Value = FundCode> {
        (0u32..1_000_000).prop_map(|n| FundCode::new_unchecked(format!("{n:06}")))
    }

    /// Generate a code from a pool of `pool` codes, so sequences repeat keys.
    pub fn arb_pooled_code(pool: u32) -> impl Strategy<Value = FundCode> {
        (0..pool.max(1)).prop_map(|n| FundCode::new_unchecked(format!("{n:06}")))
    }

    /// Generate a touch sequence over a small key pool.
    pub fn arb_touch_sequence(pool: u32, max_len: usize) -> impl Strategy<Value = Vec<FundCode>> {
        prop::collection::vec(arb_pooled_code(pool), 0..max_len)
    }

    /// Generate an instant within 2020-2030.
    pub fn arb_instant() -> impl Strategy<Value = DateTime<Utc>> {
        (1_577_836_800i64..1_893_456_000i64).prop_map(|secs| {
            DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
        })
    }

    /// Generate a date within 2020-2030.
    pub fn arb_date() -> impl Strategy<Value = NaiveDate> {
        (0i64..3650).prop_map(|days| {
            NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or(NaiveDate::MIN) + chrono::Duration::days(days)
        })
    }

    /// Generate a minute-precision market timestamp.
    pub fn arb_market_datetime() -> impl Strategy<Value = NaiveDateTime> {
        (arb_date(), 0u32..24, 0u32..60).prop_map(|(date, h, m)| {
            date.and_hms_opt(h, m, 0).unwrap_or(NaiveDateTime::MIN)
        })
    }

    /// Generate a valid rank.
    pub fn arb_rank() -> impl Strategy<Value = Rank> {
        (1u32..5000).prop_flat_map(|total| {
            (1..=total).prop_map(move |position| Rank { position, total })
        })
    }

    pub fn arb_value_snapshot() -> impl Strategy<Value = ValueSnapshot> {
        (arb_date(), 0.1f64..10.0, -0.1f64..0.1, prop_oneof![Just(String::new()), "[a-z ]{1,20}"])
            .prop_map(|(as_of, value, daily_change, annotation)| ValueSnapshot {
                as_of,
                value,
                daily_change,
                previous_value: value / (1.0 + daily_change),
                previous_date: as_of.pred_opt().unwrap_or(as_of),
                annotation,
            })
    }

    pub fn arb_estimate_snapshot(code: FundCode) -> impl Strategy<Value = EstimateSnapshot> {
        (arb_market_datetime(), 0.1f64..10.0, -0.1f64..0.1).prop_map(move |(as_of, estimate, change_ratio)| {
            EstimateSnapshot {
                code: code.clone(),
                name: format!("Fund {code}"),
                as_of,
                estimate,
                change_ratio,
            }
        })
    }

    pub fn arb_ranking_snapshot() -> impl Strategy<Value = RankingSnapshot> {
        (arb_date(), prop::collection::vec(arb_rank(), 8)).prop_map(|(as_of, r)| RankingSnapshot {
            as_of,
            one_week: r[0],
            one_month: r[1],
            three_months: r[2],
            six_months: r[3],
            year_to_date: r[4],
            one_year: r[5],
            two_years: r[6],
            three_years: r[7],
        })
    }

    /// Generate a record with any subset of groups present.
    pub fn arb_record() -> impl Strategy<Value = Record> {
        arb_fund_code().prop_flat_map(|code| {
            (
                prop::option::of(arb_value_snapshot()),
                prop::option::of(arb_estimate_snapshot(code.clone())),
                prop::option::of(arb_ranking_snapshot()),
            )
                .prop_map(move |(value, estimate, ranking)| Record {
                    code: code.clone(),
                    value,
                    estimate,
                    ranking,
                })
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;
    use chrono::{Duration as ChronoDuration, FixedOffset, NaiveDate, TimeZone, Timelike};

    /// Market-local wall clock time as a UTC instant.
    pub fn market_time(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        FixedOffset::east_opt(quickfund_core::MARKET_UTC_OFFSET_SECS)
            .and_then(|tz| tz.with_ymd_and_hms(y, m, d, h, min, 0).single())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now)
    }

    /// Saturday 2024-03-09 10:00 market time. No session is open.
    pub fn weekend_morning() -> DateTime<Utc> {
        market_time(2024, 3, 9, 10, 0)
    }

    /// Tuesday 2024-03-05 21:00 market time. Sessions closed, values published.
    pub fn weekday_evening() -> DateTime<Utc> {
        market_time(2024, 3, 5, 21, 0)
    }

    pub fn code(n: u32) -> FundCode {
        FundCode::new_unchecked(format!("{n:06}"))
    }

    pub fn codes(range: std::ops::RangeInclusive<u32>) -> Vec<FundCode> {
        range.map(code).collect()
    }

    pub fn fresh_value(calendar: &TradingCalendar, now: DateTime<Utc>) -> ValueSnapshot {
        let as_of = calendar.expected_value_date(calendar.local(now));
        ValueSnapshot {
            as_of,
            value: 1.2345,
            daily_change: 0.0123,
            previous_value: 1.2195,
            previous_date: calendar.previous_business_day(as_of),
            annotation: String::new(),
        }
    }

    /// Estimate taken at the latest close, or at the current minute while trading.
    pub fn fresh_estimate(calendar: &TradingCalendar, code: &FundCode, now: DateTime<Utc>) -> EstimateSnapshot {
        let local = calendar.local(now);
        let as_of = if calendar.is_trading(local) {
            local.with_second(0).and_then(|t| t.with_nanosecond(0)).unwrap_or(local)
        } else {
            calendar.last_session_close(local)
        };
        EstimateSnapshot {
            code: code.clone(),
            name: format!("Fund {code}"),
            as_of,
            estimate: 1.2401,
            change_ratio: 0.0045,
        }
    }

    pub fn fresh_ranking(calendar: &TradingCalendar, now: DateTime<Utc>) -> RankingSnapshot {
        ranking_on(calendar.local(now).date())
    }

    pub fn ranking_on(as_of: NaiveDate) -> RankingSnapshot {
        let rank = Rank { position: 42, total: 1024 };
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

    /// A record whose three groups are all fresh at `now` (outside sessions).
    pub fn fresh_record(calendar: &TradingCalendar, code: &FundCode, now: DateTime<Utc>) -> Record {
        Record::combine(
            code.clone(),
            fresh_value(calendar, now),
            fresh_estimate(calendar, code, now),
            fresh_ranking(calendar, now),
        )
    }

    /// Like [`fresh_record`] but with a value dated one day too early.
    pub fn stale_value_record(calendar: &TradingCalendar, code: &FundCode, now: DateTime<Utc>) -> Record {
        let mut record = fresh_record(calendar, code, now);
        if let Some(value) = record.value.as_mut() {
            value.as_of -= ChronoDuration::days(1);
            value.value = 0.9876;
        }
        record
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for refresh outcomes.

    use super::*;

    /// Assert that a QuickFundResult is a Storage error.
    #[track_caller]
    pub fn assert_storage_error<T: std::fmt::Debug>(result: &QuickFundResult<T>) {
        match result {
            Err(QuickFundError::Storage(_)) => {}
            other => panic!("Expected Storage error, got: {:?}", other),
        }
    }

    /// Assert that `code` has exactly one error, for `group`.
    #[track_caller]
    pub fn assert_single_fetch_error(outcome: &RefreshOutcome, code: &FundCode, group: FieldGroup) {
        match outcome.errors.get(code).map(Vec::as_slice) {
            Some([err]) => assert_eq!(err.group(), group, "wrong group in fetch error for {code}"),
            other => panic!("Expected one {group} error for {code}, got: {:?}", other),
        }
    }

    /// Assert that the store and the recency order track the same codes.
    #[track_caller]
    pub fn assert_store_matches_recency<S, F>(cache: &CacheOrchestrator<S, F>)
    where
        S: RecordStore,
        F: RecordFetcher,
    {
        let mut tracked: Vec<FundCode> = cache
            .recency_snapshot()
            .expect("recency snapshot")
            .keys;
        tracked.sort();
        let stored = cache.store().keys().expect("store keys");
        assert_eq!(tracked, stored, "store and recency order disagree");
    }
}

// ============================================================================
// TESTS
// ============================================================================
