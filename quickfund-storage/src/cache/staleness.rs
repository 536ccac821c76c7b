//! Per-group freshness rules.
//!
//! Each predicate answers "is this stored timestamp the newest one upstream
//! could have right now?". Absent timestamps are never fresh.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use quickfund_core::{FieldGroup, Record, TradingCalendar};

/// Decides which field groups of a record need refreshing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StalenessPolicy {
    calendar: TradingCalendar,
}

impl StalenessPolicy {
    pub fn new(calendar: TradingCalendar) -> Self {
        Self { calendar }
    }

    pub fn calendar(&self) -> &TradingCalendar {
        &self.calendar
    }

    /// Net value is fresh when it is dated on the latest published day.
    pub fn value_is_fresh(&self, as_of: Option<NaiveDate>, now: DateTime<Utc>) -> bool {
        let Some(as_of) = as_of else {
            return false;
        };
        as_of == self.calendar.expected_value_date(self.calendar.local(now))
    }

    /// Estimates move continuously while a session is open, so they are
    /// never fresh then. Outside sessions an estimate is fresh when it was
    /// taken at the most recent session close.
    pub fn estimate_is_fresh(&self, as_of: Option<NaiveDateTime>, now: DateTime<Utc>) -> bool {
        let Some(as_of) = as_of else {
            return false;
        };
        let local = self.calendar.local(now);
        if self.calendar.is_trading(local) {
            return false;
        }
        as_of == self.calendar.last_session_close(local)
    }

    /// Rankings update at most once per day.
    pub fn ranking_is_fresh(&self, as_of: Option<NaiveDate>, now: DateTime<Utc>) -> bool {
        let Some(as_of) = as_of else {
            return false;
        };
        as_of == self.calendar.local(now).date()
    }

    /// Field groups of `record` that are stale at `now`, in record order.
    pub fn stale_groups(&self, record: &Record, now: DateTime<Utc>) -> Vec<FieldGroup> {
        let mut stale = Vec::with_capacity(3);
        if !self.value_is_fresh(record.value.as_ref().map(|v| v.as_of), now) {
            stale.push(FieldGroup::Value);
        }
        if !self.estimate_is_fresh(record.estimate.as_ref().map(|e| e.as_of), now) {
            stale.push(FieldGroup::Estimate);
        }
        if !self.ranking_is_fresh(record.ranking.as_ref().map(|r| r.as_of), now) {
            stale.push(FieldGroup::Ranking);
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};
    use proptest::prelude::*;
    use quickfund_core::{FundCode, Rank, RankingSnapshot, ValueSnapshot};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// Market-local wall clock time as a UTC instant.
    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn at(d: NaiveDate, h: u32, m: u32) -> NaiveDateTime {
        d.and_hms_opt(h, m, 0).unwrap()
    }

    fn policy() -> StalenessPolicy {
        StalenessPolicy::default()
    }

    // Week of 2024-03-04 (Mon) .. 2024-03-10 (Sun); 2024-03-01 is a Friday.

    #[test]
    fn test_value_fresh_rules() {
        let p = policy();
        // Tuesday before publication: Monday's value is the latest.
        assert!(p.value_is_fresh(Some(date(2024, 3, 4)), local(2024, 3, 5, 19, 59)));
        assert!(!p.value_is_fresh(Some(date(2024, 3, 5)), local(2024, 3, 5, 19, 59)));
        // After publication: today's value.
        assert!(p.value_is_fresh(Some(date(2024, 3, 5)), local(2024, 3, 5, 20, 0)));
        assert!(!p.value_is_fresh(Some(date(2024, 3, 4)), local(2024, 3, 5, 20, 30)));
        // Weekend: Friday's value.
        assert!(p.value_is_fresh(Some(date(2024, 3, 8)), local(2024, 3, 9, 10, 0)));
        assert!(p.value_is_fresh(Some(date(2024, 3, 8)), local(2024, 3, 10, 23, 0)));
        // Monday morning: Friday's value.
        assert!(p.value_is_fresh(Some(date(2024, 3, 1)), local(2024, 3, 4, 10, 0)));
    }

    #[test]
    fn test_estimate_stale_during_sessions() {
        let p = policy();
        let mon = date(2024, 3, 4);
        for (h, m) in [(9, 30), (10, 15), (11, 30), (13, 0), (14, 59), (15, 0)] {
            let as_of = Some(at(mon, h, m));
            assert!(!p.estimate_is_fresh(as_of, local(2024, 3, 4, h, m)), "{h}:{m}");
        }
    }

    #[test]
    fn test_estimate_session_boundaries() {
        let p = policy();
        let fri = date(2024, 3, 1);
        let mon = date(2024, 3, 4);
        // 09:29 is before the open: compare against Friday's close.
        assert!(p.estimate_is_fresh(Some(at(fri, 15, 0)), local(2024, 3, 4, 9, 29)));
        // 15:01 is after the close: compare against today's close.
        assert!(p.estimate_is_fresh(Some(at(mon, 15, 0)), local(2024, 3, 4, 15, 1)));
        assert!(!p.estimate_is_fresh(Some(at(mon, 14, 59)), local(2024, 3, 4, 15, 1)));
    }

    #[test]
    fn test_estimate_lunch_break_uses_morning_close() {
        let p = policy();
        let mon = date(2024, 3, 4);
        assert!(p.estimate_is_fresh(Some(at(mon, 11, 30)), local(2024, 3, 4, 12, 0)));
        assert!(!p.estimate_is_fresh(Some(at(date(2024, 3, 1), 15, 0)), local(2024, 3, 4, 12, 0)));
    }

    #[test]
    fn test_estimate_weekend_uses_friday_close() {
        let p = policy();
        let fri = date(2024, 3, 8);
        assert!(p.estimate_is_fresh(Some(at(fri, 15, 0)), local(2024, 3, 9, 10, 0)));
        assert!(p.estimate_is_fresh(Some(at(fri, 15, 0)), local(2024, 3, 10, 11, 0)));
        assert!(!p.estimate_is_fresh(Some(at(fri, 11, 30)), local(2024, 3, 9, 10, 0)));
    }

    #[test]
    fn test_ranking_fresh_same_local_day() {
        let p = policy();
        assert!(p.ranking_is_fresh(Some(date(2024, 3, 4)), local(2024, 3, 4, 0, 5)));
        assert!(!p.ranking_is_fresh(Some(date(2024, 3, 3)), local(2024, 3, 4, 0, 5)));
        // 23:30 UTC on the 3rd is already the 4th in market time.
        let now = Utc.with_ymd_and_hms(2024, 3, 3, 23, 30, 0).unwrap();
        assert!(p.ranking_is_fresh(Some(date(2024, 3, 4)), now));
    }

    #[test]
    fn test_stale_groups() {
        let p = policy();
        let now = local(2024, 3, 9, 10, 0);
        let code = FundCode::new_unchecked("000001");
        let mut record = quickfund_core::Record::empty(code);
        assert_eq!(p.stale_groups(&record, now), FieldGroup::PARTIAL.to_vec());

        record.replace_value(ValueSnapshot {
            as_of: date(2024, 3, 8),
            value: 1.0,
            daily_change: 0.0,
            previous_value: 1.0,
            previous_date: date(2024, 3, 7),
            annotation: String::new(),
        });
        let rank = Rank::new(1, 10).unwrap();
        record.replace_ranking(RankingSnapshot {
            as_of: date(2024, 3, 9),
            one_week: rank,
            one_month: rank,
            three_months: rank,
            six_months: rank,
            year_to_date: rank,
            one_year: rank,
            two_years: rank,
            three_years: rank,
        });
        assert_eq!(p.stale_groups(&record, now), vec![FieldGroup::Estimate]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_absent_is_never_fresh(secs in 1_577_836_800i64..1_893_456_000i64) {
            let now = Utc.timestamp_opt(secs, 0).unwrap();
            let p = policy();
            prop_assert!(!p.value_is_fresh(None, now));
            prop_assert!(!p.estimate_is_fresh(None, now));
            prop_assert!(!p.ranking_is_fresh(None, now));
        }

        #[test]
        fn prop_estimate_never_fresh_while_trading(
            day in 0i64..3650,
            minute in 0u32..(24 * 60),
            offset_minutes in -600i64..600,
        ) {
            let p = policy();
            let d = date(2020, 1, 1) + chrono::Duration::days(day);
            let wall = at(d, minute / 60, minute % 60);
            let now = FixedOffset::east_opt(8 * 3600).unwrap()
                .from_local_datetime(&wall).unwrap().with_timezone(&Utc);
            if p.calendar().is_trading(wall) {
                let as_of = wall + chrono::Duration::minutes(offset_minutes);
                prop_assert!(!p.estimate_is_fresh(Some(as_of), now));
            }
        }
    }
}
