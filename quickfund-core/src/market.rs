//! Trading calendar for the mainland China fund market.
//!
//! All freshness decisions are made in market-local time (UTC+08:00). The
//! calendar only knows about weekends; public holidays are treated as
//! business days, which can cause at most one redundant refetch.

use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, FixedOffset, NaiveDate, NaiveDateTime,
    NaiveTime, Offset, Utc, Weekday,
};

/// Offset of market-local time from UTC, in seconds.
pub const MARKET_UTC_OFFSET_SECS: i32 = 8 * 3600;

/// A trading session, both bounds inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl Session {
    pub fn contains(&self, time: NaiveTime) -> bool {
        self.open <= time && time <= self.close
    }
}

/// Session hours and publication cutoffs of the market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradingCalendar {
    offset: FixedOffset,
    morning: Session,
    afternoon: Session,
    /// Net values for a business day are published by this local time.
    value_publication: NaiveTime,
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

impl Default for TradingCalendar {
    fn default() -> Self {
        Self {
            offset: FixedOffset::east_opt(MARKET_UTC_OFFSET_SECS).unwrap_or_else(|| Utc.fix()),
            morning: Session {
                open: hm(9, 30),
                close: hm(11, 30),
            },
            afternoon: Session {
                open: hm(13, 0),
                close: hm(15, 0),
            },
            value_publication: hm(20, 0),
        }
    }
}

impl TradingCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn morning(&self) -> Session {
        self.morning
    }

    pub fn afternoon(&self) -> Session {
        self.afternoon
    }

    pub fn value_publication(&self) -> NaiveTime {
        self.value_publication
    }

    /// Convert an instant to market-local wall clock time.
    pub fn local(&self, now: DateTime<Utc>) -> NaiveDateTime {
        now.with_timezone(&self.offset).naive_local()
    }

    pub fn is_weekend(&self, date: NaiveDate) -> bool {
        matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }

    /// The most recent Friday on or before `date`.
    pub fn last_friday(&self, date: NaiveDate) -> NaiveDate {
        // Days since Friday: Fri=0, Sat=1, Sun=2, Mon=3, ...
        let back = (date.weekday().num_days_from_monday() + 7 - Weekday::Fri.num_days_from_monday()) % 7;
        date - ChronoDuration::days(i64::from(back))
    }

    /// The business day before `date`. Monday rolls back to Friday.
    pub fn previous_business_day(&self, date: NaiveDate) -> NaiveDate {
        let yesterday = date.pred_opt().unwrap_or(date);
        if self.is_weekend(yesterday) {
            self.last_friday(yesterday)
        } else {
            yesterday
        }
    }

    /// Whether `time` falls inside either session, bounds inclusive.
    pub fn is_session_open(&self, time: NaiveTime) -> bool {
        self.morning.contains(time) || self.afternoon.contains(time)
    }

    /// Whether trading is in progress at local time `local`.
    pub fn is_trading(&self, local: NaiveDateTime) -> bool {
        !self.is_weekend(local.date()) && self.is_session_open(local.time())
    }

    /// The most recent session close at or before local time `local`.
    ///
    /// - weekend: Friday afternoon close
    /// - before the morning close: previous business day's afternoon close
    /// - between the morning close and the afternoon close: today's morning close
    /// - otherwise: today's afternoon close
    pub fn last_session_close(&self, local: NaiveDateTime) -> NaiveDateTime {
        let date = local.date();
        let time = local.time();

        if self.is_weekend(date) {
            return self.last_friday(date).and_time(self.afternoon.close);
        }
        if time < self.morning.close {
            return self
                .previous_business_day(date)
                .and_time(self.afternoon.close);
        }
        if time < self.afternoon.close {
            return date.and_time(self.morning.close);
        }
        date.and_time(self.afternoon.close)
    }

    /// The date whose net value should be the latest published one at `local`.
    ///
    /// Weekends look back to Friday. On business days the value of the same
    /// day only counts once the publication cutoff has passed; before that
    /// the previous business day's value is the latest one.
    pub fn expected_value_date(&self, local: NaiveDateTime) -> NaiveDate {
        let date = local.date();
        if self.is_weekend(date) {
            self.last_friday(date)
        } else if local.time() < self.value_publication {
            self.previous_business_day(date)
        } else {
            date
        }
    }
}
