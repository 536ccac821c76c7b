//! Fund record and its independently refreshable field groups.
//!
//! A [`Record`] is split into three snapshots, each fetched from its own
//! upstream source and each with its own freshness rule:
//!
//! - [`ValueSnapshot`]: the published net value, refreshed once per business day
//! - [`EstimateSnapshot`]: the intraday estimate, moving while a session is open
//! - [`RankingSnapshot`]: peer-group rankings over eight lookback windows
//!
//! Groups are merged by whole replacement only. A refresh never splices
//! individual fields of two snapshots together.

use crate::{FundCode, ValidationError};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// FIELD GROUPS
// ============================================================================

/// Identifies which part of a record a fetch targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldGroup {
    Value,
    Estimate,
    Ranking,
    /// A whole-record fetch for a key that is not cached yet.
    Full,
}

impl FieldGroup {
    /// The three independently refreshable groups, in record order.
    pub const PARTIAL: [FieldGroup; 3] = [FieldGroup::Value, FieldGroup::Estimate, FieldGroup::Ranking];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldGroup::Value => "value",
            FieldGroup::Estimate => "estimate",
            FieldGroup::Ranking => "ranking",
            FieldGroup::Full => "full",
        }
    }
}

impl fmt::Display for FieldGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SNAPSHOTS
// ============================================================================

/// Published net value of a fund.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueSnapshot {
    /// Date the value was published for.
    pub as_of: NaiveDate,
    pub value: f64,
    /// Ratio, `0.0123` means +1.23%.
    pub daily_change: f64,
    pub previous_value: f64,
    pub previous_date: NaiveDate,
    /// Dividend or split note, empty when there is none.
    pub annotation: String,
}

/// Intraday estimate of a fund's value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateSnapshot {
    pub code: FundCode,
    pub name: String,
    /// Market-local time of the estimate, minute precision.
    pub as_of: NaiveDateTime,
    pub estimate: f64,
    pub change_ratio: f64,
}

/// Position of a fund within its peer group, e.g. `12/345`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rank {
    pub position: u32,
    pub total: u32,
}

impl Rank {
    pub fn new(position: u32, total: u32) -> Result<Self, ValidationError> {
        let rank = Self { position, total };
        rank.check(&format!("{position}/{total}"))?;
        Ok(rank)
    }

    fn check(&self, raw: &str) -> Result<(), ValidationError> {
        if self.total == 0 {
            return Err(ValidationError::InvalidRank {
                value: raw.to_string(),
                reason: "peer group is empty".to_string(),
            });
        }
        if self.position == 0 || self.position > self.total {
            return Err(ValidationError::InvalidRank {
                value: raw.to_string(),
                reason: "position outside peer group".to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.position, self.total)
    }
}

/// Accepts both the display form `12/345` and the upstream form `12 | 345`.
impl FromStr for Rank {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ValidationError::InvalidRank {
            value: s.to_string(),
            reason: "expected `position/total` or `position | total`".to_string(),
        };

        let (position, total) = s.split_once('/').or_else(|| s.split_once('|')).ok_or_else(malformed)?;
        let position: u32 = position.trim().parse().map_err(|_| malformed())?;
        let total: u32 = total.trim().parse().map_err(|_| malformed())?;

        let rank = Rank { position, total };
        rank.check(s)?;
        Ok(rank)
    }
}

/// Peer-group rankings over the standard lookback windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingSnapshot {
    /// Cutoff date of the ranking table.
    pub as_of: NaiveDate,
    pub one_week: Rank,
    pub one_month: Rank,
    pub three_months: Rank,
    pub six_months: Rank,
    pub year_to_date: Rank,
    pub one_year: Rank,
    pub two_years: Rank,
    pub three_years: Rank,
}

// ============================================================================
// RECORD
// ============================================================================

/// A whole-group replacement for one part of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotUpdate {
    Value(ValueSnapshot),
    Estimate(EstimateSnapshot),
    Ranking(RankingSnapshot),
}

impl SnapshotUpdate {
    pub fn group(&self) -> FieldGroup {
        match self {
            SnapshotUpdate::Value(_) => FieldGroup::Value,
            SnapshotUpdate::Estimate(_) => FieldGroup::Estimate,
            SnapshotUpdate::Ranking(_) => FieldGroup::Ranking,
        }
    }
}

/// Everything cached about one fund.
///
/// A group is `None` until it has been fetched successfully at least once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub code: FundCode,
    pub value: Option<ValueSnapshot>,
    pub estimate: Option<EstimateSnapshot>,
    pub ranking: Option<RankingSnapshot>,
}

impl Record {
    pub fn empty(code: FundCode) -> Self {
        Self {
            code,
            value: None,
            estimate: None,
            ranking: None,
        }
    }

    /// Build a complete record from the three group fetches.
    pub fn combine(
        code: FundCode,
        value: ValueSnapshot,
        estimate: EstimateSnapshot,
        ranking: RankingSnapshot,
    ) -> Self {
        Self {
            code,
            value: Some(value),
            estimate: Some(estimate),
            ranking: Some(ranking),
        }
    }

    pub fn replace_value(&mut self, value: ValueSnapshot) {
        self.value = Some(value);
    }

    pub fn replace_estimate(&mut self, estimate: EstimateSnapshot) {
        self.estimate = Some(estimate);
    }

    pub fn replace_ranking(&mut self, ranking: RankingSnapshot) {
        self.ranking = Some(ranking);
    }

    /// Replace the group carried by `update`. Returns `true` if the record changed.
    pub fn apply(&mut self, update: SnapshotUpdate) -> bool {
        match update {
            SnapshotUpdate::Value(v) => {
                let changed = self.value.as_ref() != Some(&v);
                self.replace_value(v);
                changed
            }
            SnapshotUpdate::Estimate(e) => {
                let changed = self.estimate.as_ref() != Some(&e);
                self.replace_estimate(e);
                changed
            }
            SnapshotUpdate::Ranking(r) => {
                let changed = self.ranking.as_ref() != Some(&r);
                self.replace_ranking(r);
                changed
            }
        }
    }

    /// Groups that have never been fetched for this record.
    pub fn missing_groups(&self) -> Vec<FieldGroup> {
        let mut missing = Vec::new();
        if self.value.is_none() {
            missing.push(FieldGroup::Value);
        }
        if self.estimate.is_none() {
            missing.push(FieldGroup::Estimate);
        }
        if self.ranking.is_none() {
            missing.push(FieldGroup::Ranking);
        }
        missing
    }

    pub fn is_complete(&self) -> bool {
        self.value.is_some() && self.estimate.is_some() && self.ranking.is_some()
    }
}
