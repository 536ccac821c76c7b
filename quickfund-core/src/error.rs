//! Error types for QuickFund operations

use crate::{FieldGroup, FundCode};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while fetching one field group of one fund.
///
/// These are recoverable: the orchestrator keeps the prior value of the
/// affected group and reports the error next to the record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Transport failure fetching {group} for {code}: {reason}")]
    Transport {
        code: FundCode,
        group: FieldGroup,
        reason: String,
    },

    #[error("Malformed {group} payload for {code}: {reason}")]
    Parse {
        code: FundCode,
        group: FieldGroup,
        reason: String,
    },

    #[error("Fetching {group} for {code} timed out after {after:?}")]
    Timeout {
        code: FundCode,
        group: FieldGroup,
        after: Duration,
    },
}

impl FetchError {
    /// The fund the failed fetch was for.
    pub fn code(&self) -> &FundCode {
        match self {
            FetchError::Transport { code, .. }
            | FetchError::Parse { code, .. }
            | FetchError::Timeout { code, .. } => code,
        }
    }

    /// The field group the failed fetch was for.
    pub fn group(&self) -> FieldGroup {
        match self {
            FetchError::Transport { group, .. }
            | FetchError::Parse { group, .. }
            | FetchError::Timeout { group, .. } => *group,
        }
    }
}

/// Persistent store errors. Fatal for the batch in progress.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Failed to open store at {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("Read failed for {key}: {reason}")]
    Read { key: String, reason: String },

    #[error("Write failed for {key}: {reason}")]
    Write { key: String, reason: String },

    #[error("Serialization failed for {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Recency list errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecencyError {
    #[error("Recency list is empty, nothing to evict")]
    Empty,

    #[error("Recency list corrupted: {reason}")]
    Corrupt { reason: String },
}

/// Validation errors for values entering the data model.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid fund code {value:?}: expected six ASCII digits")]
    InvalidFundCode { value: String },

    #[error("Invalid rank {value:?}: {reason}")]
    InvalidRank { value: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Telemetry initialization failed: {reason}")]
    TelemetryInit { reason: String },
}

/// Master error type for all QuickFund errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuickFundError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Recency error: {0}")]
    Recency(#[from] RecencyError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for QuickFund operations.
pub type QuickFundResult<T> = Result<T, QuickFundError>;
