//! Error types for the data engine
//!
//! Malformed device records never surface here: they degrade to flagged
//! records (`reject` / `rejectReason`) and stay in the store. The variants
//! below cover caller mistakes (bad query options, bad configuration) and the
//! one mutation that can be refused outright, an update that fails
//! validation.

use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    /// Query options could not be applied
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// An update failed validation and was discarded; the stored record is untouched
    #[error("Update discarded for record {id}: {}", reasons.join("; "))]
    UpdateDiscarded {
        /// Id of the record the update targeted
        id: String,
        /// Validation messages explaining the rejection
        reasons: Vec<String>,
    },

    /// A raw record could not be stored at all (no usable id)
    #[error("Unstorable record: {0}")]
    Unstorable(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while interpreting query options
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// Endpoints are inverted or non-finite
    #[error("Invalid endpoints: start {start} >= end {end}")]
    InvalidEndpoints {
        /// Start timestamp (ms)
        start: i64,
        /// End timestamp (ms)
        end: i64,
    },

    /// Timezone name is not a known IANA zone
    #[error("Unknown timezone: {0}")]
    UnknownTimezone(String),

    /// Weekday name or number could not be parsed
    #[error("Invalid active day: {0}")]
    InvalidActiveDay(String),

    /// Record type name is not recognized
    #[error("Unknown record type: {0}")]
    UnknownType(String),

    /// Sort specification could not be parsed
    #[error("Invalid sort specification: {0}")]
    InvalidSort(String),

    /// bgSource must be cbg or smbg
    #[error("Invalid bg source: {0}")]
    InvalidBgSource(String),

    /// Options payload could not be decoded
    #[error("Malformed query options: {0}")]
    Malformed(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
