//! Core trait definitions for pluggable collaborators
//!
//! The engine owns indexing, joining and windowing. Three concerns are
//! delegated through traits so callers can swap them:
//!
//! - [`SchemaValidator`]: accept or reject a raw record
//! - [`StatsProvider`]: compute statistics over the current window
//! - [`Clock`]: the instant used to clamp ongoing records

use std::collections::BTreeSet;

use serde_json::Value;

use crate::index::TimeField;
use crate::ingestion::schema::ValidationResult;
use crate::record::{Fields, Record};
use crate::timezone::LocalCalendar;
use crate::types::{ActiveDays, TimeRange, Timestamp};
use crate::units::BgPrefs;

// =============================================================================
// SchemaValidator Trait
// =============================================================================

/// Validates raw records before normalization
pub trait SchemaValidator: Send + Sync {
    /// Unique identifier for this validator
    fn validator_id(&self) -> &str;

    /// Check a raw record of the given type
    ///
    /// An empty result accepts the record; otherwise every error becomes a
    /// `rejectReason` entry.
    fn validate(&self, record_type: &str, raw: &Fields) -> ValidationResult;
}

// =============================================================================
// StatsProvider Trait
// =============================================================================

/// Inputs shared by every statistic computed for one query
pub struct StatsContext<'a> {
    /// Current window
    pub endpoints: TimeRange,
    /// Field the window is expressed in
    pub time_field: TimeField,
    /// Calendar used for local dates
    pub calendar: LocalCalendar,
    /// Display preferences (glucose values in the slice are still mg/dL or as ingested)
    pub bg_prefs: BgPrefs,
    /// Weekdays contributing to the window
    pub active_days: ActiveDays,
    /// Number of active calendar days in the window
    pub active_day_count: usize,
    /// Glucose source selected for glucose statistics (`cbg` or `smbg`)
    pub bg_source: Option<&'a str>,
    /// Device ids that contributed data; written back to metadata
    pub matched_devices: &'a mut BTreeSet<String>,
}

impl StatsContext<'_> {
    /// Record that a device contributed to a statistic
    pub fn record_device(&mut self, record: &Record) {
        if let Some(device_id) = &record.device_id {
            self.matched_devices.insert(device_id.clone());
        }
    }
}

/// Statistics and per-date aggregations over the current window
pub trait StatsProvider: Send + Sync {
    /// Unique identifier for this provider
    fn provider_id(&self) -> &str;

    /// Compute a named statistic; `None` when the name is unknown
    fn compute_stat(&self, name: &str, slice: &[&Record], ctx: &mut StatsContext<'_>)
        -> Option<Value>;

    /// Compute a named per-date aggregation; `None` when the name is unknown
    fn compute_aggregation(
        &self,
        name: &str,
        slice: &[&Record],
        ctx: &mut StatsContext<'_>,
    ) -> Option<Value>;
}

// =============================================================================
// Clock Trait
// =============================================================================

/// Source of the current instant
pub trait Clock: Send + Sync {
    /// Current time in epoch milliseconds
    fn now_ms(&self) -> Timestamp;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Timestamp {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock frozen at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedClock(pub Timestamp);

impl Clock for FixedClock {
    fn now_ms(&self) -> Timestamp {
        self.0
    }
}
