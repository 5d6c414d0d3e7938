//! Diabetes Data Engine - in-memory analytical store for diabetes device data
//!
//! This library ingests raw records uploaded from insulin pumps, glucose
//! monitors and meters, and answers windowed, timezone-aware queries for
//! charts and statistics:
//! - Validation with retained rejections (`reject` / `rejectReason`)
//! - Wizard, bolus, dosing-decision and pump-settings joins
//! - Derived tags (manual, automated, interrupted, override, ...)
//! - Bitmap indexes by type, subType, device, time and local calendar day
//! - Current/next/prev windows in local calendar days with DST handling
//! - Fill bins, boundary fix-ups, statistics and per-date aggregations
//!
//! # Example
//!
//! ```rust
//! use diabetes_data_engine::{DataEngineBuilder, QueryOptions};
//! use serde_json::json;
//!
//! let mut engine = DataEngineBuilder::new().build().unwrap();
//! let report = engine
//!     .add_data(
//!         &[json!({
//!             "id": "s1", "type": "smbg", "units": "mmol/L", "value": 5.5,
//!             "time": "2018-02-01T08:00:00.000Z"
//!         })],
//!         "subject-1",
//!     )
//!     .unwrap();
//! assert_eq!(report.added, 1);
//!
//! let opts = QueryOptions::from_json(&json!({
//!     "types": { "smbg": { "select": "id,value" } },
//!     "endpoints": ["2018-02-01T00:00:00.000Z", "2018-02-02T00:00:00.000Z"],
//!     "bgPrefs": { "bgUnits": "mg/dL" },
//!     "timePrefs": { "timezoneAware": true, "timezoneName": "UTC" }
//! }))
//! .unwrap();
//! let response = engine.query(&opts).unwrap();
//! let value = response.data.current.data["smbg"][0]["value"].as_f64().unwrap();
//! assert!((value - 99.0).abs() < 0.1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod error;
pub mod index;
pub mod record;
pub mod types;

/// Configuration management with TOML support
pub mod config;

/// Ingest pipeline: normalization, validation, joins and tagging
pub mod ingestion;

/// Query options, windows, denormalization, fill bins and the response shape
pub mod query;

/// Built-in statistics and per-date aggregations
pub mod stats;

/// Cached summaries of the stored data
pub mod metadata;

/// IANA timezone calendars
pub mod timezone;

/// Glucose units, conversion and classification bounds
pub mod units;

// Re-export main types
pub use config::EngineConfig;
pub use engine::{DataEngine, DataEngineBuilder, SharedEngine};
pub use error::{Error, QueryError, Result};
pub use ingestion::IngestReport;
pub use query::{QueryOptions, QueryResponse};
pub use record::{Record, RecordType};
pub use types::{TimeRange, Timestamp};
