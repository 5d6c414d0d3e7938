//! Schema validation and registry module
//!
//! Raw records are checked against per-type rule sets before any
//! normalization. Failures never raise: they become `reject` flags with
//! one message per failing field.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   Schema Registry                        │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │ basal       │  │ bolus       │  │ cbg / smbg  │ ... │
//! │  │ [schema..]  │  │ [schema..]  │  │ [schema..]  │     │
//! │  └──────┬──────┘  └──────┬──────┘  └──────┬──────┘     │
//! └─────────┼────────────────┼────────────────┼─────────────┘
//!           │   first passing schema wins     │
//!           └────────────────┬────────────────┘
//!                            v
//!              ┌─────────────────────────┐
//!              │   common fallback       │
//!              │   id / type / time      │
//!              └─────────────────────────┘
//! ```

pub mod registry;
pub mod validation;

pub use registry::{FieldSchema, FieldType, RecordSchema, SchemaRegistry};
pub use validation::{ValidationError, ValidationResult};

/// Fields only the engine may set; supplied values are discarded at ingest
pub const ENGINE_OWNED_FIELDS: &[&str] = &[
    "tags",
    "reject",
    "rejectReason",
    "normalTime",
    "normalEnd",
    "displayOffset",
    "msPer24",
    "localDate",
];

/// Check if a field is engine-owned
pub fn is_engine_owned(name: &str) -> bool {
    ENGINE_OWNED_FIELDS.contains(&name)
}
