//! Record model
//!
//! A [`Record`] is one device event. Fields every event shares live on the
//! record itself; the type-specific payload is a [`RecordKind`] variant.
//!
//! ```text
//! Record
//! ├── id, time, deviceTime, uploadId, deviceId, annotations
//! ├── raw_time / raw_device_time   original strings, restored in raw output
//! ├── tags, reject, reject_reason  engine-owned, never taken from input
//! └── kind
//!     ├── Basal ── suppressed ── suppressed ...   (bounded chain)
//!     ├── Bolus ── wizard: Link, dosing_decision
//!     ├── Wizard ── bolus: Link
//!     ├── DosingDecision ── pump_settings
//!     ├── Cbg / Smbg / Food / DeviceEvent / PumpSettings / Upload / Message
//!     ├── Other      unknown type, fields verbatim
//!     └── Unparsed   rejected input, fields verbatim
//! ```

pub mod payload;
pub mod tags;

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

pub use payload::{
    Amount, Association, Basal, BasalScheduleEntry, BgReading, BgSample, BgTarget, Bolus,
    BolusSubType, DeliveryType, DeviceEvent, DosingDecision, Food, Message, Origin, PumpSettings,
    Recommended, ScheduleAmount, SuppressedBasal, UnitsBlock, Upload, Wizard,
};
pub use tags::Tags;

use crate::types::Timestamp;

/// JSON object used for verbatim field storage
pub type Fields = serde_json::Map<String, Value>;

/// Annotation code marking a basal whose duration was not known at upload
pub const ANNOTATION_UNKNOWN_DURATION: &str = "basal/unknown-duration";
/// Annotation code marking a suspend whose resume was never recorded
pub const ANNOTATION_INCOMPLETE_TUPLE: &str = "status/incomplete-tuple";
/// Annotation code added after converting Medtronic exchanges back to grams
pub const ANNOTATION_CARB_DECONVERTED: &str = "medtronic/wizard/carb-to-exchange-ratio-deconverted";
/// Annotation code added to a basal overlapping a still-open suspend
pub const ANNOTATION_INTERSECTS_INCOMPLETE_SUSPEND: &str = "basal/intersects-incomplete-suspend";

// ============================================================================
// Record type
// ============================================================================

/// Discriminant of the record union
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordType {
    /// Basal insulin segment
    Basal,
    /// Insulin bolus
    Bolus,
    /// Continuous glucose reading
    Cbg,
    /// Fingerstick glucose reading
    Smbg,
    /// Bolus calculator
    Wizard,
    /// Food entry
    Food,
    /// Device event
    DeviceEvent,
    /// Loop dosing decision
    DosingDecision,
    /// Pump configuration
    PumpSettings,
    /// Upload session
    Upload,
    /// Timeline note
    Message,
    /// Engine-generated gap filler; never ingested
    Fill,
    /// Any other type string
    Other(String),
}

impl RecordType {
    /// Parse a type string; unknown strings become [`RecordType::Other`]
    pub fn parse(s: &str) -> Self {
        match s {
            "basal" => RecordType::Basal,
            "bolus" => RecordType::Bolus,
            "cbg" => RecordType::Cbg,
            "smbg" => RecordType::Smbg,
            "wizard" => RecordType::Wizard,
            "food" => RecordType::Food,
            "deviceEvent" => RecordType::DeviceEvent,
            "dosingDecision" => RecordType::DosingDecision,
            "pumpSettings" => RecordType::PumpSettings,
            "upload" => RecordType::Upload,
            "message" => RecordType::Message,
            "fill" => RecordType::Fill,
            other => RecordType::Other(other.to_string()),
        }
    }

    /// Wire name
    pub fn as_str(&self) -> &str {
        match self {
            RecordType::Basal => "basal",
            RecordType::Bolus => "bolus",
            RecordType::Cbg => "cbg",
            RecordType::Smbg => "smbg",
            RecordType::Wizard => "wizard",
            RecordType::Food => "food",
            RecordType::DeviceEvent => "deviceEvent",
            RecordType::DosingDecision => "dosingDecision",
            RecordType::PumpSettings => "pumpSettings",
            RecordType::Upload => "upload",
            RecordType::Message => "message",
            RecordType::Fill => "fill",
            RecordType::Other(name) => name,
        }
    }

    /// Types whose records carry a glucose value
    pub fn is_bg(&self) -> bool {
        matches!(self, RecordType::Cbg | RecordType::Smbg)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RecordType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RecordType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(RecordType::parse(&s))
    }
}

// ============================================================================
// Links
// ============================================================================

/// Reference from one record to another
#[derive(Debug, Clone, PartialEq)]
pub enum Link {
    /// Unresolved id (target missing, or resolution refused)
    Id(String),
    /// Embedded copy of the target with its own back-reference stripped
    Resolved(Box<Record>),
}

impl Link {
    /// Id of the referenced record
    pub fn target_id(&self) -> &str {
        match self {
            Link::Id(id) => id,
            Link::Resolved(record) => &record.id,
        }
    }

    /// Embedded target, if resolved
    pub fn resolved(&self) -> Option<&Record> {
        match self {
            Link::Id(_) => None,
            Link::Resolved(record) => Some(record),
        }
    }
}

// ============================================================================
// Record
// ============================================================================

/// Type-specific payload
#[derive(Debug, Clone, PartialEq)]
pub enum RecordKind {
    /// Basal segment
    Basal(Basal),
    /// Bolus
    Bolus(Bolus),
    /// Continuous glucose reading
    Cbg(BgReading),
    /// Fingerstick glucose reading
    Smbg(BgReading),
    /// Bolus calculator
    Wizard(Wizard),
    /// Food entry
    Food(Food),
    /// Device event
    DeviceEvent(DeviceEvent),
    /// Loop dosing decision
    DosingDecision(DosingDecision),
    /// Pump configuration
    PumpSettings(PumpSettings),
    /// Upload session
    Upload(Upload),
    /// Timeline note
    Message(Message),
    /// Unknown type, fields kept verbatim
    Other(Fields),
    /// Input that failed validation, fields kept verbatim
    Unparsed(Fields),
}

/// One normalized device event
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Unique id
    pub id: String,
    /// Discriminant
    pub record_type: RecordType,
    /// Absolute instant (epoch ms); 0 when a rejected record had no usable time
    pub time: Timestamp,
    /// Device wall clock read as UTC (epoch ms)
    pub device_time: Timestamp,
    /// Original `time` string
    pub raw_time: Option<String>,
    /// Original `deviceTime` string
    pub raw_device_time: Option<String>,
    /// Upload session id
    pub upload_id: Option<String>,
    /// Source device id
    pub device_id: Option<String>,
    /// Annotation objects, kept verbatim
    pub annotations: Vec<Value>,
    /// Derived classification
    pub tags: Tags,
    /// Failed validation or a join check
    pub reject: bool,
    /// Why the record was rejected
    pub reject_reason: Vec<String>,
    /// Type-specific payload
    pub kind: RecordKind,
}

impl Record {
    /// Build a record with empty common fields
    pub fn new(id: impl Into<String>, time: Timestamp, kind: RecordKind) -> Self {
        let record_type = match &kind {
            RecordKind::Basal(_) => RecordType::Basal,
            RecordKind::Bolus(_) => RecordType::Bolus,
            RecordKind::Cbg(_) => RecordType::Cbg,
            RecordKind::Smbg(_) => RecordType::Smbg,
            RecordKind::Wizard(_) => RecordType::Wizard,
            RecordKind::Food(_) => RecordType::Food,
            RecordKind::DeviceEvent(_) => RecordType::DeviceEvent,
            RecordKind::DosingDecision(_) => RecordType::DosingDecision,
            RecordKind::PumpSettings(_) => RecordType::PumpSettings,
            RecordKind::Upload(_) => RecordType::Upload,
            RecordKind::Message(_) => RecordType::Message,
            RecordKind::Other(fields) | RecordKind::Unparsed(fields) => RecordType::parse(
                fields.get("type").and_then(Value::as_str).unwrap_or("unknown"),
            ),
        };
        Self {
            id: id.into(),
            record_type,
            time,
            device_time: time,
            raw_time: None,
            raw_device_time: None,
            upload_id: None,
            device_id: None,
            annotations: Vec::new(),
            tags: Tags::default(),
            reject: false,
            reject_reason: Vec::new(),
            kind,
        }
    }

    /// Check for an annotation by code
    pub fn has_annotation(&self, code: &str) -> bool {
        self.annotations
            .iter()
            .any(|a| a.get("code").and_then(Value::as_str) == Some(code))
    }

    /// Add an annotation unless one with the same code exists
    pub fn add_annotation(&mut self, code: &str) {
        if !self.has_annotation(code) {
            self.annotations
                .push(serde_json::json!({ "code": code }));
        }
    }

    /// Flag as rejected with a reason
    pub fn reject_with(&mut self, reason: impl Into<String>) {
        self.reject = true;
        self.reject_reason.push(reason.into());
    }

    /// Value used by the subType dimension
    pub fn sub_type(&self) -> Option<&str> {
        match &self.kind {
            RecordKind::Bolus(b) => Some(match b.sub_type {
                BolusSubType::Normal => "normal",
                BolusSubType::Square => "square",
                BolusSubType::DualSquare => "dual/square",
                BolusSubType::Automated => "automated",
                BolusSubType::Unknown => "unknown",
            }),
            RecordKind::Cbg(r) | RecordKind::Smbg(r) => r.sub_type.as_deref(),
            RecordKind::DeviceEvent(e) => e.sub_type.as_deref(),
            RecordKind::Other(fields) | RecordKind::Unparsed(fields) => {
                fields.get("subType").and_then(Value::as_str)
            },
            _ => None,
        }
    }

    /// Duration for records that span time
    pub fn duration(&self) -> Option<i64> {
        match &self.kind {
            RecordKind::Basal(b) => b.duration,
            RecordKind::DeviceEvent(e) => e.duration,
            _ => None,
        }
    }

    /// End of a spanning record (`time + duration`)
    pub fn end_time(&self) -> Option<Timestamp> {
        self.duration().map(|d| self.time.saturating_add(d.max(0)))
    }

    /// Shallow copy suitable for embedding in another record
    ///
    /// Cross-record links are removed so embedded copies never form cycles.
    pub fn stripped_for_embedding(&self) -> Record {
        let mut copy = self.clone();
        match &mut copy.kind {
            RecordKind::Bolus(b) => {
                b.wizard = None;
                b.dosing_decision = None;
            },
            RecordKind::Wizard(w) => w.bolus = None,
            _ => {},
        }
        copy
    }

    /// Serialize the payload (without links) to a JSON object
    pub fn payload_fields(&self) -> Fields {
        let value = match &self.kind {
            RecordKind::Basal(p) => serde_json::to_value(p),
            RecordKind::Bolus(p) => serde_json::to_value(p),
            RecordKind::Cbg(p) | RecordKind::Smbg(p) => serde_json::to_value(p),
            RecordKind::Wizard(p) => serde_json::to_value(p),
            RecordKind::Food(p) => serde_json::to_value(p),
            RecordKind::DeviceEvent(p) => serde_json::to_value(p),
            RecordKind::DosingDecision(p) => serde_json::to_value(p),
            RecordKind::PumpSettings(p) => serde_json::to_value(p),
            RecordKind::Upload(p) => serde_json::to_value(p),
            RecordKind::Message(p) => serde_json::to_value(p),
            RecordKind::Other(fields) | RecordKind::Unparsed(fields) => {
                return fields.clone();
            },
        };
        match value {
            Ok(Value::Object(map)) => map,
            _ => Fields::new(),
        }
    }

    /// Basal payload, if any
    pub fn as_basal(&self) -> Option<&Basal> {
        match &self.kind {
            RecordKind::Basal(b) => Some(b),
            _ => None,
        }
    }

    /// Bolus payload, if any
    pub fn as_bolus(&self) -> Option<&Bolus> {
        match &self.kind {
            RecordKind::Bolus(b) => Some(b),
            _ => None,
        }
    }

    /// Wizard payload, if any
    pub fn as_wizard(&self) -> Option<&Wizard> {
        match &self.kind {
            RecordKind::Wizard(w) => Some(w),
            _ => None,
        }
    }

    /// Upload payload, if any
    pub fn as_upload(&self) -> Option<&Upload> {
        match &self.kind {
            RecordKind::Upload(u) => Some(u),
            _ => None,
        }
    }

    /// Pump settings payload, if any
    pub fn as_pump_settings(&self) -> Option<&PumpSettings> {
        match &self.kind {
            RecordKind::PumpSettings(p) => Some(p),
            _ => None,
        }
    }

    /// Glucose reading payload, if any
    pub fn as_bg_reading(&self) -> Option<&BgReading> {
        match &self.kind {
            RecordKind::Cbg(r) | RecordKind::Smbg(r) => Some(r),
            _ => None,
        }
    }
}
