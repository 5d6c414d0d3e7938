//! Ingest normalizer
//!
//! Turns one raw JSON object into a [`Record`]:
//!
//! ```text
//! raw object
//!   │ strip engine-owned fields, promote legacy message fields
//!   v
//! validate ──fail──> Record { reject, kind: Unparsed(raw) }
//!   │
//!   v
//! parse time / deviceTime (originals kept for raw output)
//!   │
//!   v
//! lift links (wizard.bolus, bolus.wizard) out of the payload
//!   │
//!   v
//! deserialize payload ──fail──> rejected
//!   │
//!   v
//! type fix-ups (basal rate/duration/suppressed, continuous upload time)
//! ```
//!
//! Records without a string `id` cannot be stored and are refused with
//! [`Error::Unstorable`].

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use super::schema::is_engine_owned;
use crate::config::IngestConfig;
use crate::engine::traits::SchemaValidator;
use crate::error::{Error, Result};
use crate::record::{
    Basal, Bolus, DeliveryType, Fields, Link, Record, RecordKind, RecordType, SuppressedBasal,
    Wizard, ANNOTATION_UNKNOWN_DURATION,
};
use crate::types::{parse_instant, parse_wall_clock, Timestamp};

/// Common keys lifted onto [`Record`] before payload deserialization
const COMMON_KEYS: &[&str] = &[
    "id",
    "type",
    "time",
    "deviceTime",
    "uploadId",
    "deviceId",
    "annotations",
];

/// Legacy message field names and their canonical replacements
const MESSAGE_ALIASES: &[(&str, &str)] = &[
    ("messagetext", "messageText"),
    ("parentmessage", "parentMessage"),
    ("timestamp", "time"),
];

/// Normalizes raw records for one ingest batch
pub struct Normalizer<'a> {
    validator: Option<&'a dyn SchemaValidator>,
    config: &'a IngestConfig,
    now: Timestamp,
}

impl<'a> Normalizer<'a> {
    /// Create a normalizer; `now` clamps ongoing basals and dates continuous uploads
    pub fn new(
        validator: Option<&'a dyn SchemaValidator>,
        config: &'a IngestConfig,
        now: Timestamp,
    ) -> Self {
        Self {
            validator,
            config,
            now,
        }
    }

    /// Normalize one raw record
    pub fn normalize(&self, raw: &Value) -> Result<Record> {
        let Value::Object(original) = raw else {
            return Err(Error::Unstorable("record is not a JSON object".to_string()));
        };
        let Some(id) = original.get("id").and_then(Value::as_str).map(str::to_string) else {
            return Err(Error::Unstorable("record has no string id".to_string()));
        };

        let mut fields = original.clone();
        fields.retain(|key, _| !is_engine_owned(key));

        let type_name = fields
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let record_type = RecordType::parse(&type_name);
        if record_type == RecordType::Fill {
            return Err(Error::Unstorable(format!(
                "record {} has engine-reserved type fill",
                id
            )));
        }
        if record_type == RecordType::Message {
            promote_message_fields(&mut fields);
        }

        if self.config.validate {
            if let Some(validator) = self.validator {
                let result = validator.validate(&type_name, &fields);
                if result.is_err() {
                    debug!(id = %id, record_type = %type_name, errors = result.errors.len(), "Record failed validation");
                    return Ok(self.rejected(id, record_type, fields, result.messages()));
                }
            }
        }

        // Times
        let raw_time = fields.get("time").and_then(Value::as_str).map(str::to_string);
        let time = match (fields.get("time"), &record_type) {
            (Some(value), _) => read_time(value, parse_instant),
            (None, RecordType::Upload) if is_continuous(&fields) => Some(self.now),
            (None, _) => None,
        };
        let Some(time) = time else {
            let reason = match fields.get("time") {
                Some(value) => format!("Invalid timestamp for field 'time': {}", value),
                None => "Missing required field: time".to_string(),
            };
            return Ok(self.rejected(id, record_type, fields, vec![reason]));
        };
        let raw_device_time = fields
            .get("deviceTime")
            .and_then(Value::as_str)
            .map(str::to_string);
        let device_time = fields
            .get("deviceTime")
            .and_then(|v| read_time(v, parse_wall_clock))
            .unwrap_or(time);

        let upload_id = fields.get("uploadId").and_then(Value::as_str).map(str::to_string);
        let device_id = fields.get("deviceId").and_then(Value::as_str).map(str::to_string);
        let annotations = match fields.get("annotations") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };

        let mut payload = fields.clone();
        for key in COMMON_KEYS {
            payload.remove(*key);
        }

        let kind = match self.build_kind(&record_type, payload, time) {
            Ok(kind) => kind,
            Err(reason) => {
                debug!(id = %id, record_type = %type_name, %reason, "Record payload malformed");
                return Ok(self.rejected(id, record_type, fields, vec![reason]));
            },
        };

        let mut record = Record::new(id, time, kind);
        record.record_type = record_type;
        record.device_time = device_time;
        record.raw_time = raw_time;
        record.raw_device_time = raw_device_time;
        record.upload_id = upload_id;
        record.device_id = device_id;
        record.annotations = annotations;

        if let RecordKind::Basal(basal) = &mut record.kind {
            fix_up_basal(
                &record.id,
                basal,
                record.time,
                record.device_time,
                &record.annotations,
                self.config.max_suppressed_depth,
                self.now,
            );
        }

        Ok(record)
    }

    fn build_kind(
        &self,
        record_type: &RecordType,
        mut payload: Fields,
        time: Timestamp,
    ) -> std::result::Result<RecordKind, String> {
        let kind = match record_type {
            RecordType::Basal => RecordKind::Basal(decode(payload, record_type)?),
            RecordType::Bolus => {
                let wizard = payload.remove("wizard").and_then(link_from);
                payload.remove("dosingDecision");
                let mut bolus: Bolus = decode(payload, record_type)?;
                bolus.wizard = wizard;
                RecordKind::Bolus(bolus)
            },
            RecordType::Wizard => {
                let bolus_link = payload.remove("bolus").and_then(link_from);
                let mut wizard: Wizard = decode(payload, record_type)?;
                wizard.bolus = bolus_link;
                RecordKind::Wizard(wizard)
            },
            RecordType::Cbg => RecordKind::Cbg(decode(payload, record_type)?),
            RecordType::Smbg => RecordKind::Smbg(decode(payload, record_type)?),
            RecordType::Food => RecordKind::Food(decode(payload, record_type)?),
            RecordType::DeviceEvent => RecordKind::DeviceEvent(decode(payload, record_type)?),
            RecordType::DosingDecision => {
                payload.remove("pumpSettings");
                RecordKind::DosingDecision(decode(payload, record_type)?)
            },
            RecordType::PumpSettings => RecordKind::PumpSettings(decode(payload, record_type)?),
            RecordType::Upload => RecordKind::Upload(decode(payload, record_type)?),
            RecordType::Message => RecordKind::Message(decode(payload, record_type)?),
            RecordType::Fill => {
                return Err(format!("fill record at {} cannot be ingested", time));
            },
            RecordType::Other(_) => RecordKind::Other(payload),
        };
        Ok(kind)
    }

    fn rejected(
        &self,
        id: String,
        record_type: RecordType,
        fields: Fields,
        reasons: Vec<String>,
    ) -> Record {
        let raw_time = fields.get("time").and_then(Value::as_str).map(str::to_string);
        let time = fields
            .get("time")
            .and_then(|v| read_time(v, parse_instant))
            .unwrap_or(0);
        let raw_device_time = fields
            .get("deviceTime")
            .and_then(Value::as_str)
            .map(str::to_string);
        let device_time = fields
            .get("deviceTime")
            .and_then(|v| read_time(v, parse_wall_clock))
            .unwrap_or(time);
        let upload_id = fields.get("uploadId").and_then(Value::as_str).map(str::to_string);
        let device_id = fields.get("deviceId").and_then(Value::as_str).map(str::to_string);

        let mut record = Record::new(id, time, RecordKind::Unparsed(fields));
        record.record_type = record_type;
        record.device_time = device_time;
        record.raw_time = raw_time;
        record.raw_device_time = raw_device_time;
        record.upload_id = upload_id;
        record.device_id = device_id;
        record.reject = true;
        record.reject_reason = reasons;
        record
    }
}

fn decode<T: DeserializeOwned>(
    payload: Fields,
    record_type: &RecordType,
) -> std::result::Result<T, String> {
    serde_json::from_value(Value::Object(payload))
        .map_err(|e| format!("Malformed {} payload: {}", record_type, e))
}

fn read_time(value: &Value, parse: fn(&str) -> Option<Timestamp>) -> Option<Timestamp> {
    match value {
        Value::String(s) => parse(s),
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()).map(|v| v.round() as i64),
        _ => None,
    }
}

fn is_continuous(fields: &Fields) -> bool {
    fields.get("dataSetType").and_then(Value::as_str) == Some("continuous")
}

/// A link given as an id string, or as an embedded object carrying an id
fn link_from(value: Value) -> Option<Link> {
    match value {
        Value::String(id) => Some(Link::Id(id)),
        Value::Object(map) => map
            .get("id")
            .and_then(Value::as_str)
            .map(|id| Link::Id(id.to_string())),
        _ => None,
    }
}

fn promote_message_fields(fields: &mut Fields) {
    for (legacy, canonical) in MESSAGE_ALIASES {
        if let Some(value) = fields.remove(*legacy) {
            fields.entry(canonical.to_string()).or_insert(value);
        }
    }
}

/// Basal fix-ups: suspend rate, suppressed inheritance and depth, ongoing duration
fn fix_up_basal(
    id: &str,
    basal: &mut Basal,
    time: Timestamp,
    device_time: Timestamp,
    annotations: &[Value],
    max_depth: usize,
    now: Timestamp,
) {
    if basal.delivery_type == DeliveryType::Suspend && basal.rate.is_none() {
        basal.rate = Some(0.0);
    }

    let unknown_duration = annotations
        .iter()
        .any(|a| a.get("code").and_then(Value::as_str) == Some(ANNOTATION_UNKNOWN_DURATION));
    if unknown_duration || basal.duration.is_none() {
        let ongoing = now.saturating_sub(time).max(0);
        basal.duration = Some(basal.duration.map_or(ongoing, |d| d.min(ongoing)));
    }

    if let Some(suppressed) = basal.suppressed.as_deref_mut() {
        let truncated = inherit_suppressed(suppressed, basal.duration, time, device_time, 1, max_depth);
        if truncated {
            warn!(id = %id, max_depth, "Suppressed basal chain truncated");
        }
    }
}

/// Propagate parent fields down the chain; returns true when levels were dropped
fn inherit_suppressed(
    level: &mut SuppressedBasal,
    duration: Option<i64>,
    time: Timestamp,
    device_time: Timestamp,
    depth: usize,
    max_depth: usize,
) -> bool {
    if level.duration.is_none() {
        level.duration = duration;
    }
    if level.time.is_none() {
        level.time = Some(time);
    }
    if level.device_time.is_none() {
        level.device_time = Some(device_time);
    }
    if level.delivery_type == DeliveryType::Suspend && level.rate.is_none() {
        level.rate = Some(0.0);
    }

    if depth >= max_depth {
        return level.suppressed.take().is_some();
    }

    let (duration, time, device_time) = (
        level.duration,
        level.time.unwrap_or(time),
        level.device_time.unwrap_or(device_time),
    );
    match level.suppressed.as_deref_mut() {
        Some(next) => inherit_suppressed(next, duration, time, device_time, depth + 1, max_depth),
        None => false,
    }
}
