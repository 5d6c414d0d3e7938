//! Schema registry for record types
//!
//! Each record type maps to an ordered list of [`RecordSchema`]s. A raw
//! record passes when any schema for its type accepts it; types without a
//! registered schema fall back to the common schema (id, type, time).

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;

use super::validation::{ValidationError, ValidationResult};
use crate::engine::traits::SchemaValidator;
use crate::record::Fields;
use crate::types::{parse_instant, parse_wall_clock};

/// Field data type for schema definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// JSON number
    Number,
    /// JSON string
    String,
    /// JSON boolean
    Boolean,
    /// JSON object
    Object,
    /// JSON array
    Array,
    /// ISO-8601 instant string
    Timestamp,
    /// Device wall-clock string
    WallClock,
    /// Any type (no type constraint)
    Any,
}

impl FieldType {
    /// Check if a value matches this type
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (FieldType::Any, _) => true,
            (FieldType::Number, Value::Number(_)) => true,
            (FieldType::String, Value::String(_)) => true,
            (FieldType::Boolean, Value::Bool(_)) => true,
            (FieldType::Object, Value::Object(_)) => true,
            (FieldType::Array, Value::Array(_)) => true,
            (FieldType::Timestamp | FieldType::WallClock, Value::String(_)) => true,
            _ => false,
        }
    }

    /// Get the type name as a string
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Number => "number",
            FieldType::String => "string",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Timestamp => "timestamp",
            FieldType::WallClock => "wall-clock time",
            FieldType::Any => "any",
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Field schema definition
#[derive(Debug, Clone)]
pub struct FieldSchema {
    /// Field name
    pub name: String,
    /// Expected field type
    pub field_type: FieldType,
    /// Is this field required?
    pub required: bool,
    /// Minimum value (for numeric types)
    pub min_value: Option<f64>,
    /// Maximum value (for numeric types)
    pub max_value: Option<f64>,
    /// Maximum string length (for string type)
    pub max_length: Option<usize>,
    /// Allowed values for string fields (empty = any)
    pub allowed_values: Vec<String>,
}

impl FieldSchema {
    /// Create a new required field schema
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            min_value: None,
            max_value: None,
            max_length: None,
            allowed_values: Vec::new(),
        }
    }

    /// Create a new optional field schema
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            required: false,
            ..Self::required(name, field_type)
        }
    }

    /// Set a lower bound for numeric fields
    pub fn with_min(mut self, min: f64) -> Self {
        self.min_value = Some(min);
        self
    }

    /// Set value range for numeric fields
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min_value = Some(min);
        self.max_value = Some(max);
        self
    }

    /// Set maximum length for string fields
    pub fn with_max_length(mut self, len: usize) -> Self {
        self.max_length = Some(len);
        self
    }

    /// Restrict to specific allowed values
    pub fn with_allowed_values(mut self, values: &[&str]) -> Self {
        self.allowed_values = values.iter().map(|v| v.to_string()).collect();
        self
    }

    /// Validate a field value against this schema
    pub fn validate(&self, value: &Value) -> Result<(), ValidationError> {
        if !self.field_type.matches(value) {
            return Err(ValidationError::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.name().to_string(),
                actual: json_type_name(value).to_string(),
            });
        }

        if let Some(v) = value.as_f64() {
            let below = self.min_value.is_some_and(|min| v < min);
            let above = self.max_value.is_some_and(|max| v > max);
            if below || above {
                return Err(ValidationError::ValueOutOfRange {
                    field: self.name.clone(),
                    value: v,
                    min: self.min_value,
                    max: self.max_value,
                });
            }
        }

        if let Value::String(s) = value {
            let parses = match self.field_type {
                FieldType::Timestamp => parse_instant(s).is_some(),
                FieldType::WallClock => parse_wall_clock(s).is_some(),
                _ => true,
            };
            if !parses {
                return Err(ValidationError::InvalidTimestamp {
                    field: self.name.clone(),
                    value: s.clone(),
                });
            }

            if let Some(max) = self.max_length {
                if s.len() > max {
                    return Err(ValidationError::StringTooLong {
                        field: self.name.clone(),
                        length: s.len(),
                        max,
                    });
                }
            }

            if !self.allowed_values.is_empty() && !self.allowed_values.iter().any(|a| a == s) {
                return Err(ValidationError::InvalidValue {
                    field: self.name.clone(),
                    value: s.clone(),
                    allowed: self.allowed_values.clone(),
                });
            }
        }

        Ok(())
    }
}

/// One named rule set for a record type
#[derive(Debug, Clone)]
pub struct RecordSchema {
    /// Schema name (reported in logs)
    pub name: String,
    /// Field schemas in check order
    pub fields: Vec<FieldSchema>,
}

impl RecordSchema {
    /// Create an empty schema
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Schema pre-populated with the fields every record carries
    pub fn common(name: impl Into<String>) -> Self {
        Self::new(name)
            .with_field(FieldSchema::required("id", FieldType::String).with_max_length(256))
            .with_field(FieldSchema::required("type", FieldType::String))
            .with_field(FieldSchema::required("time", FieldType::Timestamp))
            .with_field(FieldSchema::optional("deviceTime", FieldType::WallClock))
            .with_field(FieldSchema::optional("uploadId", FieldType::String))
            .with_field(FieldSchema::optional("deviceId", FieldType::String))
            .with_field(FieldSchema::optional("annotations", FieldType::Array))
    }

    /// Add a field schema, replacing one with the same name
    pub fn with_field(mut self, field: FieldSchema) -> Self {
        match self.fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => *existing = field,
            None => self.fields.push(field),
        }
        self
    }

    /// Get required field names
    pub fn required_fields(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
            .collect()
    }

    /// Check a raw record against every field rule
    pub fn check(&self, raw: &Fields) -> ValidationResult {
        let mut result = ValidationResult::ok();
        for field in &self.fields {
            match raw.get(&field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        result.add_error(ValidationError::MissingRequiredField {
                            field: field.name.clone(),
                        });
                    }
                },
                Some(value) => {
                    if let Err(e) = field.validate(value) {
                        result.add_error(e);
                    }
                },
            }
        }
        result
    }
}

/// Thread-safe schema registry
///
/// Schemas for a type are tried in registration order.
pub struct SchemaRegistry {
    /// Schemas by record type
    schemas: RwLock<HashMap<String, Vec<RecordSchema>>>,
    /// Fallback for unregistered types
    common: RecordSchema,
}

impl SchemaRegistry {
    /// Create a registry with only the common fallback
    pub fn new() -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
            common: RecordSchema::common("common"),
        }
    }

    /// Create a registry with the built-in device data rules
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        for (record_type, schema) in default_schemas() {
            registry.register(record_type, schema);
        }
        registry
    }

    /// Append a schema for a record type
    pub fn register(&self, record_type: &str, schema: RecordSchema) {
        self.schemas
            .write()
            .entry(record_type.to_string())
            .or_default()
            .push(schema);
    }

    /// Drop all schemas for a record type
    pub fn unregister(&self, record_type: &str) {
        self.schemas.write().remove(record_type);
    }

    /// Check if a record type has a schema
    pub fn has_schema(&self, record_type: &str) -> bool {
        self.schemas.read().contains_key(record_type)
    }

    /// Schema names registered for a type, in try order
    pub fn schema_names(&self, record_type: &str) -> Vec<String> {
        self.schemas
            .read()
            .get(record_type)
            .map(|list| list.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Get number of record types with schemas
    pub fn len(&self) -> usize {
        self.schemas.read().len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl SchemaValidator for SchemaRegistry {
    fn validator_id(&self) -> &str {
        "schema-registry"
    }

    fn validate(&self, record_type: &str, raw: &Fields) -> ValidationResult {
        let schemas = self.schemas.read();
        let Some(candidates) = schemas.get(record_type).filter(|c| !c.is_empty()) else {
            return self.common.check(raw);
        };

        let mut combined = ValidationResult::ok();
        for schema in candidates {
            let result = schema.check(raw);
            if result.is_ok() {
                return result;
            }
            combined.merge(result);
        }
        combined
    }
}

// ============================================================================
// Built-in rules
// ============================================================================

const BG_UNITS: &[&str] = &["mg/dL", "mg/dl", "mmol/L", "mmol/l"];

fn default_schemas() -> Vec<(&'static str, RecordSchema)> {
    let bg_reading = |name: &str| {
        RecordSchema::common(name)
            .with_field(FieldSchema::required("value", FieldType::Number).with_min(0.0))
            .with_field(FieldSchema::required("units", FieldType::String).with_allowed_values(BG_UNITS))
    };

    vec![
        (
            "basal",
            RecordSchema::common("basal")
                .with_field(
                    FieldSchema::required("deliveryType", FieldType::String)
                        .with_allowed_values(&["scheduled", "suspend", "temp", "automated"]),
                )
                .with_field(FieldSchema::optional("rate", FieldType::Number).with_min(0.0))
                .with_field(FieldSchema::optional("duration", FieldType::Number).with_min(0.0))
                .with_field(FieldSchema::optional("suppressed", FieldType::Object)),
        ),
        (
            "bolus",
            RecordSchema::common("bolus")
                .with_field(
                    FieldSchema::required("subType", FieldType::String)
                        .with_allowed_values(&["normal", "square", "dual/square", "automated"]),
                )
                .with_field(FieldSchema::optional("normal", FieldType::Number).with_min(0.0))
                .with_field(FieldSchema::optional("extended", FieldType::Number).with_min(0.0))
                .with_field(FieldSchema::optional("duration", FieldType::Number).with_min(0.0)),
        ),
        ("cbg", bg_reading("cbg")),
        ("smbg", bg_reading("smbg")),
        (
            "wizard",
            RecordSchema::common("wizard")
                .with_field(FieldSchema::optional("carbInput", FieldType::Number).with_min(0.0))
                .with_field(FieldSchema::optional("recommended", FieldType::Object))
                .with_field(FieldSchema::optional("bolus", FieldType::Any)),
        ),
        (
            "deviceEvent",
            RecordSchema::common("deviceEvent")
                .with_field(FieldSchema::required("subType", FieldType::String)),
        ),
        (
            "dosingDecision",
            RecordSchema::common("dosingDecision")
                .with_field(FieldSchema::optional("reason", FieldType::String))
                .with_field(FieldSchema::optional("associations", FieldType::Array)),
        ),
        (
            "pumpSettings",
            RecordSchema::common("pumpSettings")
                .with_field(FieldSchema::optional("basalSchedules", FieldType::Object))
                .with_field(FieldSchema::optional("activeSchedule", FieldType::String)),
        ),
        (
            "upload",
            RecordSchema::common("upload")
                .with_field(FieldSchema::optional("time", FieldType::Timestamp))
                .with_field(FieldSchema::optional("deviceTags", FieldType::Array))
                .with_field(FieldSchema::optional("deviceManufacturers", FieldType::Array)),
        ),
        ("food", RecordSchema::common("food")),
        ("message", RecordSchema::common("message")),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_field_type_matches() {
        assert!(FieldType::Number.matches(&json!(1)));
        assert!(FieldType::Number.matches(&json!(1.5)));
        assert!(!FieldType::Number.matches(&json!("1")));
        assert!(FieldType::Any.matches(&json!(null)));
        assert!(FieldType::Timestamp.matches(&json!("2018-02-01T00:00:00Z")));
    }

    #[test]
    fn test_field_schema_validate() {
        let schema = FieldSchema::required("value", FieldType::Number).with_range(0.0, 100.0);
        assert!(schema.validate(&json!(50)).is_ok());
        assert!(schema.validate(&json!(-1)).is_err());
        assert!(schema.validate(&json!(101)).is_err());
        assert!(schema.validate(&json!("test")).is_err());
    }

    #[test]
    fn test_timestamp_must_parse() {
        let schema = FieldSchema::required("time", FieldType::Timestamp);
        assert!(schema.validate(&json!("2018-02-01T00:00:00.000Z")).is_ok());
        assert!(matches!(
            schema.validate(&json!("yesterday")),
            Err(ValidationError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn test_default_basal_rules() {
        let registry = SchemaRegistry::with_defaults();
        let good = fields(json!({
            "id": "b1", "type": "basal", "time": "2018-02-01T01:00:00Z",
            "deliveryType": "scheduled", "rate": 0.25, "duration": 3600000
        }));
        assert!(registry.validate("basal", &good).is_ok());

        let bad = fields(json!({
            "id": "b2", "type": "basal", "time": "2018-02-01T01:00:00Z",
            "deliveryType": "sideways", "rate": -1
        }));
        let result = registry.validate("basal", &bad);
        assert_eq!(result.all_errors().len(), 2);
    }

    #[test]
    fn test_unknown_type_uses_common() {
        let registry = SchemaRegistry::with_defaults();
        let raw = fields(json!({"id": "x", "type": "cgmSettings", "time": "2018-02-01T00:00:00Z"}));
        assert!(registry.validate("cgmSettings", &raw).is_ok());

        let missing = fields(json!({"id": "x", "type": "cgmSettings"}));
        assert!(matches!(
            registry.validate("cgmSettings", &missing).first_error(),
            Some(ValidationError::MissingRequiredField { field }) if field == "time"
        ));
    }

    #[test]
    fn test_any_schema_may_pass() {
        let registry = SchemaRegistry::new();
        registry.register(
            "food",
            RecordSchema::common("food-strict")
                .with_field(FieldSchema::required("nutrition", FieldType::Object)),
        );
        registry.register("food", RecordSchema::common("food-loose"));
        assert_eq!(registry.schema_names("food"), vec!["food-strict", "food-loose"]);

        let raw = fields(json!({"id": "f", "type": "food", "time": "2018-02-01T00:00:00Z"}));
        assert!(registry.validate("food", &raw).is_ok());

        registry.unregister("food");
        assert!(!registry.has_schema("food"));
    }

    #[test]
    fn test_upload_time_optional() {
        let registry = SchemaRegistry::with_defaults();
        let raw = fields(json!({"id": "u", "type": "upload", "dataSetType": "continuous"}));
        assert!(registry.validate("upload", &raw).is_ok());
    }
}
