//! Field-level validation errors and results
//!
//! A schema check never stops at the first problem: every failing field
//! contributes a [`ValidationError`], and the messages end up verbatim in a
//! rejected record's `rejectReason`.

use std::fmt;

/// Validation error types
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Missing required field
    MissingRequiredField {
        /// Field name
        field: String,
    },

    /// Type mismatch with schema
    TypeMismatch {
        /// Field name
        field: String,
        /// Expected type
        expected: String,
        /// Actual type
        actual: String,
    },

    /// Value out of range
    ValueOutOfRange {
        /// Field name
        field: String,
        /// Actual value
        value: f64,
        /// Minimum allowed
        min: Option<f64>,
        /// Maximum allowed
        max: Option<f64>,
    },

    /// Value outside an enumerated set
    InvalidValue {
        /// Field name
        field: String,
        /// Actual value
        value: String,
        /// Allowed values
        allowed: Vec<String>,
    },

    /// String too long
    StringTooLong {
        /// Field name
        field: String,
        /// Actual length
        length: usize,
        /// Maximum allowed
        max: usize,
    },

    /// Time string that does not parse as ISO-8601
    InvalidTimestamp {
        /// Field name
        field: String,
        /// Offending value
        value: String,
    },

    /// Rule supplied by a custom validator
    Custom {
        /// Field name
        field: String,
        /// Message
        message: String,
    },
}

impl ValidationError {
    /// Name of the field the error refers to
    pub fn field(&self) -> &str {
        match self {
            ValidationError::MissingRequiredField { field }
            | ValidationError::TypeMismatch { field, .. }
            | ValidationError::ValueOutOfRange { field, .. }
            | ValidationError::InvalidValue { field, .. }
            | ValidationError::StringTooLong { field, .. }
            | ValidationError::InvalidTimestamp { field, .. }
            | ValidationError::Custom { field, .. } => field,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::MissingRequiredField { field } => {
                write!(f, "Missing required field: {}", field)
            },
            ValidationError::TypeMismatch {
                field,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Type mismatch for field '{}': expected {}, got {}",
                    field, expected, actual
                )
            },
            ValidationError::ValueOutOfRange {
                field,
                value,
                min,
                max,
            } => {
                write!(
                    f,
                    "Value {} for field '{}' out of range [{:?}, {:?}]",
                    value, field, min, max
                )
            },
            ValidationError::InvalidValue {
                field,
                value,
                allowed,
            } => {
                write!(
                    f,
                    "Invalid value '{}' for field '{}', allowed: {:?}",
                    value, field, allowed
                )
            },
            ValidationError::StringTooLong { field, length, max } => {
                write!(
                    f,
                    "String value for field '{}' too long: {} > {}",
                    field, length, max
                )
            },
            ValidationError::InvalidTimestamp { field, value } => {
                write!(f, "Invalid timestamp for field '{}': {}", field, value)
            },
            ValidationError::Custom { field, message } => {
                write!(f, "{}: {}", field, message)
            },
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validation result with multiple possible errors
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationResult {
    /// List of validation errors (empty if valid)
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    /// Create a successful result
    pub fn ok() -> Self {
        Self { errors: Vec::new() }
    }

    /// Create a result with one error
    pub fn err(error: ValidationError) -> Self {
        Self {
            errors: vec![error],
        }
    }

    /// Add an error to the result
    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    /// Merge another result's errors, skipping duplicates
    pub fn merge(&mut self, other: ValidationResult) {
        for error in other.errors {
            if !self.errors.contains(&error) {
                self.errors.push(error);
            }
        }
    }

    /// Check if validation passed
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Check if validation failed
    pub fn is_err(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Get first error
    pub fn first_error(&self) -> Option<&ValidationError> {
        self.errors.first()
    }

    /// Get all errors
    pub fn all_errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Human-readable messages, one per error
    pub fn messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let mut result = ValidationResult::ok();
        assert!(result.is_ok());
        result.add_error(ValidationError::MissingRequiredField {
            field: "time".to_string(),
        });
        result.add_error(ValidationError::InvalidValue {
            field: "deliveryType".to_string(),
            value: "bogus".to_string(),
            allowed: vec!["temp".to_string()],
        });
        assert!(result.is_err());
        assert_eq!(result.first_error().map(|e| e.field()), Some("time"));
        assert_eq!(
            result.messages(),
            vec![
                "Missing required field: time".to_string(),
                "Invalid value 'bogus' for field 'deliveryType', allowed: [\"temp\"]".to_string(),
            ]
        );
    }

    #[test]
    fn test_merge_dedupes() {
        let error = ValidationError::MissingRequiredField {
            field: "id".to_string(),
        };
        let mut a = ValidationResult::err(error.clone());
        a.merge(ValidationResult::err(error));
        assert_eq!(a.all_errors().len(), 1);
    }
}
