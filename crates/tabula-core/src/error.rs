use thiserror::Error;

use crate::types::{DataType, FilterOperator};

/// Top-level error type for the Tabula engine.
///
/// The first group of variants is the business taxonomy surfaced to callers
/// for invalid input; none of them is retried. The remaining variants wrap
/// infrastructure failures from storage, configuration and serialization.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TabulaError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Validation failed for '{field}': {reason}")]
    Validation { field: String, reason: String },

    #[error("Type mismatch for '{field}': expected {expected}")]
    TypeMismatch { field: String, expected: DataType },

    #[error("Uniqueness violation on '{field}': value {value} already exists")]
    UniquenessViolation { field: String, value: String },

    #[error("Referential integrity error on '{field}': {target} does not exist")]
    ReferentialIntegrity { field: String, target: String },

    #[error("Operator {operator} is not supported for '{field}' ({data_type})")]
    UnsupportedOperator {
        field: String,
        operator: FilterOperator,
        data_type: DataType,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Search error: {0}")]
    Search(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TabulaError {
    /// Shorthand for a [`TabulaError::Validation`].
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        TabulaError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// True for the value-level failures (constraint violations and type mismatches).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TabulaError::Validation { .. } | TabulaError::TypeMismatch { .. }
        )
    }
}

impl From<toml::de::Error> for TabulaError {
    fn from(err: toml::de::Error) -> Self {
        TabulaError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for TabulaError {
    fn from(err: toml::ser::Error) -> Self {
        TabulaError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for TabulaError {
    fn from(err: serde_json::Error) -> Self {
        TabulaError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Tabula operations.
pub type Result<T> = std::result::Result<T, TabulaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TabulaError::Schema("unknown field 'Foo'".to_string());
        assert_eq!(err.to_string(), "Schema error: unknown field 'Foo'");
    }

    #[test]
    fn test_error_display_business_variants() {
        let cases: Vec<(TabulaError, &str)> = vec![
            (
                TabulaError::validation("Name", "value is required"),
                "Validation failed for 'Name': value is required",
            ),
            (
                TabulaError::TypeMismatch {
                    field: "Age".to_string(),
                    expected: DataType::Number,
                },
                "Type mismatch for 'Age': expected number",
            ),
            (
                TabulaError::UniquenessViolation {
                    field: "Name".to_string(),
                    value: "Ada".to_string(),
                },
                "Uniqueness violation on 'Name': value Ada already exists",
            ),
            (
                TabulaError::UnsupportedOperator {
                    field: "Active".to_string(),
                    operator: FilterOperator::GreaterThan,
                    data_type: DataType::Boolean,
                },
                "Operator greater_than is not supported for 'Active' (boolean)",
            ),
            (
                TabulaError::NotFound("record 42".to_string()),
                "Not found: record 42",
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn test_is_validation() {
        assert!(TabulaError::validation("A", "too long").is_validation());
        assert!(TabulaError::TypeMismatch {
            field: "A".into(),
            expected: DataType::Date,
        }
        .is_validation());
        assert!(!TabulaError::Schema("x".into()).is_validation());
        assert!(!TabulaError::UniquenessViolation {
            field: "A".into(),
            value: "b".into(),
        }
        .is_validation());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: TabulaError = io_err.into();
        assert!(matches!(err, TabulaError::Io(_)));
        assert!(err.to_string().contains("access denied"));
    }

    #[test]
    fn test_error_from_toml_de() {
        let err: std::result::Result<toml::Value, _> = toml::from_str("invalid = [[[");
        let err: TabulaError = err.unwrap_err().into();
        assert!(matches!(err, TabulaError::Config(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let err: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let err: TabulaError = err.unwrap_err().into();
        assert!(matches!(err, TabulaError::Serialization(_)));
    }
}
