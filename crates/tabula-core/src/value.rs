//! Field type system: canonical values, normalization, constraint
//! validation, operator support and comparison.
//!
//! Every raw value entering the engine passes through [`normalize`], which
//! produces a [`CanonicalValue`] of the kind dictated by the field's
//! [`DataType`]. Constraint checks ([`validate`]) and index projection then
//! match exhaustively on that closed set.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use regex::Regex;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Result, TabulaError};
use crate::types::{DataType, Field, FilterOperator, Table};

/// Canonical values of a row, keyed by declared field name.
pub type Values = BTreeMap<String, CanonicalValue>;

/// The normalized, type-checked in-memory form of a field value.
#[derive(Clone, Debug, PartialEq)]
pub enum CanonicalValue {
    /// Text, Note, Tags, Json, File and Enum fields.
    Text(String),
    Number(i64),
    Decimal(Decimal),
    Boolean(bool),
    /// Date and DateTime fields.
    Instant(DateTime<Utc>),
    /// Lookup fields.
    Uuid(Uuid),
}

impl CanonicalValue {
    pub fn kind(&self) -> &'static str {
        match self {
            CanonicalValue::Text(_) => "text",
            CanonicalValue::Number(_) => "number",
            CanonicalValue::Decimal(_) => "decimal",
            CanonicalValue::Boolean(_) => "boolean",
            CanonicalValue::Instant(_) => "instant",
            CanonicalValue::Uuid(_) => "uuid",
        }
    }

    /// JSON encoding used in stored documents.
    ///
    /// Decimals are written as strings so no precision is lost on the way
    /// back through [`normalize`].
    pub fn to_json(&self) -> Value {
        match self {
            CanonicalValue::Text(s) => Value::String(s.clone()),
            CanonicalValue::Number(n) => Value::from(*n),
            CanonicalValue::Decimal(d) => Value::String(d.normalize().to_string()),
            CanonicalValue::Boolean(b) => Value::Bool(*b),
            CanonicalValue::Instant(t) => {
                Value::String(t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            CanonicalValue::Uuid(id) => Value::String(id.to_string()),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CanonicalValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            CanonicalValue::Uuid(id) => Some(*id),
            _ => None,
        }
    }

    fn as_decimal(&self) -> Option<Decimal> {
        match self {
            CanonicalValue::Number(n) => Some(Decimal::from(*n)),
            CanonicalValue::Decimal(d) => Some(*d),
            _ => None,
        }
    }
}

impl fmt::Display for CanonicalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanonicalValue::Text(s) => f.write_str(s),
            CanonicalValue::Number(n) => write!(f, "{}", n),
            CanonicalValue::Decimal(d) => write!(f, "{}", d.normalize()),
            CanonicalValue::Boolean(b) => write!(f, "{}", b),
            CanonicalValue::Instant(t) => {
                f.write_str(&t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            CanonicalValue::Uuid(id) => write!(f, "{}", id),
        }
    }
}

impl Serialize for CanonicalValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

// =============================================================================
// Normalization
// =============================================================================

fn mismatch(field: &Field) -> TabulaError {
    TabulaError::TypeMismatch {
        field: field.name.clone(),
        expected: field.data_type,
    }
}

/// Convert a raw JSON value into the canonical form for `field`.
///
/// `null` is not a value; callers treat it as absent before getting here.
pub fn normalize(field: &Field, raw: &Value) -> Result<CanonicalValue> {
    match field.data_type {
        DataType::Text | DataType::Note | DataType::File => match raw {
            Value::String(s) => Ok(CanonicalValue::Text(s.clone())),
            Value::Number(n) => Ok(CanonicalValue::Text(n.to_string())),
            Value::Bool(b) => Ok(CanonicalValue::Text(b.to_string())),
            _ => Err(mismatch(field)),
        },
        DataType::Tags => match raw {
            Value::String(s) => Ok(CanonicalValue::Text(s.clone())),
            Value::Array(items) => {
                let tags = items
                    .iter()
                    .map(|item| item.as_str().ok_or_else(|| mismatch(field)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(CanonicalValue::Text(tags.join(", ")))
            }
            _ => Err(mismatch(field)),
        },
        DataType::Json => match raw {
            Value::String(s) => Ok(CanonicalValue::Text(s.clone())),
            Value::Null => Err(mismatch(field)),
            other => Ok(CanonicalValue::Text(serde_json::to_string(other)?)),
        },
        DataType::Enum => match raw {
            Value::String(s) => {
                // Canonical spelling is the declared one.
                let declared = field
                    .constraints
                    .enum_values
                    .iter()
                    .find(|v| v.eq_ignore_ascii_case(s.trim()));
                Ok(CanonicalValue::Text(
                    declared.cloned().unwrap_or_else(|| s.clone()),
                ))
            }
            _ => Err(mismatch(field)),
        },
        DataType::Number => match raw {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    return Ok(CanonicalValue::Number(i));
                }
                match n.as_f64() {
                    // i64::MAX as f64 rounds up to 2^63, which is out of range.
                    Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
                        Ok(CanonicalValue::Number(f as i64))
                    }
                    _ => Err(mismatch(field)),
                }
            }
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(CanonicalValue::Number)
                .map_err(|_| mismatch(field)),
            _ => Err(mismatch(field)),
        },
        DataType::Decimal => match raw {
            Value::Number(n) => parse_decimal(&n.to_string())
                .map(CanonicalValue::Decimal)
                .ok_or_else(|| mismatch(field)),
            Value::String(s) => parse_decimal(s)
                .map(CanonicalValue::Decimal)
                .ok_or_else(|| mismatch(field)),
            _ => Err(mismatch(field)),
        },
        DataType::Boolean => match raw {
            Value::Bool(b) => Ok(CanonicalValue::Boolean(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(CanonicalValue::Boolean(false)),
                Some(1) => Ok(CanonicalValue::Boolean(true)),
                _ => Err(mismatch(field)),
            },
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(CanonicalValue::Boolean(true)),
                "false" | "no" | "0" => Ok(CanonicalValue::Boolean(false)),
                _ => Err(mismatch(field)),
            },
            _ => Err(mismatch(field)),
        },
        DataType::Date | DataType::DateTime => {
            let s = raw.as_str().ok_or_else(|| mismatch(field))?;
            let instant = parse_instant(s).ok_or_else(|| mismatch(field))?;
            if field.data_type == DataType::Date {
                let midnight = instant
                    .date_naive()
                    .and_hms_opt(0, 0, 0)
                    .ok_or_else(|| mismatch(field))?;
                Ok(CanonicalValue::Instant(midnight.and_utc()))
            } else {
                Ok(CanonicalValue::Instant(instant))
            }
        }
        DataType::Lookup => {
            let s = raw.as_str().ok_or_else(|| mismatch(field))?;
            Uuid::parse_str(s.trim())
                .map(CanonicalValue::Uuid)
                .map_err(|_| mismatch(field))
        }
    }
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    let s = s.trim();
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
}

/// Parse RFC 3339, a naive date-time (taken as UTC) or a bare date.
pub fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

// =============================================================================
// Validation
// =============================================================================

fn expected_kind(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Text
        | DataType::Note
        | DataType::Tags
        | DataType::Json
        | DataType::File
        | DataType::Enum => "text",
        DataType::Number => "number",
        DataType::Decimal => "decimal",
        DataType::Boolean => "boolean",
        DataType::Date | DataType::DateTime => "instant",
        DataType::Lookup => "uuid",
    }
}

/// Check a canonical value against the field's declared constraints.
pub fn validate(field: &Field, value: &CanonicalValue) -> Result<()> {
    if value.kind() != expected_kind(field.data_type) {
        return Err(mismatch(field));
    }

    let constraints = &field.constraints;
    match value {
        CanonicalValue::Text(s) => {
            let len = s.chars().count();
            if let Some(min) = constraints.min_length {
                if len < min {
                    return Err(TabulaError::validation(
                        &field.name,
                        format!("must be at least {} characters", min),
                    ));
                }
            }
            if let Some(max) = constraints.max_length {
                if len > max {
                    return Err(TabulaError::validation(
                        &field.name,
                        format!("must be at most {} characters", max),
                    ));
                }
            }
            if let Some(pattern) = &constraints.validation_pattern {
                let re = Regex::new(pattern).map_err(|e| {
                    TabulaError::Schema(format!(
                        "invalid validation pattern on '{}': {}",
                        field.name, e
                    ))
                })?;
                if !re.is_match(s) {
                    return Err(TabulaError::validation(
                        &field.name,
                        format!("does not match pattern {}", pattern),
                    ));
                }
            }
            if field.data_type == DataType::Enum
                && !constraints.enum_values.is_empty()
                && !constraints
                    .enum_values
                    .iter()
                    .any(|v| v.eq_ignore_ascii_case(s))
            {
                return Err(TabulaError::validation(
                    &field.name,
                    format!("must be one of: {}", constraints.enum_values.join(", ")),
                ));
            }
        }
        CanonicalValue::Number(_) | CanonicalValue::Decimal(_) => {
            let actual = value.as_decimal().ok_or_else(|| mismatch(field))?;
            if let Some(min) = constraints.min_value.and_then(Decimal::from_f64) {
                if actual < min {
                    return Err(TabulaError::validation(
                        &field.name,
                        format!("must be at least {}", min.normalize()),
                    ));
                }
            }
            if let Some(max) = constraints.max_value.and_then(Decimal::from_f64) {
                if actual > max {
                    return Err(TabulaError::validation(
                        &field.name,
                        format!("must be at most {}", max.normalize()),
                    ));
                }
            }
        }
        CanonicalValue::Boolean(_) | CanonicalValue::Instant(_) | CanonicalValue::Uuid(_) => {}
    }
    Ok(())
}

// =============================================================================
// Operators and comparison
// =============================================================================

const ORDERED_OPERATORS: &[FilterOperator] = &[
    FilterOperator::Equals,
    FilterOperator::GreaterThan,
    FilterOperator::GreaterThanOrEqual,
    FilterOperator::LessThan,
    FilterOperator::LessThanOrEqual,
];

const TEXT_OPERATORS: &[FilterOperator] = &[FilterOperator::Equals, FilterOperator::Contains];

const EQUALITY_OPERATORS: &[FilterOperator] = &[FilterOperator::Equals];

/// Filter operators supported by a data type.
pub fn allowed_operators(data_type: DataType) -> &'static [FilterOperator] {
    match data_type {
        DataType::Number | DataType::Decimal | DataType::Date | DataType::DateTime => {
            ORDERED_OPERATORS
        }
        DataType::Boolean | DataType::Lookup => EQUALITY_OPERATORS,
        DataType::Text
        | DataType::Note
        | DataType::Tags
        | DataType::Json
        | DataType::File
        | DataType::Enum => TEXT_OPERATORS,
    }
}

pub fn supports(data_type: DataType, operator: FilterOperator) -> bool {
    allowed_operators(data_type).contains(&operator)
}

/// Order two canonical values; `None` when their kinds are not comparable.
///
/// Number and Decimal compare after widening to decimal.
pub fn compare(a: &CanonicalValue, b: &CanonicalValue) -> Option<Ordering> {
    match (a, b) {
        (CanonicalValue::Text(x), CanonicalValue::Text(y)) => Some(x.cmp(y)),
        (CanonicalValue::Number(x), CanonicalValue::Number(y)) => Some(x.cmp(y)),
        (
            CanonicalValue::Number(_) | CanonicalValue::Decimal(_),
            CanonicalValue::Number(_) | CanonicalValue::Decimal(_),
        ) => Some(a.as_decimal()?.cmp(&b.as_decimal()?)),
        (CanonicalValue::Boolean(x), CanonicalValue::Boolean(y)) => Some(x.cmp(y)),
        (CanonicalValue::Instant(x), CanonicalValue::Instant(y)) => Some(x.cmp(y)),
        (CanonicalValue::Uuid(x), CanonicalValue::Uuid(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

// =============================================================================
// Documents
// =============================================================================

/// Encode canonical values as a stored document.
pub fn encode_document(values: &Values) -> serde_json::Map<String, Value> {
    values
        .iter()
        .map(|(name, value)| (name.clone(), value.to_json()))
        .collect()
}

/// Decode a stored document against the table's current fields.
///
/// Keys without a declared field and values that no longer normalize are
/// skipped with a warning.
pub fn decode_document(table: &Table, data: &serde_json::Map<String, Value>) -> Values {
    let mut values = Values::new();
    for (key, raw) in data {
        if raw.is_null() {
            continue;
        }
        let Some(field) = table.field(key) else {
            warn!(table = %table.name, field = %key, "Stored value has no declared field");
            continue;
        };
        match normalize(field, raw) {
            Ok(value) => {
                values.insert(field.name.clone(), value);
            }
            Err(e) => {
                warn!(table = %table.name, field = %key, error = %e, "Stored value failed to decode");
            }
        }
    }
    values
}
