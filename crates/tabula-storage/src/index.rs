//! Flat secondary index over record values.
//!
//! One row per (table, record, field) holding exactly one typed value. The
//! index for a record is always rewritten whole: every write deletes the
//! record's rows and re-inserts the current values, so a removed or changed
//! value can never leave a stale row behind.
//!
//! Text rows also carry `folded_value`, the lower-cased text that substring
//! matching runs against. Decimal rows carry `exact_value`, the normalized
//! decimal text that equality and uniqueness compare, since `number_value`
//! only holds the f64 approximation used for ranges and ordering.

use rusqlite::types::{ToSql, ToSqlOutput, Value};
use rusqlite::{Connection, OptionalExtension};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tracing::debug;
use uuid::Uuid;

use tabula_core::error::{Result, TabulaError};
use tabula_core::types::DataType;
use tabula_core::value::{CanonicalValue, Values};

use crate::catalog::parse_id;

/// Typed column of the index table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexColumn {
    String,
    Number,
    Date,
    Bool,
}

impl IndexColumn {
    pub fn name(&self) -> &'static str {
        match self {
            IndexColumn::String => "string_value",
            IndexColumn::Number => "number_value",
            IndexColumn::Date => "date_value",
            IndexColumn::Bool => "bool_value",
        }
    }

    /// Column holding values of a field type.
    pub fn for_type(data_type: DataType) -> Self {
        match data_type {
            DataType::Text
            | DataType::Note
            | DataType::Tags
            | DataType::Json
            | DataType::File
            | DataType::Enum
            | DataType::Lookup => IndexColumn::String,
            DataType::Number | DataType::Decimal => IndexColumn::Number,
            DataType::Date | DataType::DateTime => IndexColumn::Date,
            DataType::Boolean => IndexColumn::Bool,
        }
    }
}

/// A value as projected into the index.
#[derive(Clone, Debug, PartialEq)]
pub enum IndexValue {
    Text(String),
    Integer(i64),
    Decimal(Decimal),
    /// Microseconds since the epoch.
    Date(i64),
    Bool(bool),
}

impl IndexValue {
    pub fn from_canonical(value: &CanonicalValue) -> Self {
        match value {
            CanonicalValue::Text(s) => IndexValue::Text(s.clone()),
            CanonicalValue::Number(n) => IndexValue::Integer(*n),
            CanonicalValue::Decimal(d) => IndexValue::Decimal(*d),
            CanonicalValue::Boolean(b) => IndexValue::Bool(*b),
            CanonicalValue::Instant(t) => IndexValue::Date(t.timestamp_micros()),
            CanonicalValue::Uuid(id) => IndexValue::Text(id.to_string()),
        }
    }

    pub fn column(&self) -> IndexColumn {
        match self {
            IndexValue::Text(_) => IndexColumn::String,
            IndexValue::Integer(_) | IndexValue::Decimal(_) => IndexColumn::Number,
            IndexValue::Date(_) => IndexColumn::Date,
            IndexValue::Bool(_) => IndexColumn::Bool,
        }
    }

    /// Value as bound into its typed column.
    pub fn sql_value(&self) -> Value {
        match self {
            IndexValue::Text(s) => Value::Text(s.clone()),
            IndexValue::Integer(n) => Value::Integer(*n),
            IndexValue::Decimal(d) => Value::Real(d.to_f64().unwrap_or_default()),
            IndexValue::Date(micros) => Value::Integer(*micros),
            IndexValue::Bool(b) => Value::Integer(*b as i64),
        }
    }

    /// Lower-cased text for case-insensitive matching.
    pub fn folded(&self) -> Option<String> {
        match self {
            IndexValue::Text(s) => Some(fold(s)),
            _ => None,
        }
    }

    /// Normalized decimal text: `10.50` and `10.5` give the same key.
    pub fn exact(&self) -> Option<String> {
        match self {
            IndexValue::Decimal(d) => Some(d.normalize().to_string()),
            _ => None,
        }
    }

    /// Column and bound value that decide equality for this value.
    pub fn equality(&self) -> (&'static str, Value) {
        match self.exact() {
            Some(exact) => ("exact_value", Value::Text(exact)),
            None => (self.column().name(), self.sql_value()),
        }
    }
}

/// Unicode lower-casing shared by index rows and substring patterns.
pub fn fold(s: &str) -> String {
    s.to_lowercase()
}

impl ToSql for IndexValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Owned(self.sql_value()))
    }
}

/// One index row of a record.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexEntry {
    pub field_name: String,
    pub value: IndexValue,
}

/// Replace every index row of a record with one row per present value.
///
/// Returns the number of rows written.
pub fn upsert_index(
    conn: &Connection,
    table_id: Uuid,
    record_id: Uuid,
    values: &Values,
) -> Result<usize> {
    delete_index(conn, table_id, record_id)?;

    for (field_name, value) in values {
        let value = IndexValue::from_canonical(value);
        let sql = format!(
            "INSERT INTO record_index
                 (table_id, record_id, field_name, {}, folded_value, exact_value)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            value.column().name()
        );
        let mut stmt = conn
            .prepare_cached(&sql)
            .map_err(|e| TabulaError::Storage(e.to_string()))?;
        stmt.execute(rusqlite::params![
            table_id.to_string(),
            record_id.to_string(),
            field_name,
            value,
            value.folded(),
            value.exact(),
        ])
        .map_err(|e| {
            TabulaError::Storage(format!("Failed to index field '{}': {}", field_name, e))
        })?;
    }

    debug!(%table_id, %record_id, rows = values.len(), "Record index rewritten");
    Ok(values.len())
}

/// Remove every index row of a record.
pub fn delete_index(conn: &Connection, table_id: Uuid, record_id: Uuid) -> Result<()> {
    conn.execute(
        "DELETE FROM record_index WHERE table_id = ?1 AND record_id = ?2",
        rusqlite::params![table_id.to_string(), record_id.to_string()],
    )
    .map_err(|e| TabulaError::Storage(format!("Failed to clear record index: {}", e)))?;
    Ok(())
}

/// Find a live record other than `excluding` holding an equal value.
pub fn find_duplicate(
    conn: &Connection,
    table_id: Uuid,
    field_name: &str,
    value: &IndexValue,
    excluding: Option<Uuid>,
) -> Result<Option<Uuid>> {
    let (column, key) = value.equality();
    let sql = format!(
        "SELECT i.record_id
         FROM record_index i
         JOIN records r ON r.id = i.record_id
         WHERE i.table_id = ?1 AND i.field_name = ?2 AND i.{} = ?3
           AND r.deleted_at IS NULL
           AND (?4 IS NULL OR i.record_id != ?4)
         LIMIT 1",
        column
    );
    let found: Option<String> = conn
        .query_row(
            &sql,
            rusqlite::params![
                table_id.to_string(),
                field_name,
                key,
                excluding.map(|id| id.to_string()),
            ],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| TabulaError::Storage(e.to_string()))?;

    found.map(|s| parse_id(&s)).transpose()
}

/// Read back the index rows of a record, ordered by field name.
///
/// # Panics
///
/// Panics on a row with no typed value, which the table's CHECK constraint
/// rules out.
pub fn entries(conn: &Connection, table_id: Uuid, record_id: Uuid) -> Result<Vec<IndexEntry>> {
    let mut stmt = conn
        .prepare(
            "SELECT field_name, string_value, number_value, date_value, bool_value, exact_value
             FROM record_index
             WHERE table_id = ?1 AND record_id = ?2
             ORDER BY field_name ASC",
        )
        .map_err(|e| TabulaError::Storage(e.to_string()))?;

    let rows = stmt
        .query_map(
            rusqlite::params![table_id.to_string(), record_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Value>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, Option<bool>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            },
        )
        .map_err(|e| TabulaError::Storage(e.to_string()))?;

    let mut entries = Vec::new();
    for row in rows {
        let (field_name, string, number, date, boolean, exact) =
            row.map_err(|e| TabulaError::Storage(e.to_string()))?;
        let exact = exact.and_then(|e| e.parse::<Decimal>().ok());
        // NUMERIC affinity stores integral decimals as integers.
        let value = match (string, number, exact, date, boolean) {
            (Some(s), _, _, _, _) => IndexValue::Text(s),
            (_, Value::Integer(_) | Value::Real(_), Some(d), _, _) => IndexValue::Decimal(d),
            (_, Value::Integer(n), _, _, _) => IndexValue::Integer(n),
            (_, Value::Real(f), _, _, _) => match Decimal::from_f64(f) {
                Some(d) => IndexValue::Decimal(d),
                None => {
                    return Err(TabulaError::Storage(format!(
                        "index row for record {} field '{}' holds a non-finite number",
                        record_id, field_name
                    )))
                }
            },
            (_, _, _, Some(d), _) => IndexValue::Date(d),
            (_, _, _, _, Some(b)) => IndexValue::Bool(b),
            _ => panic!(
                "index row for record {} field '{}' holds no value",
                record_id, field_name
            ),
        };
        entries.push(IndexEntry { field_name, value });
    }
    Ok(entries)
}
