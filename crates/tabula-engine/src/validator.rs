//! Record payload normalization and validation.
//!
//! Turns a raw submitted document into the canonical values of a table's
//! declared fields, enforcing required/default rules, per-field constraints,
//! lookup referential integrity and uniqueness. Runs inside the write
//! transaction so the checks see the same state the write commits against.

use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::warn;

use tabula_core::error::{Result, TabulaError};
use tabula_core::expr::Expr;
use tabula_core::types::{DataType, Field, Record, Table};
use tabula_core::value::{decode_document, normalize, validate, CanonicalValue, Values};
use tabula_storage::index::{find_duplicate, IndexValue};
use tabula_storage::records::live_record_exists;

use crate::catalog::resolve_table;

/// Validate `raw` against `table` and return the canonical values to store.
///
/// `existing` is the stored record on update; its id is excluded from the
/// uniqueness check and its read-only values are carried over. Computed
/// fields never appear in the result.
pub fn validate_record_payload(
    conn: &Connection,
    table: &Table,
    raw: &Map<String, Value>,
    existing: Option<&Record>,
) -> Result<Values> {
    for (key, value) in raw {
        let Some(field) = table.field(key) else {
            return Err(TabulaError::Schema(format!(
                "unknown field '{}' on table '{}'",
                key, table.name
            )));
        };
        if field.is_computed() && !value.is_null() {
            return Err(TabulaError::validation(
                &field.name,
                "computed fields cannot be set",
            ));
        }
    }

    let stored = existing
        .map(|record| decode_document(table, &record.data))
        .unwrap_or_default();

    let mut values = Values::new();
    for field in table.fields.iter().filter(|f| !f.is_computed()) {
        let supplied = raw_value(raw, &field.name).filter(|v| !v.is_null());

        if field.flags.read_only && existing.is_some() {
            let previous = stored.get(&field.name);
            match supplied {
                None => {
                    if let Some(previous) = previous {
                        values.insert(field.name.clone(), previous.clone());
                    }
                    continue;
                }
                Some(raw) => {
                    let value = normalize(field, raw)?;
                    if previous != Some(&value) {
                        return Err(TabulaError::validation(
                            &field.name,
                            "read-only field cannot be changed",
                        ));
                    }
                    values.insert(field.name.clone(), value);
                    continue;
                }
            }
        }

        let raw = match supplied {
            Some(raw) => raw,
            None => match field.constraints.default_value.as_ref().filter(|v| !v.is_null()) {
                Some(default) => default,
                None if field.flags.required => {
                    return Err(TabulaError::validation(&field.name, "a value is required"));
                }
                None => continue,
            },
        };

        let value = normalize(field, raw)?;
        validate(field, &value)?;
        if field.data_type == DataType::Lookup {
            check_lookup(conn, field, &value)?;
        }
        values.insert(field.name.clone(), value);
    }

    check_unique(conn, table, &values, existing)?;
    Ok(values)
}

/// Canonical values plus the evaluated computed fields, for indexing.
///
/// A computed result that does not normalize to its field's type is
/// skipped.
pub fn with_computed(table: &Table, values: &Values) -> Values {
    let mut all = values.clone();
    for field in table.fields.iter().filter(|f| f.is_computed()) {
        let Some(expression) = &field.computed_expression else {
            continue;
        };
        let Some(text) = Expr::parse(expression).evaluate(values) else {
            continue;
        };
        match normalize(field, &Value::String(text)) {
            Ok(value) => {
                all.insert(field.name.clone(), value);
            }
            Err(e) => {
                warn!(table = %table.name, field = %field.name, error = %e, "Computed value dropped");
            }
        }
    }
    all
}

/// Exact key first, then case-insensitive.
fn raw_value<'a>(raw: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    raw.get(name).or_else(|| {
        raw.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    })
}

fn check_lookup(conn: &Connection, field: &Field, value: &CanonicalValue) -> Result<()> {
    let target_key = field.lookup_target.as_deref().unwrap_or_default();
    let Some(target) = resolve_table(conn, target_key)? else {
        return Err(TabulaError::Schema(format!(
            "lookup target table '{}' of field '{}' does not exist",
            target_key, field.name
        )));
    };
    let Some(id) = value.as_uuid() else {
        return Err(TabulaError::TypeMismatch {
            field: field.name.clone(),
            expected: DataType::Lookup,
        });
    };
    if !live_record_exists(conn, target.id, id)? {
        return Err(TabulaError::ReferentialIntegrity {
            field: field.name.clone(),
            target: format!("{} record {}", target.name, id),
        });
    }
    Ok(())
}

fn check_unique(
    conn: &Connection,
    table: &Table,
    values: &Values,
    existing: Option<&Record>,
) -> Result<()> {
    for field in table.fields.iter().filter(|f| f.flags.unique) {
        let Some(value) = values.get(&field.name) else {
            continue;
        };
        let key = IndexValue::from_canonical(value);
        if find_duplicate(conn, table.id, &field.name, &key, existing.map(|r| r.id))?.is_some() {
            return Err(TabulaError::UniquenessViolation {
                field: field.name.clone(),
                value: value.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::create_table;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tabula_core::types::document;
    use tabula_storage::Database;

    fn setup(table: Table) -> (Database, Table) {
        let db = Database::in_memory().unwrap();
        let table = db.with_tx(|tx| create_table(tx, table)).unwrap();
        (db, table)
    }

    fn people() -> Table {
        Table::new("people")
            .with_field(Field::new("Name", DataType::Text).required().with_length(Some(1), Some(20)))
            .with_field(Field::new("Age", DataType::Number).with_range(Some(0.0), Some(150.0)))
            .with_field(Field::new("Born", DataType::Date))
            .with_field(
                Field::new("Status", DataType::Enum)
                    .with_enum_values(["Active", "Retired"])
                    .with_default(json!("Active")),
            )
    }

    #[test]
    fn test_canonical_values_and_defaults() {
        let (db, table) = setup(people());
        let raw = document([
            ("name", json!("Ada")),
            ("AGE", json!("36")),
            ("Born", json!("1815-12-10T15:30:00+02:00")),
        ]);
        let values = db
            .with_conn(|conn| validate_record_payload(conn, &table, &raw, None))
            .unwrap();

        assert_eq!(values["Name"], CanonicalValue::Text("Ada".into()));
        assert_eq!(values["Age"], CanonicalValue::Number(36));
        assert_eq!(
            values["Born"],
            CanonicalValue::Instant(Utc.with_ymd_and_hms(1815, 12, 10, 0, 0, 0).unwrap())
        );
        assert_eq!(values["Status"], CanonicalValue::Text("Active".into()));
    }

    #[test]
    fn test_missing_required_and_null() {
        let (db, table) = setup(people());
        for raw in [document([("Age", json!(3))]), document([("Name", Value::Null)])] {
            let err = db
                .with_conn(|conn| validate_record_payload(conn, &table, &raw, None))
                .unwrap_err();
            assert!(matches!(err, TabulaError::Validation { ref field, .. } if field == "Name"));
        }
    }

    #[test]
    fn test_optional_absent_field_is_omitted() {
        let (db, table) = setup(people());
        let raw = document([("Name", json!("Ada"))]);
        let values = db
            .with_conn(|conn| validate_record_payload(conn, &table, &raw, None))
            .unwrap();
        assert!(!values.contains_key("Age"));
        assert!(!values.contains_key("Born"));
    }

    #[test]
    fn test_unknown_field_is_schema_error() {
        let (db, table) = setup(people());
        let raw = document([("Name", json!("Ada")), ("Height", json!(170))]);
        let err = db
            .with_conn(|conn| validate_record_payload(conn, &table, &raw, None))
            .unwrap_err();
        assert!(matches!(err, TabulaError::Schema(_)));
    }

    #[test]
    fn test_constraint_violations() {
        let (db, table) = setup(people());
        let cases = [
            document([("Name", json!(""))]),
            document([("Name", json!("Ada")), ("Age", json!(200))]),
            document([("Name", json!("Ada")), ("Status", json!("Unknown"))]),
            document([("Name", json!("Ada")), ("Age", json!("old"))]),
        ];
        for raw in cases {
            let err = db
                .with_conn(|conn| validate_record_payload(conn, &table, &raw, None))
                .unwrap_err();
            assert!(err.is_validation(), "{err}");
        }
    }

    #[test]
    fn test_computed_field_input_rejected_and_evaluated() {
        let (db, table) = setup(
            Table::new("names")
                .with_field(Field::new("First", DataType::Text))
                .with_field(Field::new("Last", DataType::Text))
                .with_field(Field::new("Full", DataType::Text).computed("concat(First, \" \", Last)")),
        );

        let raw = document([("First", json!("Ada")), ("Full", json!("x"))]);
        let err = db
            .with_conn(|conn| validate_record_payload(conn, &table, &raw, None))
            .unwrap_err();
        assert!(matches!(err, TabulaError::Validation { ref field, .. } if field == "Full"));

        let raw = document([("First", json!("Ada")), ("Last", json!("Lovelace"))]);
        let values = db
            .with_conn(|conn| validate_record_payload(conn, &table, &raw, None))
            .unwrap();
        assert!(!values.contains_key("Full"));
        let indexed = with_computed(&table, &values);
        assert_eq!(indexed["Full"], CanonicalValue::Text("Ada Lovelace".into()));
    }

    #[test]
    fn test_computed_value_of_wrong_type_is_dropped() {
        let table = Table::new("t")
            .with_field(Field::new("Label", DataType::Text))
            .with_field(Field::new("Size", DataType::Number).computed("{{Label}}"));
        let mut values = Values::new();
        values.insert("Label".into(), CanonicalValue::Text("big".into()));
        assert!(!with_computed(&table, &values).contains_key("Size"));
    }

    #[test]
    fn test_lookup_referential_integrity() {
        let db = Database::in_memory().unwrap();
        let owners = db
            .with_tx(|tx| create_table(tx, Table::new("owners").with_field(Field::new("Name", DataType::Text))))
            .unwrap();
        let pets = db
            .with_tx(|tx| {
                create_table(
                    tx,
                    Table::new("pets").with_field(Field::new("Owner", DataType::Lookup).lookup("owners", None)),
                )
            })
            .unwrap();

        let raw = document([("Owner", json!(uuid::Uuid::new_v4().to_string()))]);
        let err = db
            .with_conn(|conn| validate_record_payload(conn, &pets, &raw, None))
            .unwrap_err();
        assert!(matches!(err, TabulaError::ReferentialIntegrity { .. }));

        let raw = document([("Owner", json!("not-a-uuid"))]);
        let err = db
            .with_conn(|conn| validate_record_payload(conn, &pets, &raw, None))
            .unwrap_err();
        assert!(matches!(err, TabulaError::TypeMismatch { .. }));
        assert!(!owners.id.is_nil());
    }

    #[test]
    fn test_read_only_carry_over() {
        let (db, table) = setup(
            Table::new("accounts")
                .with_field(Field::new("Code", DataType::Text).read_only())
                .with_field(Field::new("Note", DataType::Note)),
        );
        let now = Utc::now();
        let existing = Record {
            id: uuid::Uuid::new_v4(),
            table_id: table.id,
            data: document([("Code", json!("A-1")), ("Note", json!("old"))]),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            version: 1,
        };

        let raw = document([("Note", json!("new"))]);
        let values = db
            .with_conn(|conn| validate_record_payload(conn, &table, &raw, Some(&existing)))
            .unwrap();
        assert_eq!(values["Code"], CanonicalValue::Text("A-1".into()));
        assert_eq!(values["Note"], CanonicalValue::Text("new".into()));

        let raw = document([("Code", json!("A-1"))]);
        assert!(db
            .with_conn(|conn| validate_record_payload(conn, &table, &raw, Some(&existing)))
            .is_ok());

        let raw = document([("Code", json!("B-2"))]);
        let err = db
            .with_conn(|conn| validate_record_payload(conn, &table, &raw, Some(&existing)))
            .unwrap_err();
        assert!(matches!(err, TabulaError::Validation { ref field, .. } if field == "Code"));
    }
}
