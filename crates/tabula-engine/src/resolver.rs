//! Lookup resolution: turns foreign row ids into display labels on read.

use std::collections::BTreeMap;

use rusqlite::Connection;
use tracing::debug;

use tabula_core::error::Result;
use tabula_core::expr::Expr;
use tabula_core::types::{value_ci, DataType, LookupResolution, Record, ResolvedRecord, Table};
use tabula_core::value::{decode_document, Values};
use tabula_storage::records::load_live_record;

use crate::catalog::resolve_table;
use crate::validator::with_computed;

/// Decode a record and resolve each of its present lookup fields.
///
/// Targets that no longer exist (missing table, missing or tombstoned row)
/// are left out of `lookups`.
pub fn resolve_record(conn: &Connection, table: &Table, record: Record) -> Result<ResolvedRecord> {
    let values = with_computed(table, &decode_document(table, &record.data));
    let mut lookups = BTreeMap::new();

    for field in table.fields.iter().filter(|f| f.data_type == DataType::Lookup) {
        let Some(target_id) = values.get(&field.name).and_then(|v| v.as_uuid()) else {
            continue;
        };
        let target_key = field.lookup_target.as_deref().unwrap_or_default();
        let Some(target_table) = resolve_table(conn, target_key)? else {
            debug!(field = %field.name, target = %target_key, "Lookup target table missing");
            continue;
        };
        let Some(target) = load_live_record(conn, target_table.id, target_id)? else {
            debug!(field = %field.name, %target_id, "Lookup target row missing");
            continue;
        };

        let target_values = with_computed(&target_table, &decode_document(&target_table, &target.data));
        lookups.insert(
            field.name.clone(),
            LookupResolution {
                target_id,
                label: label_for(&target_table, field.lookup_field.as_deref(), &target_values),
                target_table_id: target_table.id,
                target_table_name: target_table.name.clone(),
            },
        );
    }

    Ok(ResolvedRecord {
        record,
        values,
        lookups,
    })
}

/// Label of a target row: the declared lookup field, else the table's
/// row-label template, else the first Text/Note value.
pub fn label_for(table: &Table, lookup_field: Option<&str>, values: &Values) -> Option<String> {
    if let Some(value) = lookup_field.and_then(|name| value_ci(values, name)) {
        return Some(value.to_string());
    }
    if let Some(label) = table
        .row_label_template
        .as_deref()
        .and_then(|template| Expr::parse(template).evaluate(values))
    {
        return Some(label);
    }
    table
        .fields
        .iter()
        .filter(|f| matches!(f.data_type, DataType::Text | DataType::Note))
        .find_map(|f| values.get(&f.name))
        .map(|v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabula_core::types::Field;
    use tabula_core::value::CanonicalValue;

    fn person() -> Table {
        Table::new("people")
            .with_field(Field::new("Age", DataType::Number))
            .with_field(Field::new("First", DataType::Text))
            .with_field(Field::new("Last", DataType::Text))
    }

    fn values(pairs: &[(&str, CanonicalValue)]) -> Values {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_label_priority() {
        let table = person().with_row_label("{{First}} {{Last}}");
        let v = values(&[
            ("First", CanonicalValue::Text("Ada".into())),
            ("Last", CanonicalValue::Text("Lovelace".into())),
            ("Age", CanonicalValue::Number(36)),
        ]);

        assert_eq!(label_for(&table, Some("age"), &v).as_deref(), Some("36"));
        assert_eq!(label_for(&table, None, &v).as_deref(), Some("Ada Lovelace"));
        assert_eq!(label_for(&person(), None, &v).as_deref(), Some("Ada"));
    }

    #[test]
    fn test_label_falls_through_blank_sources() {
        let table = person().with_row_label("{{Nickname}}");
        let v = values(&[("Last", CanonicalValue::Text("Hopper".into()))]);
        assert_eq!(label_for(&table, Some("First"), &v).as_deref(), Some("Hopper"));

        let none = values(&[("Age", CanonicalValue::Number(1))]);
        assert_eq!(label_for(&table, None, &none), None);
    }
}
