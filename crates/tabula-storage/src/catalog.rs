//! Persistence for the schema catalog (tables, fields, views).
//!
//! Functions take a plain `&Connection` so the engine can compose them inside
//! a single transaction. Definitions are stored as JSON; the catalog is read
//! in full on every call, there is no cache.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use tabula_core::error::{Result, TabulaError};
use tabula_core::types::{Field, Table, View};

use crate::records::{from_micros, to_micros};

/// Insert a table with all of its fields and views.
///
/// Ids must already be assigned.
pub fn insert_table(conn: &Connection, table: &Table) -> Result<()> {
    let header = header_json(table)?;
    conn.execute(
        "INSERT INTO catalog_tables (id, name, definition, created_at) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            table.id.to_string(),
            table.name,
            header,
            to_micros(table.created_at),
        ],
    )
    .map_err(|e| TabulaError::Storage(format!("Failed to insert table: {}", e)))?;

    for (position, field) in table.fields.iter().enumerate() {
        insert_field(conn, table.id, position, field)?;
    }
    for (position, view) in table.views.iter().enumerate() {
        insert_view(conn, table.id, position, view)?;
    }
    Ok(())
}

/// Append a field definition at `position`.
pub fn insert_field(conn: &Connection, table_id: Uuid, position: usize, field: &Field) -> Result<()> {
    let definition = serde_json::to_string(field)?;
    conn.execute(
        "INSERT INTO catalog_fields (id, table_id, position, name, data_type, definition)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            field.id.to_string(),
            table_id.to_string(),
            position as i64,
            field.name,
            field.data_type.as_str(),
            definition,
        ],
    )
    .map_err(|e| TabulaError::Storage(format!("Failed to insert field '{}': {}", field.name, e)))?;
    Ok(())
}

/// Append a view definition at `position`.
pub fn insert_view(conn: &Connection, table_id: Uuid, position: usize, view: &View) -> Result<()> {
    let definition = serde_json::to_string(view)?;
    conn.execute(
        "INSERT INTO catalog_views (id, table_id, position, name, is_default, definition)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            view.id.to_string(),
            table_id.to_string(),
            position as i64,
            view.name,
            view.is_default as i32,
            definition,
        ],
    )
    .map_err(|e| TabulaError::Storage(format!("Failed to insert view '{}': {}", view.name, e)))?;
    Ok(())
}

/// Rewrite the table-level definition (flags, default view, label template).
pub fn update_table_header(conn: &Connection, table: &Table) -> Result<()> {
    let header = header_json(table)?;
    conn.execute(
        "UPDATE catalog_tables SET definition = ?1 WHERE id = ?2",
        rusqlite::params![header, table.id.to_string()],
    )
    .map_err(|e| TabulaError::Storage(format!("Failed to update table: {}", e)))?;
    Ok(())
}

/// Load one table with its ordered fields and views.
pub fn load_table(conn: &Connection, id: Uuid) -> Result<Option<Table>> {
    let row = conn
        .query_row(
            "SELECT definition, created_at FROM catalog_tables WHERE id = ?1",
            rusqlite::params![id.to_string()],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()
        .map_err(|e| TabulaError::Storage(e.to_string()))?;

    match row {
        Some((definition, created_at)) => {
            Ok(Some(assemble(conn, id, &definition, from_micros(created_at))?))
        }
        None => Ok(None),
    }
}

/// Resolve a table id from its name (case-insensitive).
pub fn find_table_id(conn: &Connection, name: &str) -> Result<Option<Uuid>> {
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM catalog_tables WHERE name = ?1",
            rusqlite::params![name],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| TabulaError::Storage(e.to_string()))?;

    id.map(|s| parse_id(&s)).transpose()
}

/// Load every table, ordered by creation time.
pub fn load_tables(conn: &Connection) -> Result<Vec<Table>> {
    let mut stmt = conn
        .prepare("SELECT id, definition, created_at FROM catalog_tables ORDER BY created_at ASC, name ASC")
        .map_err(|e| TabulaError::Storage(e.to_string()))?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })
        .map_err(|e| TabulaError::Storage(e.to_string()))?;

    let mut headers = Vec::new();
    for row in rows {
        headers.push(row.map_err(|e| TabulaError::Storage(e.to_string()))?);
    }

    headers
        .into_iter()
        .map(|(id, definition, created_at)| {
            assemble(conn, parse_id(&id)?, &definition, from_micros(created_at))
        })
        .collect()
}

fn header_json(table: &Table) -> Result<String> {
    let mut header = table.clone();
    header.fields.clear();
    header.views.clear();
    Ok(serde_json::to_string(&header)?)
}

fn assemble(
    conn: &Connection,
    id: Uuid,
    definition: &str,
    created_at: DateTime<Utc>,
) -> Result<Table> {
    let mut table: Table = serde_json::from_str(definition)?;
    table.id = id;
    table.created_at = created_at;
    table.fields = load_definitions(
        conn,
        "SELECT definition FROM catalog_fields WHERE table_id = ?1 ORDER BY position ASC",
        id,
    )?;
    table.views = load_definitions(
        conn,
        "SELECT definition FROM catalog_views WHERE table_id = ?1 ORDER BY position ASC",
        id,
    )?;
    Ok(table)
}

fn load_definitions<T: serde::de::DeserializeOwned>(
    conn: &Connection,
    sql: &str,
    table_id: Uuid,
) -> Result<Vec<T>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| TabulaError::Storage(e.to_string()))?;
    let rows = stmt
        .query_map(rusqlite::params![table_id.to_string()], |row| {
            row.get::<_, String>(0)
        })
        .map_err(|e| TabulaError::Storage(e.to_string()))?;

    let mut items = Vec::new();
    for row in rows {
        let definition = row.map_err(|e| TabulaError::Storage(e.to_string()))?;
        items.push(serde_json::from_str(&definition)?);
    }
    Ok(items)
}

pub(crate) fn parse_id(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| TabulaError::Storage(format!("Invalid UUID '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use tabula_core::types::DataType;

    fn sample_table() -> Table {
        let mut table = Table::new("contacts")
            .with_field(Field::new("Name", DataType::Text).required().unique())
            .with_field(Field::new("Age", DataType::Number))
            .with_view(View::all())
            .soft_delete();
        table.id = Uuid::new_v4();
        table.default_view = View::ALL.to_string();
        for field in &mut table.fields {
            field.id = Uuid::new_v4();
            field.table_id = table.id;
        }
        for view in &mut table.views {
            view.id = Uuid::new_v4();
            view.table_id = table.id;
        }
        table
    }

    #[test]
    fn test_insert_and_load_table() {
        let db = Database::in_memory().unwrap();
        let table = sample_table();
        db.with_tx(|tx| insert_table(tx, &table)).unwrap();

        let loaded = db.with_conn(|conn| load_table(conn, table.id)).unwrap().unwrap();
        assert_eq!(loaded.name, "contacts");
        assert!(loaded.flags.supports_soft_delete);
        assert_eq!(loaded.default_view, "all");
        assert_eq!(loaded.fields.len(), 2);
        assert_eq!(loaded.fields[0].name, "Name");
        assert_eq!(loaded.fields[1].name, "Age");
        assert!(loaded.fields[0].flags.unique);
        assert_eq!(loaded.views.len(), 1);
        assert!(loaded.views[0].is_default);
    }

    #[test]
    fn test_load_missing_table() {
        let db = Database::in_memory().unwrap();
        let loaded = db.with_conn(|conn| load_table(conn, Uuid::new_v4())).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_find_table_id_case_insensitive() {
        let db = Database::in_memory().unwrap();
        let table = sample_table();
        db.with_tx(|tx| insert_table(tx, &table)).unwrap();

        let id = db.with_conn(|conn| find_table_id(conn, "CONTACTS")).unwrap();
        assert_eq!(id, Some(table.id));
        let missing = db.with_conn(|conn| find_table_id(conn, "tasks")).unwrap();
        assert_eq!(missing, None);
    }

    #[test]
    fn test_duplicate_field_name_rejected_by_store() {
        let db = Database::in_memory().unwrap();
        let table = sample_table();
        db.with_tx(|tx| insert_table(tx, &table)).unwrap();

        let mut dup = Field::new("name", DataType::Text);
        dup.id = Uuid::new_v4();
        let result = db.with_tx(|tx| insert_field(tx, table.id, 2, &dup));
        assert!(matches!(result, Err(TabulaError::Storage(_))));
    }

    #[test]
    fn test_load_tables_and_header_update() {
        let db = Database::in_memory().unwrap();
        let mut table = sample_table();
        db.with_tx(|tx| insert_table(tx, &table)).unwrap();

        table.row_label_template = Some("{{Name}}".to_string());
        db.with_tx(|tx| update_table_header(tx, &table)).unwrap();

        let tables = db.with_conn(load_tables).unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].row_label_template.as_deref(), Some("{{Name}}"));
        assert_eq!(tables[0].fields.len(), 2);
    }
}
