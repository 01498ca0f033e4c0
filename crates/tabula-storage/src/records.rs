//! Record document store and audit trail.
//!
//! Each row is stored as an opaque JSON document keyed by record id, with
//! its owning table, version counter and lifecycle timestamps alongside.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use tabula_core::error::{Result, TabulaError};
use tabula_core::types::{AuditAction, AuditEntry, Record};

use crate::catalog::parse_id;

/// Columns selected by [`row_to_record`], prefixed with the `r` alias.
pub const RECORD_COLUMNS: &str =
    "r.id, r.table_id, r.data, r.version, r.created_at, r.updated_at, r.deleted_at";

/// Microseconds since the Unix epoch.
pub fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

pub fn from_micros(micros: i64) -> DateTime<Utc> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(secs, nanos).single().unwrap_or_default()
}

/// Insert a new record document.
pub fn insert_record(conn: &Connection, record: &Record) -> Result<()> {
    let data = serde_json::to_string(&record.data)?;
    conn.execute(
        "INSERT INTO records (id, table_id, data, version, created_at, updated_at, deleted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            record.id.to_string(),
            record.table_id.to_string(),
            data,
            record.version,
            to_micros(record.created_at),
            to_micros(record.updated_at),
            record.deleted_at.map(to_micros),
        ],
    )
    .map_err(|e| TabulaError::Storage(format!("Failed to insert record: {}", e)))?;
    Ok(())
}

/// Overwrite the document, version and update time of an existing record.
pub fn update_record(conn: &Connection, record: &Record) -> Result<()> {
    let data = serde_json::to_string(&record.data)?;
    let changed = conn
        .execute(
            "UPDATE records SET data = ?1, version = ?2, updated_at = ?3
             WHERE id = ?4 AND table_id = ?5",
            rusqlite::params![
                data,
                record.version,
                to_micros(record.updated_at),
                record.id.to_string(),
                record.table_id.to_string(),
            ],
        )
        .map_err(|e| TabulaError::Storage(format!("Failed to update record: {}", e)))?;

    if changed == 0 {
        return Err(TabulaError::NotFound(format!("record {}", record.id)));
    }
    Ok(())
}

/// Load a record, tombstoned or not.
pub fn load_record(conn: &Connection, table_id: Uuid, id: Uuid) -> Result<Option<Record>> {
    let sql = format!(
        "SELECT {} FROM records r WHERE r.id = ?1 AND r.table_id = ?2",
        RECORD_COLUMNS
    );
    let result = conn
        .query_row(
            &sql,
            rusqlite::params![id.to_string(), table_id.to_string()],
            |row| Ok(row_to_record(row)),
        )
        .optional()
        .map_err(|e| TabulaError::Storage(e.to_string()))?;

    result.transpose()
}

/// Load a record unless it is tombstoned.
pub fn load_live_record(conn: &Connection, table_id: Uuid, id: Uuid) -> Result<Option<Record>> {
    Ok(load_record(conn, table_id, id)?.filter(|r| !r.is_deleted()))
}

/// Whether a non-tombstoned record exists in the table.
pub fn live_record_exists(conn: &Connection, table_id: Uuid, id: Uuid) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM records WHERE id = ?1 AND table_id = ?2 AND deleted_at IS NULL",
            rusqlite::params![id.to_string(), table_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| TabulaError::Storage(e.to_string()))?;
    Ok(found.is_some())
}

/// Tombstone a record. Its document and index rows stay in storage.
pub fn soft_delete_record(conn: &Connection, id: Uuid, at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE records SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2",
        rusqlite::params![to_micros(at), id.to_string()],
    )
    .map_err(|e| TabulaError::Storage(format!("Failed to soft-delete record: {}", e)))?;
    Ok(())
}

/// Remove a record; its index rows cascade.
pub fn hard_delete_record(conn: &Connection, id: Uuid) -> Result<()> {
    conn.execute(
        "DELETE FROM records WHERE id = ?1",
        rusqlite::params![id.to_string()],
    )
    .map_err(|e| TabulaError::Storage(format!("Failed to delete record: {}", e)))?;
    Ok(())
}

/// Append an audit entry snapshotting the record's document.
pub fn append_audit(
    conn: &Connection,
    record: &Record,
    action: AuditAction,
    at: DateTime<Utc>,
) -> Result<()> {
    let data = serde_json::to_string(&record.data)?;
    conn.execute(
        "INSERT INTO record_audit (record_id, table_id, action, version, at, data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            record.id.to_string(),
            record.table_id.to_string(),
            action.as_str(),
            record.version,
            to_micros(at),
            data,
        ],
    )
    .map_err(|e| TabulaError::Storage(format!("Failed to append audit entry: {}", e)))?;
    Ok(())
}

/// Audit entries of a record, oldest first.
pub fn load_audit(conn: &Connection, table_id: Uuid, record_id: Uuid) -> Result<Vec<AuditEntry>> {
    let mut stmt = conn
        .prepare(
            "SELECT record_id, table_id, action, version, at, data
             FROM record_audit
             WHERE record_id = ?1 AND table_id = ?2
             ORDER BY id ASC",
        )
        .map_err(|e| TabulaError::Storage(e.to_string()))?;

    let rows = stmt
        .query_map(
            rusqlite::params![record_id.to_string(), table_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .map_err(|e| TabulaError::Storage(e.to_string()))?;

    let mut entries = Vec::new();
    for row in rows {
        let (record_id, table_id, action, version, at, data) =
            row.map_err(|e| TabulaError::Storage(e.to_string()))?;
        let action = AuditAction::parse(&action)
            .ok_or_else(|| TabulaError::Storage(format!("Unknown audit action: {}", action)))?;
        entries.push(AuditEntry {
            record_id: parse_id(&record_id)?,
            table_id: parse_id(&table_id)?,
            action,
            version,
            at: from_micros(at),
            data: serde_json::from_str(&data)?,
        });
    }
    Ok(entries)
}

/// Map a row selected with [`RECORD_COLUMNS`] to a [`Record`].
pub fn row_to_record(row: &Row<'_>) -> Result<Record> {
    let id: String = row.get(0).map_err(|e| TabulaError::Storage(e.to_string()))?;
    let table_id: String = row.get(1).map_err(|e| TabulaError::Storage(e.to_string()))?;
    let data: String = row.get(2).map_err(|e| TabulaError::Storage(e.to_string()))?;
    let version: i64 = row.get(3).map_err(|e| TabulaError::Storage(e.to_string()))?;
    let created_at: i64 = row.get(4).map_err(|e| TabulaError::Storage(e.to_string()))?;
    let updated_at: i64 = row.get(5).map_err(|e| TabulaError::Storage(e.to_string()))?;
    let deleted_at: Option<i64> = row.get(6).map_err(|e| TabulaError::Storage(e.to_string()))?;

    Ok(Record {
        id: parse_id(&id)?,
        table_id: parse_id(&table_id)?,
        data: serde_json::from_str(&data)?,
        created_at: from_micros(created_at),
        updated_at: from_micros(updated_at),
        deleted_at: deleted_at.map(from_micros),
        version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::insert_table;
    use crate::db::Database;
    use serde_json::json;
    use tabula_core::types::{document, Table};

    fn setup() -> (Database, Uuid) {
        let db = Database::in_memory().unwrap();
        let mut table = Table::new("notes");
        table.id = Uuid::new_v4();
        db.with_tx(|tx| insert_table(tx, &table)).unwrap();
        (db, table.id)
    }

    fn make_record(table_id: Uuid) -> Record {
        let now = Utc::now();
        Record {
            id: Uuid::new_v4(),
            table_id,
            data: document([("Title", json!("hello"))]),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            version: 1,
        }
    }

    #[test]
    fn test_micros_roundtrip() {
        let at = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap()
            + chrono::Duration::microseconds(123_456);
        assert_eq!(from_micros(to_micros(at)), at);
        let before_epoch = Utc.with_ymd_and_hms(1960, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(from_micros(to_micros(before_epoch)), before_epoch);
    }

    #[test]
    fn test_insert_and_load() {
        let (db, table_id) = setup();
        let record = make_record(table_id);
        db.with_tx(|tx| insert_record(tx, &record)).unwrap();

        let loaded = db
            .with_conn(|conn| load_record(conn, table_id, record.id))
            .unwrap()
            .unwrap();
        assert_eq!(loaded.data["Title"], json!("hello"));
        assert_eq!(loaded.version, 1);
        assert!(!loaded.is_deleted());
    }

    #[test]
    fn test_load_wrong_table_is_none() {
        let (db, table_id) = setup();
        let record = make_record(table_id);
        db.with_tx(|tx| insert_record(tx, &record)).unwrap();
        let loaded = db
            .with_conn(|conn| load_record(conn, Uuid::new_v4(), record.id))
            .unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_update_record() {
        let (db, table_id) = setup();
        let mut record = make_record(table_id);
        db.with_tx(|tx| insert_record(tx, &record)).unwrap();

        record.data = document([("Title", json!("changed"))]);
        record.version = 2;
        db.with_tx(|tx| update_record(tx, &record)).unwrap();

        let loaded = db
            .with_conn(|conn| load_record(conn, table_id, record.id))
            .unwrap()
            .unwrap();
        assert_eq!(loaded.data["Title"], json!("changed"));
        assert_eq!(loaded.version, 2);
    }

    #[test]
    fn test_update_missing_record_is_not_found() {
        let (db, table_id) = setup();
        let record = make_record(table_id);
        let result = db.with_tx(|tx| update_record(tx, &record));
        assert!(matches!(result, Err(TabulaError::NotFound(_))));
    }

    #[test]
    fn test_soft_delete_keeps_row() {
        let (db, table_id) = setup();
        let record = make_record(table_id);
        db.with_tx(|tx| insert_record(tx, &record)).unwrap();
        db.with_tx(|tx| soft_delete_record(tx, record.id, Utc::now()))
            .unwrap();

        db.with_conn(|conn| {
            assert!(load_record(conn, table_id, record.id)?.unwrap().is_deleted());
            assert!(load_live_record(conn, table_id, record.id)?.is_none());
            assert!(!live_record_exists(conn, table_id, record.id)?);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_hard_delete_removes_row() {
        let (db, table_id) = setup();
        let record = make_record(table_id);
        db.with_tx(|tx| insert_record(tx, &record)).unwrap();
        assert!(db
            .with_conn(|conn| live_record_exists(conn, table_id, record.id))
            .unwrap());

        db.with_tx(|tx| hard_delete_record(tx, record.id)).unwrap();
        assert!(db
            .with_conn(|conn| load_record(conn, table_id, record.id))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_audit_trail() {
        let (db, table_id) = setup();
        let mut record = make_record(table_id);
        db.with_tx(|tx| {
            insert_record(tx, &record)?;
            append_audit(tx, &record, AuditAction::Insert, Utc::now())
        })
        .unwrap();
        record.version = 2;
        db.with_tx(|tx| append_audit(tx, &record, AuditAction::Update, Utc::now()))
            .unwrap();

        let entries = db
            .with_conn(|conn| load_audit(conn, table_id, record.id))
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, AuditAction::Insert);
        assert_eq!(entries[1].action, AuditAction::Update);
        assert_eq!(entries[1].version, 2);
        assert_eq!(entries[0].data["Title"], json!("hello"));
    }
}
