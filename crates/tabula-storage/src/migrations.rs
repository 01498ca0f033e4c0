//! Database schema migrations.
//!
//! v1 creates the schema catalog, the record document store, the flat
//! secondary index and the audit trail. v2 adds the FTS5 table used by the
//! full-text collaborator. v3 adds the exact decimal and case-folded text
//! keys to the secondary index.

use rusqlite::Connection;
use tracing::info;

use tabula_core::error::{Result, TabulaError};

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| TabulaError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| TabulaError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: catalog_and_records");
    }
    if current_version < 2 {
        apply_v2(conn)?;
        info!("Applied migration v2: record_fts");
    }
    if current_version < 3 {
        apply_v3(conn)?;
        info!("Applied migration v3: record_index_keys");
    }

    Ok(())
}

/// Version 1: catalog, records, secondary index, audit trail.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Schema catalog. Definitions are serialized JSON; key columns are
        -- duplicated for lookups and uniqueness.
        CREATE TABLE IF NOT EXISTS catalog_tables (
            id              TEXT PRIMARY KEY NOT NULL,
            name            TEXT NOT NULL UNIQUE COLLATE NOCASE,
            definition      TEXT NOT NULL,
            created_at      INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS catalog_fields (
            id              TEXT PRIMARY KEY NOT NULL,
            table_id        TEXT NOT NULL,
            position        INTEGER NOT NULL,
            name            TEXT NOT NULL COLLATE NOCASE,
            data_type       TEXT NOT NULL,
            definition      TEXT NOT NULL,
            UNIQUE (table_id, name),
            FOREIGN KEY (table_id) REFERENCES catalog_tables(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS catalog_views (
            id              TEXT PRIMARY KEY NOT NULL,
            table_id        TEXT NOT NULL,
            position        INTEGER NOT NULL,
            name            TEXT NOT NULL COLLATE NOCASE,
            is_default      INTEGER NOT NULL DEFAULT 0,
            definition      TEXT NOT NULL,
            UNIQUE (table_id, name),
            FOREIGN KEY (table_id) REFERENCES catalog_tables(id) ON DELETE CASCADE
        );

        -- Record documents. Timestamps are microseconds since the epoch.
        CREATE TABLE IF NOT EXISTS records (
            id              TEXT PRIMARY KEY NOT NULL,
            table_id        TEXT NOT NULL,
            data            TEXT NOT NULL DEFAULT '{}',
            version         INTEGER NOT NULL DEFAULT 1,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL,
            deleted_at      INTEGER,
            FOREIGN KEY (table_id) REFERENCES catalog_tables(id)
        );

        CREATE INDEX IF NOT EXISTS idx_records_table_created
            ON records (table_id, created_at DESC);

        CREATE INDEX IF NOT EXISTS idx_records_live
            ON records (table_id)
            WHERE deleted_at IS NULL;

        -- Flat secondary index: exactly one typed value per row.
        CREATE TABLE IF NOT EXISTS record_index (
            table_id        TEXT NOT NULL,
            record_id       TEXT NOT NULL,
            field_name      TEXT NOT NULL,
            string_value    TEXT,
            number_value    NUMERIC,
            date_value      INTEGER,
            bool_value      INTEGER,
            PRIMARY KEY (table_id, record_id, field_name),
            CHECK ((string_value IS NOT NULL) + (number_value IS NOT NULL)
                 + (date_value IS NOT NULL) + (bool_value IS NOT NULL) = 1),
            FOREIGN KEY (record_id) REFERENCES records(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_record_index_string
            ON record_index (table_id, field_name, string_value)
            WHERE string_value IS NOT NULL;

        CREATE INDEX IF NOT EXISTS idx_record_index_number
            ON record_index (table_id, field_name, number_value)
            WHERE number_value IS NOT NULL;

        CREATE INDEX IF NOT EXISTS idx_record_index_date
            ON record_index (table_id, field_name, date_value)
            WHERE date_value IS NOT NULL;

        CREATE INDEX IF NOT EXISTS idx_record_index_bool
            ON record_index (table_id, field_name, bool_value)
            WHERE bool_value IS NOT NULL;

        CREATE INDEX IF NOT EXISTS idx_record_index_record
            ON record_index (record_id);

        -- Audit trail survives hard deletes, so no FK to records.
        CREATE TABLE IF NOT EXISTS record_audit (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            record_id       TEXT NOT NULL,
            table_id        TEXT NOT NULL,
            action          TEXT NOT NULL
                            CHECK (action IN ('insert', 'update', 'delete')),
            version         INTEGER NOT NULL,
            at              INTEGER NOT NULL,
            data            TEXT NOT NULL DEFAULT '{}'
        );

        CREATE INDEX IF NOT EXISTS idx_record_audit_record
            ON record_audit (record_id, id ASC);

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'catalog_and_records');
        ",
    )
    .map_err(|e| TabulaError::Storage(format!("Failed to apply migration v1: {}", e)))?;

    Ok(())
}

/// Version 2: FTS5 table for full-text matching.
fn apply_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE VIRTUAL TABLE IF NOT EXISTS record_fts USING fts5(
            record_id UNINDEXED,
            table_id UNINDEXED,
            content
        );

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (2, 'record_fts');
        ",
    )
    .map_err(|e| TabulaError::Storage(format!("Failed to apply migration v2: {}", e)))?;

    Ok(())
}

/// Version 3: exact decimal text and case-folded text on index rows.
///
/// `number_value` holds decimals as f64, so equality and uniqueness compare
/// `exact_value` instead. `folded_value` carries the lower-cased text that
/// substring matching runs against.
fn apply_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        ALTER TABLE record_index ADD COLUMN exact_value TEXT;
        ALTER TABLE record_index ADD COLUMN folded_value TEXT;

        UPDATE record_index SET folded_value = lower(string_value)
            WHERE string_value IS NOT NULL;
        UPDATE record_index SET exact_value = CAST(number_value AS TEXT)
            WHERE number_value IS NOT NULL
              AND EXISTS (SELECT 1 FROM catalog_fields f
                          WHERE f.table_id = record_index.table_id
                            AND f.name = record_index.field_name
                            AND f.data_type = 'decimal');

        CREATE INDEX IF NOT EXISTS idx_record_index_exact
            ON record_index (table_id, field_name, exact_value)
            WHERE exact_value IS NOT NULL;

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (3, 'record_index_keys');
        ",
    )
    .map_err(|e| TabulaError::Storage(format!("Failed to apply migration v3: {}", e)))?;

    Ok(())
}
