//! Full-text matching using SQLite FTS5.
//!
//! Each record contributes one document (the display text of its searchable
//! fields) to the `record_fts` virtual table. Matching returns record ids
//! only; ordering and paging stay with the query executor.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use tabula_core::error::{Result, TabulaError};

use crate::catalog::parse_id;
use crate::db::Database;

/// Full-text index backed by FTS5.
///
/// A match set is capped at `max_matches` best-ranked ids. Structured filters
/// run after matching, so a capped set can hide lower-ranked rows that would
/// have passed them; hitting the cap is logged at `warn`.
pub struct FtsSearch {
    db: Arc<Database>,
    max_matches: u64,
}

impl FtsSearch {
    pub fn new(db: Arc<Database>, max_matches: u64) -> Self {
        Self { db, max_matches }
    }

    /// Replace the indexed document of a record.
    ///
    /// Blank content removes the record from the index.
    pub fn index_document(&self, table_id: Uuid, record_id: Uuid, content: &str) -> Result<()> {
        self.db.with_tx(|tx| {
            tx.execute(
                "DELETE FROM record_fts WHERE record_id = ?1",
                rusqlite::params![record_id.to_string()],
            )
            .map_err(|e| TabulaError::Search(format!("FTS5 delete failed: {}", e)))?;

            if content.trim().is_empty() {
                return Ok(());
            }

            tx.execute(
                "INSERT INTO record_fts (record_id, table_id, content) VALUES (?1, ?2, ?3)",
                rusqlite::params![record_id.to_string(), table_id.to_string(), content],
            )
            .map_err(|e| TabulaError::Search(format!("FTS5 insert failed: {}", e)))?;
            Ok(())
        })?;

        debug!(%table_id, %record_id, "Record full-text document indexed");
        Ok(())
    }

    /// Drop a record's document.
    pub fn remove(&self, record_id: Uuid) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM record_fts WHERE record_id = ?1",
                rusqlite::params![record_id.to_string()],
            )
            .map_err(|e| TabulaError::Search(format!("FTS5 delete failed: {}", e)))?;
            Ok(())
        })
    }

    /// Ids of records in a table whose document matches every term of `query`.
    ///
    /// The query is treated as plain text, never as FTS5 syntax.
    pub fn matching_ids(&self, table_id: Uuid, query: &str) -> Result<HashSet<Uuid>> {
        let fts_query = sanitize_fts5_query(query);
        if fts_query.is_empty() {
            return Ok(HashSet::new());
        }

        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT record_id FROM record_fts
                     WHERE record_fts MATCH ?1 AND table_id = ?2
                     ORDER BY rank
                     LIMIT ?3",
                )
                .map_err(|e| TabulaError::Search(format!("FTS5 query prepare failed: {}", e)))?;

            let rows = stmt
                .query_map(
                    rusqlite::params![fts_query, table_id.to_string(), self.max_matches as i64],
                    |row| row.get::<_, String>(0),
                )
                .map_err(|e| TabulaError::Search(format!("FTS5 query failed: {}", e)))?;

            let mut ids = HashSet::new();
            for row in rows {
                let id = row.map_err(|e| TabulaError::Search(e.to_string()))?;
                ids.insert(parse_id(&id)?);
            }
            if ids.len() as u64 >= self.max_matches {
                warn!(
                    %table_id,
                    max_matches = self.max_matches,
                    "Full-text match set hit its cap, lower-ranked matches dropped"
                );
            }
            Ok(ids)
        })
    }
}

/// Quote each whitespace-separated term so user input cannot inject FTS5
/// operators. Terms are implicitly AND-ed.
pub fn sanitize_fts5_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_search() -> FtsSearch {
        FtsSearch::new(Arc::new(Database::in_memory().unwrap()), 100)
    }

    #[test]
    fn test_sanitize_quotes_terms() {
        assert_eq!(sanitize_fts5_query("hello world"), "\"hello\" \"world\"");
        assert_eq!(sanitize_fts5_query("  "), "");
        assert_eq!(sanitize_fts5_query("a\"b"), "\"a\"\"b\"");
        assert_eq!(sanitize_fts5_query("NOT x*"), "\"NOT\" \"x*\"");
    }

    #[test]
    fn test_index_and_match() {
        let search = make_search();
        let table = Uuid::new_v4();
        let ada = Uuid::new_v4();
        let grace = Uuid::new_v4();
        search.index_document(table, ada, "Ada Lovelace analyst").unwrap();
        search.index_document(table, grace, "Grace Hopper compiler").unwrap();

        let ids = search.matching_ids(table, "lovelace").unwrap();
        assert_eq!(ids, HashSet::from([ada]));
        assert!(search.matching_ids(table, "nobody").unwrap().is_empty());
        assert!(search.matching_ids(table, "   ").unwrap().is_empty());
    }

    #[test]
    fn test_all_terms_must_match() {
        let search = make_search();
        let table = Uuid::new_v4();
        let ada = Uuid::new_v4();
        search.index_document(table, ada, "Ada Lovelace").unwrap();
        assert_eq!(search.matching_ids(table, "ada lovelace").unwrap().len(), 1);
        assert!(search.matching_ids(table, "ada hopper").unwrap().is_empty());
    }

    #[test]
    fn test_matching_is_scoped_to_table() {
        let search = make_search();
        let contacts = Uuid::new_v4();
        let tasks = Uuid::new_v4();
        search.index_document(contacts, Uuid::new_v4(), "review").unwrap();
        let task = Uuid::new_v4();
        search.index_document(tasks, task, "review").unwrap();
        assert_eq!(search.matching_ids(tasks, "review").unwrap(), HashSet::from([task]));
    }

    #[test]
    fn test_reindex_replaces_document() {
        let search = make_search();
        let table = Uuid::new_v4();
        let id = Uuid::new_v4();
        search.index_document(table, id, "draft").unwrap();
        search.index_document(table, id, "final").unwrap();
        assert!(search.matching_ids(table, "draft").unwrap().is_empty());
        assert_eq!(search.matching_ids(table, "final").unwrap().len(), 1);

        search.index_document(table, id, "").unwrap();
        assert!(search.matching_ids(table, "final").unwrap().is_empty());
    }

    #[test]
    fn test_match_set_is_capped() {
        let search = FtsSearch::new(Arc::new(Database::in_memory().unwrap()), 2);
        let table = Uuid::new_v4();
        for _ in 0..3 {
            search.index_document(table, Uuid::new_v4(), "quarterly report").unwrap();
        }
        assert_eq!(search.matching_ids(table, "report").unwrap().len(), 2);
    }

    #[test]
    fn test_remove() {
        let search = make_search();
        let table = Uuid::new_v4();
        let id = Uuid::new_v4();
        search.index_document(table, id, "hello world").unwrap();
        search.remove(id).unwrap();
        assert!(search.matching_ids(table, "hello").unwrap().is_empty());
    }

    #[test]
    fn test_operator_text_is_literal() {
        let search = make_search();
        let table = Uuid::new_v4();
        search.index_document(table, Uuid::new_v4(), "plain words").unwrap();
        // Unquoted, OR would make this match.
        assert!(search.matching_ids(table, "plain OR missing").unwrap().is_empty());
        assert_eq!(search.matching_ids(table, "plain words").unwrap().len(), 1);
    }

    #[test]
    fn test_max_matches_caps_results() {
        let search = FtsSearch::new(Arc::new(Database::in_memory().unwrap()), 3);
        let table = Uuid::new_v4();
        for _ in 0..10 {
            search.index_document(table, Uuid::new_v4(), "rust").unwrap();
        }
        assert_eq!(search.matching_ids(table, "rust").unwrap().len(), 3);
    }
}
