//! Tabula Storage crate - SQLite persistence for catalog, records and index.
//!
//! Provides a WAL-mode SQLite database with migrations, the schema catalog
//! tables, the JSON record store with its audit trail, the flat typed
//! secondary index, and FTS5 full-text matching.

pub mod catalog;
pub mod db;
pub mod index;
pub mod migrations;
pub mod records;
pub mod search;

pub use db::Database;
pub use index::{IndexColumn, IndexEntry, IndexValue};
pub use search::{sanitize_fts5_query, FtsSearch};
