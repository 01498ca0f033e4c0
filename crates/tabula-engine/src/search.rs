//! Full-text search collaborator contract.
//!
//! The engine notifies an implementation after every committed write and
//! consults it only for the set of record ids matching a text query.

use std::collections::HashSet;

use async_trait::async_trait;
use uuid::Uuid;

use tabula_core::error::Result;
use tabula_core::types::{DataType, Record, Table};
use tabula_core::value::Values;
use tabula_storage::FtsSearch;

/// Entity name passed to [`SearchIndexer::remove`] for records.
pub const RECORD_ENTITY: &str = "Record";

#[async_trait]
pub trait SearchIndexer: Send + Sync {
    /// Called after an insert or update has committed.
    async fn index_record(&self, table: &Table, record: &Record, values: &Values) -> Result<()>;

    /// Called after a delete has committed.
    async fn remove(&self, entity: &str, id: Uuid) -> Result<()>;

    /// Ids of the table's records matching `query`.
    async fn matching_ids(&self, table_id: Uuid, query: &str) -> Result<HashSet<Uuid>>;
}

/// Ignores notifications and matches nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSearch;

#[async_trait]
impl SearchIndexer for NoopSearch {
    async fn index_record(&self, _table: &Table, _record: &Record, _values: &Values) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _entity: &str, _id: Uuid) -> Result<()> {
        Ok(())
    }

    async fn matching_ids(&self, _table_id: Uuid, _query: &str) -> Result<HashSet<Uuid>> {
        Ok(HashSet::new())
    }
}

#[async_trait]
impl SearchIndexer for FtsSearch {
    async fn index_record(&self, table: &Table, record: &Record, values: &Values) -> Result<()> {
        self.index_document(table.id, record.id, &document_text(table, values))
    }

    async fn remove(&self, entity: &str, id: Uuid) -> Result<()> {
        if entity != RECORD_ENTITY {
            return Ok(());
        }
        FtsSearch::remove(self, id)
    }

    async fn matching_ids(&self, table_id: Uuid, query: &str) -> Result<HashSet<Uuid>> {
        FtsSearch::matching_ids(self, table_id, query)
    }
}

/// Text indexed for a record: the values of its searchable fields, or of
/// every Text/Note field when the table marks none, in declaration order.
pub fn document_text(table: &Table, values: &Values) -> String {
    let marked = table.fields.iter().any(|f| f.flags.searchable);
    table
        .fields
        .iter()
        .filter(|f| {
            if marked {
                f.flags.searchable
            } else {
                matches!(f.data_type, DataType::Text | DataType::Note)
            }
        })
        .filter_map(|f| values.get(&f.name))
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tabula_core::types::Field;
    use tabula_core::value::CanonicalValue;
    use tabula_storage::Database;

    fn values() -> Values {
        [
            ("Name", CanonicalValue::Text("Ada".into())),
            ("Bio", CanonicalValue::Text("analyst".into())),
            ("Age", CanonicalValue::Number(36)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    #[test]
    fn test_document_text_defaults_to_text_fields() {
        let table = Table::new("p")
            .with_field(Field::new("Name", DataType::Text))
            .with_field(Field::new("Age", DataType::Number))
            .with_field(Field::new("Bio", DataType::Note));
        assert_eq!(document_text(&table, &values()), "Ada analyst");
    }

    #[test]
    fn test_document_text_uses_searchable_fields() {
        let table = Table::new("p")
            .with_field(Field::new("Name", DataType::Text))
            .with_field(Field::new("Age", DataType::Number).searchable())
            .with_field(Field::new("Bio", DataType::Note).searchable());
        assert_eq!(document_text(&table, &values()), "36 analyst");
    }

    #[tokio::test]
    async fn test_noop_matches_nothing() {
        let search = NoopSearch;
        assert!(search.matching_ids(Uuid::new_v4(), "ada").await.unwrap().is_empty());
        search.remove(RECORD_ENTITY, Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn test_fts_indexer_round_trip() {
        let search = FtsSearch::new(Arc::new(Database::in_memory().unwrap()), 100);
        let mut table = Table::new("p").with_field(Field::new("Name", DataType::Text));
        table.id = Uuid::new_v4();
        let now = chrono::Utc::now();
        let record = Record {
            id: Uuid::new_v4(),
            table_id: table.id,
            data: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            version: 1,
        };

        SearchIndexer::index_record(&search, &table, &record, &values()).await.unwrap();
        let ids = SearchIndexer::matching_ids(&search, table.id, "ada").await.unwrap();
        assert!(ids.contains(&record.id));

        SearchIndexer::remove(&search, "Note", record.id).await.unwrap();
        assert_eq!(SearchIndexer::matching_ids(&search, table.id, "ada").await.unwrap().len(), 1);

        SearchIndexer::remove(&search, RECORD_ENTITY, record.id).await.unwrap();
        assert!(SearchIndexer::matching_ids(&search, table.id, "ada").await.unwrap().is_empty());
    }
}
