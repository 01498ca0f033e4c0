//! Engine facade: the operations consumers call.
//!
//! Every mutation runs as one transaction holding the database lock:
//! validation (including uniqueness and lookup checks), the document write,
//! the full index rewrite and the audit entry commit or roll back together.
//! The search collaborator hears about the change only after commit.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use tabula_core::config::QueryConfig;
use tabula_core::error::{Result, TabulaError};
use tabula_core::types::{AuditAction, AuditEntry, Field, QuerySpec, Record, ResolvedRecord, Table};
use tabula_core::value::{encode_document, Values};
use tabula_storage::{index, records, Database};

use crate::catalog;
use crate::planner::{self, QueryPlan};
use crate::resolver;
use crate::search::{NoopSearch, SearchIndexer, RECORD_ENTITY};
use crate::validator;

/// Current time at the microsecond precision records are stored with.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Everything an engine needs, passed in explicitly.
#[derive(Clone)]
pub struct EngineContext {
    pub db: Arc<Database>,
    pub search: Arc<dyn SearchIndexer>,
    pub query: QueryConfig,
}

impl EngineContext {
    pub fn new(db: Arc<Database>, search: Arc<dyn SearchIndexer>, query: QueryConfig) -> Self {
        Self { db, search, query }
    }

    /// Context with no full-text collaborator and default query limits.
    pub fn without_search(db: Arc<Database>) -> Self {
        Self::new(db, Arc::new(NoopSearch), QueryConfig::default())
    }
}

/// Operations over runtime-defined tables.
#[async_trait]
pub trait TableEngine: Send + Sync {
    async fn create_table(&self, table: Table) -> Result<Table>;
    async fn get_table(&self, table_id: Uuid) -> Result<Table>;
    async fn get_tables(&self) -> Result<Vec<Table>>;
    /// Look a table up by id or name.
    async fn find_table(&self, key: &str) -> Result<Table>;
    async fn generate_simple_views(&self, table_id: Uuid) -> Result<Table>;
    async fn add_field(&self, table_id: Uuid, field: Field) -> Result<Table>;

    async fn insert(&self, table_id: Uuid, document: Map<String, Value>) -> Result<Record>;
    /// Replace a record's values. Read-only fields keep their stored value.
    async fn update(&self, table_id: Uuid, id: Uuid, document: Map<String, Value>) -> Result<Record>;
    async fn delete(&self, table_id: Uuid, id: Uuid) -> Result<()>;
    async fn get(&self, table_id: Uuid, id: Uuid) -> Result<Record>;
    async fn get_resolved(&self, table_id: Uuid, id: Uuid) -> Result<ResolvedRecord>;

    async fn count(&self, table_id: Uuid, spec: Option<QuerySpec>) -> Result<u64>;
    async fn query(&self, table_id: Uuid, spec: Option<QuerySpec>) -> Result<Vec<Record>>;
    async fn query_resolved(&self, table_id: Uuid, spec: Option<QuerySpec>) -> Result<Vec<ResolvedRecord>>;

    /// Audit entries of a record, oldest first. Empty for unaudited tables.
    async fn history(&self, table_id: Uuid, id: Uuid) -> Result<Vec<AuditEntry>>;
}

/// The SQLite-backed [`TableEngine`].
pub struct Engine {
    ctx: EngineContext,
}

impl Engine {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Plan a query and fetch the full-text match set it needs, if any.
    async fn prepare(
        &self,
        table_id: Uuid,
        spec: Option<QuerySpec>,
    ) -> Result<(Table, QueryPlan, Option<HashSet<Uuid>>)> {
        let table = self.ctx.db.with_conn(|conn| catalog::get_table(conn, table_id))?;
        let spec = spec.unwrap_or_default();
        let plan = planner::plan(&table, &spec, self.ctx.query.max_page_size)?;
        let matches = match &plan.full_text {
            Some(text) => Some(self.ctx.search.matching_ids(table.id, text).await?),
            None => None,
        };
        Ok((table, plan, matches))
    }

    async fn notify_indexed(&self, table: &Table, record: &Record, values: &Values) {
        if let Err(e) = self.ctx.search.index_record(table, record, values).await {
            warn!(table = %table.name, record = %record.id, error = %e, "Search indexing failed");
        }
    }

    async fn notify_removed(&self, id: Uuid) {
        if let Err(e) = self.ctx.search.remove(RECORD_ENTITY, id).await {
            warn!(record = %id, error = %e, "Search removal failed");
        }
    }
}

fn record_not_found(table: &Table, id: Uuid) -> TabulaError {
    TabulaError::NotFound(format!("record {} in table '{}'", id, table.name))
}

#[async_trait]
impl TableEngine for Engine {
    async fn create_table(&self, table: Table) -> Result<Table> {
        self.ctx.db.with_tx(|tx| catalog::create_table(tx, table))
    }

    async fn get_table(&self, table_id: Uuid) -> Result<Table> {
        self.ctx.db.with_conn(|conn| catalog::get_table(conn, table_id))
    }

    async fn get_tables(&self) -> Result<Vec<Table>> {
        self.ctx.db.with_conn(catalog::get_tables)
    }

    async fn find_table(&self, key: &str) -> Result<Table> {
        self.ctx.db.with_conn(|conn| catalog::find_table(conn, key))
    }

    async fn generate_simple_views(&self, table_id: Uuid) -> Result<Table> {
        self.ctx
            .db
            .with_tx(|tx| catalog::generate_simple_views(tx, table_id))
    }

    async fn add_field(&self, table_id: Uuid, field: Field) -> Result<Table> {
        self.ctx.db.with_tx(|tx| catalog::add_field(tx, table_id, field))
    }

    async fn insert(&self, table_id: Uuid, document: Map<String, Value>) -> Result<Record> {
        let now = now();
        let (table, record, indexed) = self.ctx.db.with_tx(|tx| {
            let table = catalog::get_table(tx, table_id)?;
            let values = validator::validate_record_payload(tx, &table, &document, None)?;
            let record = Record {
                id: Uuid::new_v4(),
                table_id: table.id,
                data: encode_document(&values),
                created_at: now,
                updated_at: now,
                deleted_at: None,
                version: 1,
            };
            records::insert_record(tx, &record)?;
            let indexed = validator::with_computed(&table, &values);
            index::upsert_index(tx, table.id, record.id, &indexed)?;
            if table.flags.has_audit_trail {
                records::append_audit(tx, &record, AuditAction::Insert, now)?;
            }
            Ok((table, record, indexed))
        })?;

        debug!(table = %table.name, record = %record.id, "Record inserted");
        self.notify_indexed(&table, &record, &indexed).await;
        Ok(record)
    }

    async fn update(&self, table_id: Uuid, id: Uuid, document: Map<String, Value>) -> Result<Record> {
        let now = now();
        let (table, record, indexed) = self.ctx.db.with_tx(|tx| {
            let table = catalog::get_table(tx, table_id)?;
            let existing = records::load_live_record(tx, table.id, id)?
                .ok_or_else(|| record_not_found(&table, id))?;
            let values = validator::validate_record_payload(tx, &table, &document, Some(&existing))?;
            let record = Record {
                data: encode_document(&values),
                updated_at: now,
                version: existing.version + 1,
                ..existing
            };
            records::update_record(tx, &record)?;
            let indexed = validator::with_computed(&table, &values);
            index::upsert_index(tx, table.id, record.id, &indexed)?;
            if table.flags.has_audit_trail {
                records::append_audit(tx, &record, AuditAction::Update, now)?;
            }
            Ok((table, record, indexed))
        })?;

        debug!(table = %table.name, record = %record.id, version = record.version, "Record updated");
        self.notify_indexed(&table, &record, &indexed).await;
        Ok(record)
    }

    async fn delete(&self, table_id: Uuid, id: Uuid) -> Result<()> {
        let now = now();
        let table = self.ctx.db.with_tx(|tx| {
            let table = catalog::get_table(tx, table_id)?;
            let existing = records::load_live_record(tx, table.id, id)?
                .ok_or_else(|| record_not_found(&table, id))?;
            if table.flags.supports_soft_delete {
                records::soft_delete_record(tx, id, now)?;
            } else {
                records::hard_delete_record(tx, id)?;
            }
            if table.flags.has_audit_trail {
                records::append_audit(tx, &existing, AuditAction::Delete, now)?;
            }
            Ok(table)
        })?;

        info!(
            table = %table.name,
            record = %id,
            soft = table.flags.supports_soft_delete,
            "Record deleted"
        );
        self.notify_removed(id).await;
        Ok(())
    }

    async fn get(&self, table_id: Uuid, id: Uuid) -> Result<Record> {
        self.ctx.db.with_conn(|conn| {
            let table = catalog::get_table(conn, table_id)?;
            records::load_live_record(conn, table.id, id)?.ok_or_else(|| record_not_found(&table, id))
        })
    }

    async fn get_resolved(&self, table_id: Uuid, id: Uuid) -> Result<ResolvedRecord> {
        self.ctx.db.with_conn(|conn| {
            let table = catalog::get_table(conn, table_id)?;
            let record = records::load_live_record(conn, table.id, id)?
                .ok_or_else(|| record_not_found(&table, id))?;
            resolver::resolve_record(conn, &table, record)
        })
    }

    async fn count(&self, table_id: Uuid, spec: Option<QuerySpec>) -> Result<u64> {
        let (_, plan, matches) = self.prepare(table_id, spec).await?;
        self.ctx.db.with_conn(|conn| plan.count(conn, matches.as_ref()))
    }

    async fn query(&self, table_id: Uuid, spec: Option<QuerySpec>) -> Result<Vec<Record>> {
        let (table, plan, matches) = self.prepare(table_id, spec).await?;
        let records = self.ctx.db.with_conn(|conn| plan.fetch(conn, matches.as_ref()))?;
        debug!(table = %table.name, rows = records.len(), "Query executed");
        Ok(records)
    }

    async fn query_resolved(&self, table_id: Uuid, spec: Option<QuerySpec>) -> Result<Vec<ResolvedRecord>> {
        let (table, plan, matches) = self.prepare(table_id, spec).await?;
        self.ctx.db.with_conn(|conn| {
            plan.fetch(conn, matches.as_ref())?
                .into_iter()
                .map(|record| resolver::resolve_record(conn, &table, record))
                .collect()
        })
    }

    async fn history(&self, table_id: Uuid, id: Uuid) -> Result<Vec<AuditEntry>> {
        self.ctx.db.with_conn(|conn| {
            let table = catalog::get_table(conn, table_id)?;
            records::load_audit(conn, table.id, id)
        })
    }
}
