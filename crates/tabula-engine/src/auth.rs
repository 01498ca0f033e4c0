//! Authorization decorator.
//!
//! [`Authorized`] wraps any [`TableEngine`] and asks an [`Authorizer`]
//! before each call. A denial surfaces as [`TabulaError::AccessDenied`] and
//! the wrapped engine is never reached.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use tabula_core::error::{Result, TabulaError};
use tabula_core::types::{AuditEntry, Field, QuerySpec, Record, ResolvedRecord, Table};

use crate::catalog::parse_sort_expression;
use crate::engine::TableEngine;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Read,
    Create,
    Update,
    Delete,
    /// Schema changes: creating tables, adding fields or views.
    Manage,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Read => "read",
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Manage => "manage",
        };
        f.write_str(s)
    }
}

/// What an action applies to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Scope {
    /// The catalog as a whole (creating tables).
    Catalog,
    Table(Uuid),
    Record { table_id: Uuid, record_id: Uuid },
    Field { table_id: Uuid, field: String },
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Catalog => f.write_str("catalog"),
            Scope::Table(id) => write!(f, "table {}", id),
            Scope::Record {
                table_id,
                record_id,
            } => write!(f, "record {} in table {}", record_id, table_id),
            Scope::Field { table_id, field } => write!(f, "field '{}' of table {}", field, table_id),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny(String),
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, action: Action, scope: &Scope) -> AuthDecision;
}

/// Grants everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _action: Action, _scope: &Scope) -> AuthDecision {
        AuthDecision::Allow
    }
}

/// A [`TableEngine`] that checks every call with an [`Authorizer`] first.
pub struct Authorized<E, A> {
    inner: E,
    authorizer: A,
}

impl<E, A> Authorized<E, A>
where
    E: TableEngine,
    A: Authorizer,
{
    pub fn new(inner: E, authorizer: A) -> Self {
        Self { inner, authorizer }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    async fn check(&self, action: Action, scope: Scope) -> Result<()> {
        match self.authorizer.authorize(action, &scope).await {
            AuthDecision::Allow => Ok(()),
            AuthDecision::Deny(reason) => Err(TabulaError::AccessDenied(format!(
                "{} on {}: {}",
                action, scope, reason
            ))),
        }
    }

    /// Check read access to every field a query touches, including the
    /// filters and ordering a named view contributes.
    async fn check_query(&self, table_id: Uuid, spec: Option<&QuerySpec>) -> Result<()> {
        self.check(Action::Read, Scope::Table(table_id)).await?;
        let Some(spec) = spec else {
            return Ok(());
        };
        let mut fields: Vec<String> = spec
            .filters
            .iter()
            .map(|f| f.field.clone())
            .chain(spec.order_by.clone())
            .collect();

        if let Some(name) = &spec.view {
            let table = self.inner.get_table(table_id).await?;
            // An unknown view is reported by the wrapped engine.
            if let Some(view) = table.view(name) {
                fields.extend(view.query_definition.keys().cloned());
                if spec.order_by.is_none() {
                    if let Some(expression) = &view.sort_expression {
                        let (field, _) = parse_sort_expression(expression);
                        if !field.is_empty() {
                            fields.push(field.to_string());
                        }
                    }
                }
            }
        }

        for field in fields {
            self.check(Action::Read, Scope::Field { table_id, field })
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<E, A> TableEngine for Authorized<E, A>
where
    E: TableEngine,
    A: Authorizer,
{
    async fn create_table(&self, table: Table) -> Result<Table> {
        self.check(Action::Manage, Scope::Catalog).await?;
        self.inner.create_table(table).await
    }

    async fn get_table(&self, table_id: Uuid) -> Result<Table> {
        self.check(Action::Read, Scope::Table(table_id)).await?;
        self.inner.get_table(table_id).await
    }

    /// Tables the caller may not read are left out.
    async fn get_tables(&self) -> Result<Vec<Table>> {
        let tables = self.inner.get_tables().await?;
        let mut visible = Vec::with_capacity(tables.len());
        for table in tables {
            let decision = self
                .authorizer
                .authorize(Action::Read, &Scope::Table(table.id))
                .await;
            if decision == AuthDecision::Allow {
                visible.push(table);
            }
        }
        Ok(visible)
    }

    /// The key is resolved first; the check runs on the table it names.
    async fn find_table(&self, key: &str) -> Result<Table> {
        let table = self.inner.find_table(key).await?;
        self.check(Action::Read, Scope::Table(table.id)).await?;
        Ok(table)
    }

    async fn generate_simple_views(&self, table_id: Uuid) -> Result<Table> {
        self.check(Action::Manage, Scope::Table(table_id)).await?;
        self.inner.generate_simple_views(table_id).await
    }

    async fn add_field(&self, table_id: Uuid, field: Field) -> Result<Table> {
        self.check(
            Action::Manage,
            Scope::Field {
                table_id,
                field: field.name.clone(),
            },
        )
        .await?;
        self.inner.add_field(table_id, field).await
    }

    async fn insert(&self, table_id: Uuid, document: Map<String, Value>) -> Result<Record> {
        self.check(Action::Create, Scope::Table(table_id)).await?;
        self.inner.insert(table_id, document).await
    }

    async fn update(&self, table_id: Uuid, id: Uuid, document: Map<String, Value>) -> Result<Record> {
        self.check(
            Action::Update,
            Scope::Record {
                table_id,
                record_id: id,
            },
        )
        .await?;
        self.inner.update(table_id, id, document).await
    }

    async fn delete(&self, table_id: Uuid, id: Uuid) -> Result<()> {
        self.check(
            Action::Delete,
            Scope::Record {
                table_id,
                record_id: id,
            },
        )
        .await?;
        self.inner.delete(table_id, id).await
    }

    async fn get(&self, table_id: Uuid, id: Uuid) -> Result<Record> {
        self.check(
            Action::Read,
            Scope::Record {
                table_id,
                record_id: id,
            },
        )
        .await?;
        self.inner.get(table_id, id).await
    }

    async fn get_resolved(&self, table_id: Uuid, id: Uuid) -> Result<ResolvedRecord> {
        self.check(
            Action::Read,
            Scope::Record {
                table_id,
                record_id: id,
            },
        )
        .await?;
        self.inner.get_resolved(table_id, id).await
    }

    async fn count(&self, table_id: Uuid, spec: Option<QuerySpec>) -> Result<u64> {
        self.check_query(table_id, spec.as_ref()).await?;
        self.inner.count(table_id, spec).await
    }

    async fn query(&self, table_id: Uuid, spec: Option<QuerySpec>) -> Result<Vec<Record>> {
        self.check_query(table_id, spec.as_ref()).await?;
        self.inner.query(table_id, spec).await
    }

    async fn query_resolved(&self, table_id: Uuid, spec: Option<QuerySpec>) -> Result<Vec<ResolvedRecord>> {
        self.check_query(table_id, spec.as_ref()).await?;
        self.inner.query_resolved(table_id, spec).await
    }

    async fn history(&self, table_id: Uuid, id: Uuid) -> Result<Vec<AuditEntry>> {
        self.check(
            Action::Read,
            Scope::Record {
                table_id,
                record_id: id,
            },
        )
        .await?;
        self.inner.history(table_id, id).await
    }
}
