//! Query planning and execution over the secondary index.
//!
//! A [`QuerySpec`] is resolved against the table's schema into a
//! [`QueryPlan`]: view filters merged in, every filter turned into a
//! correlated `EXISTS` predicate on `record_index`, ordering mapped to a
//! typed index column, paging clamped. The plan is then run against a
//! connection, optionally restricted to a full-text match set.

use std::collections::HashSet;

use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use tabula_core::error::{Result, TabulaError};
use tabula_core::types::{Filter, FilterOperator, QuerySpec, Record, Table};
use tabula_core::value::{normalize, supports};
use tabula_storage::index::{fold, IndexColumn, IndexValue};
use tabula_storage::records::{row_to_record, RECORD_COLUMNS};

use crate::catalog::parse_sort_expression;

/// A filter resolved to an index predicate.
#[derive(Clone, Debug, PartialEq)]
pub struct Predicate {
    pub field: String,
    pub operator: FilterOperator,
    pub value: IndexValue,
}

/// Sort key on a typed index column.
#[derive(Clone, Debug, PartialEq)]
pub struct SortKey {
    pub field: String,
    pub column: IndexColumn,
    pub descending: bool,
}

/// A resolved, executable query.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryPlan {
    pub table_id: Uuid,
    pub predicates: Vec<Predicate>,
    pub full_text: Option<String>,
    /// `None` means newest-created-first.
    pub sort: Option<SortKey>,
    pub skip: u64,
    pub take: u64,
}

/// Resolve `spec` against `table`.
pub fn plan(table: &Table, spec: &QuerySpec, max_page_size: u64) -> Result<QueryPlan> {
    let view = match &spec.view {
        Some(name) => Some(table.view(name).ok_or_else(|| {
            TabulaError::Schema(format!("unknown view '{}' on table '{}'", name, table.name))
        })?),
        None => None,
    };

    let mut filters = spec.filters.clone();
    if let Some(view) = view {
        for (field, value) in &view.query_definition {
            if !filters.iter().any(|f| f.field.eq_ignore_ascii_case(field)) {
                filters.push(Filter::eq(field.clone(), value.clone()));
            }
        }
    }

    let predicates = filters
        .iter()
        .map(|filter| predicate(table, filter))
        .collect::<Result<Vec<_>>>()?;

    let order = match (&spec.order_by, view.and_then(|v| v.sort_expression.as_deref())) {
        (Some(field), _) => Some((field.as_str(), spec.descending)),
        (None, Some(expression)) => Some(parse_sort_expression(expression)),
        (None, None) => None,
    };
    let sort = match order {
        Some((name, descending)) if !name.is_empty() => sort_key(table, name, descending)?,
        _ => None,
    };

    let take = spec
        .take
        .or_else(|| view.and_then(|v| v.page_size))
        .unwrap_or(max_page_size)
        .min(max_page_size);

    let full_text = spec
        .full_text
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    let plan = QueryPlan {
        table_id: table.id,
        predicates,
        full_text,
        sort,
        skip: spec.skip,
        take,
    };
    debug!(table = %table.name, ?plan, "Query planned");
    Ok(plan)
}

/// Resolve one filter against the table's schema.
pub(crate) fn predicate(table: &Table, filter: &Filter) -> Result<Predicate> {
    let field = table.field(&filter.field).ok_or_else(|| {
        TabulaError::Schema(format!(
            "unknown field '{}' on table '{}'",
            filter.field, table.name
        ))
    })?;
    if !field.flags.filterable {
        return Err(TabulaError::Schema(format!(
            "field '{}' is not filterable",
            field.name
        )));
    }
    if !supports(field.data_type, filter.operator) {
        return Err(TabulaError::UnsupportedOperator {
            field: field.name.clone(),
            operator: filter.operator,
            data_type: field.data_type,
        });
    }

    let value = if filter.operator == FilterOperator::Contains {
        // Substring of the stored text, not a full canonical value.
        match &filter.value {
            serde_json::Value::String(s) => IndexValue::Text(s.clone()),
            serde_json::Value::Number(n) => IndexValue::Text(n.to_string()),
            _ => {
                return Err(TabulaError::TypeMismatch {
                    field: field.name.clone(),
                    expected: field.data_type,
                })
            }
        }
    } else {
        IndexValue::from_canonical(&normalize(field, &filter.value)?)
    };

    Ok(Predicate {
        field: field.name.clone(),
        operator: filter.operator,
        value,
    })
}

fn sort_key(table: &Table, name: &str, descending: bool) -> Result<Option<SortKey>> {
    let field = table.field(name).ok_or_else(|| {
        TabulaError::Schema(format!("unknown field '{}' on table '{}'", name, table.name))
    })?;
    if !field.flags.sortable {
        debug!(field = %field.name, "Field not sortable, using default order");
        return Ok(None);
    }
    Ok(Some(SortKey {
        field: field.name.clone(),
        column: IndexColumn::for_type(field.data_type),
        descending,
    }))
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
pub fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl QueryPlan {
    /// `WHERE` clause shared by fetch and count, with its parameters.
    fn where_clause(&self, matches: Option<&HashSet<Uuid>>, params: &mut Vec<SqlValue>) -> String {
        let mut clauses = vec!["r.table_id = ?".to_string(), "r.deleted_at IS NULL".to_string()];
        params.push(SqlValue::Text(self.table_id.to_string()));

        for predicate in &self.predicates {
            let (comparison, value) = match predicate.operator {
                FilterOperator::Contains => {
                    let IndexValue::Text(needle) = &predicate.value else {
                        unreachable!("contains predicates always hold text");
                    };
                    let pattern = format!("%{}%", escape_like(&fold(needle)));
                    (
                        "i.folded_value LIKE ? ESCAPE '\\'".to_string(),
                        SqlValue::Text(pattern),
                    )
                }
                FilterOperator::Equals => {
                    let (column, value) = predicate.value.equality();
                    (format!("i.{} = ?", column), value)
                }
                op => {
                    let symbol = match op {
                        FilterOperator::GreaterThan => ">",
                        FilterOperator::GreaterThanOrEqual => ">=",
                        FilterOperator::LessThan => "<",
                        _ => "<=",
                    };
                    (
                        format!("i.{} {} ?", predicate.value.column().name(), symbol),
                        predicate.value.sql_value(),
                    )
                }
            };
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM record_index i
                         WHERE i.record_id = r.id AND i.table_id = r.table_id
                           AND i.field_name = ? AND {})",
                comparison
            ));
            params.push(SqlValue::Text(predicate.field.clone()));
            params.push(value);
        }

        if let Some(ids) = matches {
            let placeholders = vec!["?"; ids.len()].join(", ");
            clauses.push(format!("r.id IN ({})", placeholders));
            params.extend(ids.iter().map(|id| SqlValue::Text(id.to_string())));
        }

        clauses.join(" AND ")
    }

    /// Run the plan and return the page of matching records.
    ///
    /// `matches` restricts the result to a full-text match set.
    pub fn fetch(&self, conn: &Connection, matches: Option<&HashSet<Uuid>>) -> Result<Vec<Record>> {
        if matches.is_some_and(|m| m.is_empty()) {
            return Ok(Vec::new());
        }

        let mut params = Vec::new();
        let (join, order) = match &self.sort {
            Some(sort) => {
                params.push(SqlValue::Text(sort.field.clone()));
                let column = format!("s.{}", sort.column.name());
                let collate = if sort.column == IndexColumn::String {
                    " COLLATE NOCASE"
                } else {
                    ""
                };
                let direction = if sort.descending { "DESC" } else { "ASC" };
                (
                    "LEFT JOIN record_index s
                       ON s.record_id = r.id AND s.table_id = r.table_id AND s.field_name = ?"
                        .to_string(),
                    format!(
                        "({column} IS NULL) ASC, {column}{collate} {direction}, r.created_at DESC, r.rowid DESC"
                    ),
                )
            }
            None => (String::new(), "r.created_at DESC, r.rowid DESC".to_string()),
        };
        let where_clause = self.where_clause(matches, &mut params);
        params.push(SqlValue::Integer(clamp_i64(self.take)));
        params.push(SqlValue::Integer(clamp_i64(self.skip)));

        let sql = format!(
            "SELECT {} FROM records r {} WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
            RECORD_COLUMNS, join, where_clause, order
        );

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| TabulaError::Storage(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params), |row| Ok(row_to_record(row)))
            .map_err(|e| TabulaError::Storage(format!("Failed to run query: {}", e)))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(|e| TabulaError::Storage(e.to_string()))??);
        }
        Ok(records)
    }

    /// Count matching records, ignoring ordering and paging.
    pub fn count(&self, conn: &Connection, matches: Option<&HashSet<Uuid>>) -> Result<u64> {
        if matches.is_some_and(|m| m.is_empty()) {
            return Ok(0);
        }

        let mut params = Vec::new();
        let where_clause = self.where_clause(matches, &mut params);
        let sql = format!("SELECT COUNT(*) FROM records r WHERE {}", where_clause);
        let count: i64 = conn
            .query_row(&sql, rusqlite::params_from_iter(params), |row| row.get(0))
            .map_err(|e| TabulaError::Storage(format!("Failed to count records: {}", e)))?;
        Ok(count as u64)
    }
}

fn clamp_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
