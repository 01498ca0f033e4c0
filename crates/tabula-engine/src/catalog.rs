//! Schema catalog service.
//!
//! Checks and normalizes table definitions before they reach storage, and
//! keeps the "at least one default view" invariant on every table.

use std::collections::HashSet;

use regex::Regex;
use rusqlite::Connection;
use tracing::{debug, info};
use uuid::Uuid;

use tabula_core::error::{Result, TabulaError};
use tabula_core::types::{DataType, Field, Filter, Table, View};
use tabula_core::value::{normalize, validate};
use tabula_storage::catalog as store;

use crate::planner;

/// Persist a new table.
///
/// Ids are assigned to the table and every nested field and view. An "all"
/// view is added when missing, and exactly one view ends up as the default.
pub fn create_table(conn: &Connection, mut table: Table) -> Result<Table> {
    check_table_name(&table.name)?;
    if store::find_table_id(conn, &table.name)?.is_some() {
        return Err(TabulaError::Schema(format!(
            "table '{}' already exists",
            table.name
        )));
    }
    if table.display_name.trim().is_empty() {
        table.display_name = table.name.clone();
    }

    table.id = Uuid::new_v4();
    let mut seen = HashSet::new();
    for field in &mut table.fields {
        prepare_field(field, table.id)?;
        if !seen.insert(field.name.to_lowercase()) {
            return Err(TabulaError::Schema(format!(
                "duplicate field name '{}' on table '{}'",
                field.name, table.name
            )));
        }
    }

    let mut seen = HashSet::new();
    for view in &table.views {
        if view.name.trim().is_empty() {
            return Err(TabulaError::Schema("view name must not be empty".into()));
        }
        if !seen.insert(view.name.to_lowercase()) {
            return Err(TabulaError::Schema(format!(
                "duplicate view name '{}' on table '{}'",
                view.name, table.name
            )));
        }
        check_view(&table, view)?;
    }

    ensure_all_view(&mut table);
    settle_default_view(&mut table);
    for view in &mut table.views {
        view.id = Uuid::new_v4();
        view.table_id = table.id;
    }

    store::insert_table(conn, &table)?;
    info!(
        table = %table.name,
        id = %table.id,
        fields = table.fields.len(),
        views = table.views.len(),
        "Table created"
    );
    Ok(table)
}

/// Ensure an already-persisted table has its "all" view. Idempotent.
pub fn generate_simple_views(conn: &Connection, table_id: Uuid) -> Result<Table> {
    let mut table = get_table(conn, table_id)?;

    if ensure_all_view(&mut table) {
        let position = table.views.len() - 1;
        let view = &mut table.views[position];
        view.id = Uuid::new_v4();
        view.table_id = table.id;
        store::insert_view(conn, table.id, position, view)?;
        info!(table = %table.name, "Default view generated");
    }

    if table.default_view().is_none() || table.default_view.is_empty() {
        table.default_view = View::ALL.to_string();
        store::update_table_header(conn, &table)?;
        debug!(table = %table.name, "Default view reset to 'all'");
    }
    Ok(table)
}

/// Load a table by id.
pub fn get_table(conn: &Connection, table_id: Uuid) -> Result<Table> {
    store::load_table(conn, table_id)?
        .ok_or_else(|| TabulaError::NotFound(format!("table {}", table_id)))
}

pub fn get_tables(conn: &Connection) -> Result<Vec<Table>> {
    store::load_tables(conn)
}

/// Load a table by id or by name (case-insensitive).
pub fn find_table(conn: &Connection, key: &str) -> Result<Table> {
    resolve_table(conn, key)?.ok_or_else(|| TabulaError::NotFound(format!("table '{}'", key)))
}

/// Like [`find_table`], but a missing table is `None`.
pub fn resolve_table(conn: &Connection, key: &str) -> Result<Option<Table>> {
    let key = key.trim();
    if let Ok(id) = Uuid::parse_str(key) {
        if let Some(table) = store::load_table(conn, id)? {
            return Ok(Some(table));
        }
    }
    match store::find_table_id(conn, key)? {
        Some(id) => store::load_table(conn, id),
        None => Ok(None),
    }
}

/// Append a field to an existing table. Stored rows are left as they are.
pub fn add_field(conn: &Connection, table_id: Uuid, mut field: Field) -> Result<Table> {
    let mut table = get_table(conn, table_id)?;
    prepare_field(&mut field, table.id)?;
    if table.field(&field.name).is_some() {
        return Err(TabulaError::Schema(format!(
            "duplicate field name '{}' on table '{}'",
            field.name, table.name
        )));
    }
    if field.flags.required && field.constraints.default_value.is_none() && !field.is_computed() {
        return Err(TabulaError::Schema(format!(
            "required field '{}' added to existing table needs a default value",
            field.name
        )));
    }

    store::insert_field(conn, table.id, table.fields.len(), &field)?;
    info!(table = %table.name, field = %field.name, "Field added");
    table.fields.push(field);
    Ok(table)
}

fn check_table_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(TabulaError::Schema(format!(
            "invalid table name '{}': use letters, digits, '_' or '-'",
            name
        )))
    }
}

fn prepare_field(field: &mut Field, table_id: Uuid) -> Result<()> {
    field.name = field.name.trim().to_string();
    if field.name.is_empty() {
        return Err(TabulaError::Schema("field name must not be empty".into()));
    }
    if field.label.trim().is_empty() {
        field.label = field.name.clone();
    }
    field.id = Uuid::new_v4();
    field.table_id = table_id;

    if field.data_type == DataType::Lookup
        && field
            .lookup_target
            .as_deref()
            .map_or(true, |t| t.trim().is_empty())
    {
        return Err(TabulaError::Schema(format!(
            "lookup field '{}' has no target table",
            field.name
        )));
    }

    if field.computed_expression.is_some() {
        field.flags.computed = true;
    }
    if field.flags.computed
        && field
            .computed_expression
            .as_deref()
            .map_or(true, |e| e.trim().is_empty())
    {
        return Err(TabulaError::Schema(format!(
            "computed field '{}' has no expression",
            field.name
        )));
    }

    if let Some(pattern) = &field.constraints.validation_pattern {
        Regex::new(pattern).map_err(|e| {
            TabulaError::Schema(format!(
                "invalid validation pattern on '{}': {}",
                field.name, e
            ))
        })?;
    }

    if let Some(default) = &field.constraints.default_value {
        if !default.is_null() {
            let value = normalize(field, default).map_err(|e| {
                TabulaError::Schema(format!("invalid default for '{}': {}", field.name, e))
            })?;
            validate(field, &value).map_err(|e| {
                TabulaError::Schema(format!("invalid default for '{}': {}", field.name, e))
            })?;
        }
    }
    Ok(())
}

/// A view's filters must plan as equality filters against the table.
fn check_view(table: &Table, view: &View) -> Result<()> {
    for (key, value) in &view.query_definition {
        if table.field(key).is_none() {
            return Err(TabulaError::Schema(format!(
                "view '{}' filters on undeclared field '{}'",
                view.name, key
            )));
        }
        planner::predicate(table, &Filter::eq(key.clone(), value.clone())).map_err(|e| {
            TabulaError::Schema(format!(
                "view '{}' has an invalid filter on '{}': {}",
                view.name, key, e
            ))
        })?;
    }
    if let Some(expression) = &view.sort_expression {
        let (field, _) = parse_sort_expression(expression);
        if !field.is_empty() && table.field(field).is_none() {
            return Err(TabulaError::Schema(format!(
                "view '{}' sorts on undeclared field '{}'",
                view.name, field
            )));
        }
    }
    Ok(())
}

/// Append the "all" view when the table has none. Returns whether it did.
fn ensure_all_view(table: &mut Table) -> bool {
    if table.view(View::ALL).is_some() {
        return false;
    }
    let mut view = View::all();
    view.is_default = !table.views.iter().any(|v| v.is_default);
    table.views.push(view);
    true
}

/// Pick the default view (explicit name, else first flagged, else "all")
/// and flag it alone.
fn settle_default_view(table: &mut Table) {
    let chosen = table
        .view(&table.default_view)
        .or_else(|| table.views.iter().find(|v| v.is_default))
        .map(|v| v.name.clone())
        .unwrap_or_else(|| View::ALL.to_string());

    for view in &mut table.views {
        view.is_default = view.name.eq_ignore_ascii_case(&chosen);
    }
    table.default_view = chosen;
}

/// Split `"Field"`, `"Field desc"`, `"Field asc"` or `"-Field"` into the
/// field name and a descending flag.
pub fn parse_sort_expression(expression: &str) -> (&str, bool) {
    let expression = expression.trim();
    if let Some(field) = expression.strip_prefix('-') {
        return (field.trim(), true);
    }
    match expression.rsplit_once(char::is_whitespace) {
        Some((field, dir)) if dir.eq_ignore_ascii_case("desc") => (field.trim(), true),
        Some((field, dir)) if dir.eq_ignore_ascii_case("asc") => (field.trim(), false),
        _ => (expression, false),
    }
}
