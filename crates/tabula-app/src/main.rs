//! Tabula application binary - composition root.
//!
//! 1. Parse arguments and load configuration from TOML
//! 2. Open the SQLite database
//! 3. Pick the full-text collaborator and build the engine
//! 4. Run one command and print its result as JSON

mod cli;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::{Map, Value};

use tabula_core::config::TabulaConfig;
use tabula_core::error::{Result, TabulaError};
use tabula_core::types::{Field, Table};
use tabula_engine::{Engine, EngineContext, NoopSearch, SearchIndexer, TableEngine};
use tabula_storage::{Database, FtsSearch};

use cli::{CliArgs, Command};

/// Read a JSON argument, inline or from `@path`.
fn read_json(arg: &str) -> Result<Value> {
    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)?,
        None => arg.to_string(),
    };
    serde_json::from_str(&text).map_err(|e| TabulaError::Serialization(e.to_string()))
}

fn read_document(arg: &str) -> Result<Map<String, Value>> {
    match read_json(arg)? {
        Value::Object(map) => Ok(map),
        other => Err(TabulaError::Serialization(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

fn read_definition<T: serde::de::DeserializeOwned>(arg: &str) -> Result<T> {
    serde_json::from_value(read_json(arg)?).map_err(|e| TabulaError::Serialization(e.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| TabulaError::Serialization(e.to_string()))
}

/// Run one command against the engine.
async fn execute(engine: &impl TableEngine, command: Command) -> Result<Value> {
    match command {
        Command::Tables => to_json(&engine.get_tables().await?),
        Command::Table { table } => to_json(&engine.find_table(&table).await?),
        Command::CreateTable { definition } => {
            let table: Table = read_definition(&definition)?;
            to_json(&engine.create_table(table).await?)
        }
        Command::AddField { table, definition } => {
            let table = engine.find_table(&table).await?;
            let field: Field = read_definition(&definition)?;
            to_json(&engine.add_field(table.id, field).await?)
        }
        Command::Views { table } => {
            let table = engine.find_table(&table).await?;
            to_json(&engine.generate_simple_views(table.id).await?.views)
        }
        Command::Insert { table, document } => {
            let table = engine.find_table(&table).await?;
            to_json(&engine.insert(table.id, read_document(&document)?).await?)
        }
        Command::Update {
            table,
            id,
            document,
        } => {
            let table = engine.find_table(&table).await?;
            to_json(&engine.update(table.id, id, read_document(&document)?).await?)
        }
        Command::Delete { table, id } => {
            let table = engine.find_table(&table).await?;
            engine.delete(table.id, id).await?;
            Ok(serde_json::json!({ "deleted": id }))
        }
        Command::Get {
            table,
            id,
            resolved,
        } => {
            let table = engine.find_table(&table).await?;
            if resolved {
                to_json(&engine.get_resolved(table.id, id).await?)
            } else {
                to_json(&engine.get(table.id, id).await?)
            }
        }
        Command::History { table, id } => {
            let table = engine.find_table(&table).await?;
            to_json(&engine.history(table.id, id).await?)
        }
        Command::Query {
            table,
            query,
            resolved,
        } => {
            let table = engine.find_table(&table).await?;
            let spec = Some(query.into_spec());
            if resolved {
                to_json(&engine.query_resolved(table.id, spec).await?)
            } else {
                to_json(&engine.query(table.id, spec).await?)
            }
        }
        Command::Count { table, query } => {
            let table = engine.find_table(&table).await?;
            let count = engine.count(table.id, Some(query.into_spec())).await?;
            Ok(serde_json::json!({ "count": count }))
        }
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    let config_file = args.resolve_config_path();
    let config = TabulaConfig::load_or_default(&config_file);

    // Tracing. Logs go to stderr so stdout stays machine-readable.
    let level = args.resolve_log_level(&config.general.log_level);
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&level)),
        )
        .init();

    tracing::debug!("Starting Tabula v{}", env!("CARGO_PKG_VERSION"));
    tracing::debug!(path = %config_file.display(), "Configuration resolved");

    // Storage.
    let db_path = args.resolve_db_path(config.database_path());
    let timeout = Duration::from_millis(config.storage.busy_timeout_ms);
    let db = match Database::new(&db_path, timeout) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            tracing::error!(path = %db_path.display(), error = %e, "Failed to open database");
            return Err(e.into());
        }
    };
    tracing::debug!(path = %db_path.display(), "SQLite database opened");

    // Full-text collaborator.
    let search: Arc<dyn SearchIndexer> = if config.search.full_text {
        Arc::new(FtsSearch::new(Arc::clone(&db), config.search.max_matches))
    } else {
        tracing::debug!("Full-text search disabled in config");
        Arc::new(NoopSearch)
    };

    let engine = Engine::new(EngineContext::new(db, search, config.query.clone()));

    let output = execute(&engine, args.command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
