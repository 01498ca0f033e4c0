//! CLI argument definitions for the Tabula application.
//!
//! Uses `clap` with derive macros for ergonomic argument parsing.
//! Priority resolution: CLI args > env vars > config file > defaults.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde_json::Value;

use tabula_core::types::{Filter, FilterOperator, QuerySpec};

/// Tabula: runtime-defined tables with typed fields, views and lookups.
#[derive(Parser, Debug)]
#[command(name = "tabula", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Path to the SQLite database file.
    #[arg(short = 'd', long = "db", global = true)]
    pub db: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List every table in the catalog.
    Tables,
    /// Show one table definition.
    Table { table: String },
    /// Create a table from a JSON definition (inline or `@path`).
    CreateTable { definition: String },
    /// Append a field to a table from a JSON definition (inline or `@path`).
    AddField { table: String, definition: String },
    /// Make sure the table has its built-in views.
    Views { table: String },
    /// Insert a record from a JSON object (inline or `@path`).
    Insert { table: String, document: String },
    /// Replace a record's values from a JSON object (inline or `@path`).
    Update {
        table: String,
        id: uuid::Uuid,
        document: String,
    },
    Delete { table: String, id: uuid::Uuid },
    Get {
        table: String,
        id: uuid::Uuid,
        /// Include computed fields and lookup labels.
        #[arg(long)]
        resolved: bool,
    },
    /// Show a record's audit trail.
    History { table: String, id: uuid::Uuid },
    Query {
        table: String,
        #[command(flatten)]
        query: QueryArgs,
        /// Include computed fields and lookup labels.
        #[arg(long)]
        resolved: bool,
    },
    Count {
        table: String,
        #[command(flatten)]
        query: QueryArgs,
    },
}

#[derive(Args, Debug, Default)]
pub struct QueryArgs {
    /// Filter as `Field<op>Value`, op one of `=`, `~` (contains), `>`, `>=`, `<`, `<=`.
    #[arg(short = 'f', long = "filter", value_parser = parse_filter)]
    pub filters: Vec<Filter>,

    /// Named view whose filters and ordering apply.
    #[arg(long)]
    pub view: Option<String>,

    #[arg(long = "order-by")]
    pub order_by: Option<String>,

    #[arg(long)]
    pub desc: bool,

    #[arg(long, default_value_t = 0)]
    pub skip: u64,

    #[arg(long)]
    pub take: Option<u64>,

    /// Full-text query.
    #[arg(short = 't', long = "text")]
    pub text: Option<String>,
}

impl QueryArgs {
    pub fn into_spec(self) -> QuerySpec {
        QuerySpec {
            filters: self.filters,
            full_text: self.text,
            order_by: self.order_by,
            descending: self.desc,
            skip: self.skip,
            take: self.take,
            view: self.view,
        }
    }
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > TABULA_CONFIG env var > ~/.tabula/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("TABULA_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the database path.
    ///
    /// Priority: --db flag > TABULA_DB env var > config file value.
    pub fn resolve_db_path(&self, config_path: PathBuf) -> PathBuf {
        if let Some(ref p) = self.db {
            return p.clone();
        }
        if let Ok(p) = std::env::var("TABULA_DB") {
            if !p.is_empty() {
                return PathBuf::from(p);
            }
        }
        config_path
    }

    /// Resolve the log level.
    ///
    /// Priority: --log-level flag > config file value.
    pub fn resolve_log_level(&self, config_level: &str) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| config_level.to_string())
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".tabula").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".tabula").join("config.toml");
    }
    PathBuf::from("config.toml")
}

// Longest operators first so `>=` is not read as `>`.
const OPERATORS: &[(&str, FilterOperator)] = &[
    (">=", FilterOperator::GreaterThanOrEqual),
    ("<=", FilterOperator::LessThanOrEqual),
    (">", FilterOperator::GreaterThan),
    ("<", FilterOperator::LessThan),
    ("~", FilterOperator::Contains),
    ("=", FilterOperator::Equals),
];

/// Parse `Field<op>Value`. The value is read as JSON when it parses as a
/// JSON scalar, otherwise taken as a string.
pub fn parse_filter(s: &str) -> Result<Filter, String> {
    let start = s
        .find(['<', '>', '=', '~'])
        .ok_or_else(|| format!("no operator in filter '{}'", s))?;
    let field = s[..start].trim();
    if field.is_empty() {
        return Err(format!("no field name in filter '{}'", s));
    }
    let rest = &s[start..];
    let (token, operator) = OPERATORS
        .iter()
        .find(|(token, _)| rest.starts_with(token))
        .ok_or_else(|| format!("no operator in filter '{}'", s))?;
    let raw = rest[token.len()..].trim();
    let value = match serde_json::from_str::<Value>(raw) {
        Ok(v @ (Value::Number(_) | Value::Bool(_))) => v,
        _ => Value::String(raw.trim_matches('"').to_string()),
    };
    Ok(Filter::new(field, *operator, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_filter_operators() {
        let f = parse_filter("Age>=36").unwrap();
        assert_eq!(f, Filter::new("Age", FilterOperator::GreaterThanOrEqual, 36));

        let f = parse_filter("Age < 10").unwrap();
        assert_eq!(f.operator, FilterOperator::LessThan);
        assert_eq!(f.value, json!(10));

        let f = parse_filter("Name~ada").unwrap();
        assert_eq!(f, Filter::new("Name", FilterOperator::Contains, "ada"));

        let f = parse_filter("Done=true").unwrap();
        assert_eq!(f.value, json!(true));
    }

    #[test]
    fn test_parse_filter_keeps_text() {
        let f = parse_filter("Due Date=2024-03-01").unwrap();
        assert_eq!(f.field, "Due Date");
        assert_eq!(f.value, json!("2024-03-01"));

        let f = parse_filter("Code=\"007\"").unwrap();
        assert_eq!(f.value, json!("007"));

        let f = parse_filter("Note=a=b").unwrap();
        assert_eq!(f.value, json!("a=b"));
    }

    #[test]
    fn test_parse_filter_errors() {
        assert!(parse_filter("Age").is_err());
        assert!(parse_filter(">=3").is_err());
    }

    #[test]
    fn test_parse_query_command() {
        let args = CliArgs::try_parse_from([
            "tabula", "--db", "/tmp/t.db", "query", "contacts", "-f", "Age>=36", "--order-by",
            "Name", "--desc", "--take", "5",
        ])
        .unwrap();
        assert_eq!(args.db, Some(PathBuf::from("/tmp/t.db")));
        let Command::Query { table, query, resolved } = args.command else {
            panic!("expected query command");
        };
        assert_eq!(table, "contacts");
        assert!(!resolved);
        let spec = query.into_spec();
        assert_eq!(spec.filters.len(), 1);
        assert_eq!(spec.order_by.as_deref(), Some("Name"));
        assert!(spec.descending);
        assert_eq!(spec.take, Some(5));
        assert_eq!(spec.skip, 0);
    }

    #[test]
    fn test_db_flag_wins() {
        let args = CliArgs::try_parse_from(["tabula", "-d", "/flag.db", "tables"]).unwrap();
        assert_eq!(
            args.resolve_db_path(PathBuf::from("/config.db")),
            PathBuf::from("/flag.db")
        );
    }

    #[test]
    fn test_log_level_falls_back_to_config() {
        let args = CliArgs::try_parse_from(["tabula", "tables"]).unwrap();
        assert_eq!(args.resolve_log_level("warn"), "warn");
        let args = CliArgs::try_parse_from(["tabula", "tables", "-l", "debug"]).unwrap();
        assert_eq!(args.resolve_log_level("warn"), "debug");
    }
}
