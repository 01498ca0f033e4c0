use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::{CanonicalValue, Values};

// =============================================================================
// Enums
// =============================================================================

/// The closed set of value types a field can declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Text,
    /// 64-bit integer.
    Number,
    /// Arbitrary-precision decimal.
    Decimal,
    Boolean,
    /// Calendar date, stored as midnight UTC.
    Date,
    DateTime,
    /// Text restricted to the field's `enum_values`.
    Enum,
    /// Foreign row id in another table.
    Lookup,
    File,
    Note,
    Tags,
    Json,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Text => "text",
            DataType::Number => "number",
            DataType::Decimal => "decimal",
            DataType::Boolean => "boolean",
            DataType::Date => "date",
            DataType::DateTime => "date_time",
            DataType::Enum => "enum",
            DataType::Lookup => "lookup",
            DataType::File => "file",
            DataType::Note => "note",
            DataType::Tags => "tags",
            DataType::Json => "json",
        }
    }

    /// Types whose canonical form is text.
    pub fn is_text_like(&self) -> bool {
        matches!(
            self,
            DataType::Text
                | DataType::Note
                | DataType::Tags
                | DataType::Json
                | DataType::File
                | DataType::Enum
        )
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Number | DataType::Decimal)
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, DataType::Date | DataType::DateTime)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison operator of a structured query filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    /// Case-insensitive substring match.
    Contains,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Equals => "equals",
            FilterOperator::Contains => "contains",
            FilterOperator::GreaterThan => "greater_than",
            FilterOperator::GreaterThanOrEqual => "greater_than_or_equal",
            FilterOperator::LessThan => "less_than",
            FilterOperator::LessThanOrEqual => "less_than_or_equal",
        }
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of mutation recorded in a table's audit trail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Insert,
    Update,
    Delete,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Insert => "insert",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(AuditAction::Insert),
            "update" => Some(AuditAction::Update),
            "delete" => Some(AuditAction::Delete),
            _ => None,
        }
    }
}

// =============================================================================
// Schema
// =============================================================================

/// Behavioural flags of a field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldFlags {
    pub required: bool,
    pub unique: bool,
    pub indexed: bool,
    pub filterable: bool,
    pub sortable: bool,
    /// Contributes to the full-text document.
    pub searchable: bool,
    pub list_visible: bool,
    pub hidden: bool,
    /// Settable on insert, immutable afterwards.
    pub read_only: bool,
    /// Value derived from `computed_expression`; never stored.
    pub computed: bool,
}

impl Default for FieldFlags {
    fn default() -> Self {
        Self {
            required: false,
            unique: false,
            indexed: true,
            filterable: true,
            sortable: true,
            searchable: false,
            list_visible: true,
            hidden: false,
            read_only: false,
            computed: false,
        }
    }
}

/// Value constraints of a field.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldConstraints {
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub validation_pattern: Option<String>,
    pub enum_values: Vec<String>,
    /// Raw value substituted when the field is absent from a payload.
    pub default_value: Option<serde_json::Value>,
}

/// A typed column of a user-defined table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    #[serde(default = "Uuid::nil")]
    pub id: Uuid,
    #[serde(default = "Uuid::nil")]
    pub table_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub label: String,
    pub data_type: DataType,
    #[serde(default)]
    pub flags: FieldFlags,
    #[serde(default)]
    pub constraints: FieldConstraints,
    /// Target table of a Lookup field, by name or id.
    #[serde(default)]
    pub lookup_target: Option<String>,
    /// Target field whose value labels a resolved lookup.
    #[serde(default)]
    pub lookup_field: Option<String>,
    #[serde(default)]
    pub computed_expression: Option<String>,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        let name = name.into();
        Self {
            id: Uuid::nil(),
            table_id: Uuid::nil(),
            label: name.clone(),
            name,
            data_type,
            flags: FieldFlags::default(),
            constraints: FieldConstraints::default(),
            lookup_target: None,
            lookup_field: None,
            computed_expression: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.flags.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.flags.unique = true;
        self
    }

    pub fn searchable(mut self) -> Self {
        self.flags.searchable = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.flags.read_only = true;
        self
    }

    pub fn not_sortable(mut self) -> Self {
        self.flags.sortable = false;
        self
    }

    pub fn not_filterable(mut self) -> Self {
        self.flags.filterable = false;
        self
    }

    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.constraints.default_value = Some(value);
        self
    }

    pub fn with_length(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        self.constraints.min_length = min;
        self.constraints.max_length = max;
        self
    }

    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.constraints.min_value = min;
        self.constraints.max_value = max;
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.constraints.validation_pattern = Some(pattern.into());
        self
    }

    pub fn with_enum_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.constraints.enum_values = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn lookup(mut self, target: impl Into<String>, label_field: Option<&str>) -> Self {
        self.lookup_target = Some(target.into());
        self.lookup_field = label_field.map(str::to_string);
        self
    }

    pub fn computed(mut self, expression: impl Into<String>) -> Self {
        self.flags.computed = true;
        self.computed_expression = Some(expression.into());
        self
    }

    pub fn is_computed(&self) -> bool {
        self.flags.computed
    }
}

/// A named equality-filter and sort preset over a table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct View {
    #[serde(default = "Uuid::nil")]
    pub id: Uuid,
    #[serde(default = "Uuid::nil")]
    pub table_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    /// Field name → required value.
    #[serde(default)]
    pub query_definition: BTreeMap<String, serde_json::Value>,
    /// `"Field"`, `"Field desc"` or `"-Field"`.
    #[serde(default)]
    pub sort_expression: Option<String>,
    #[serde(default)]
    pub page_size: Option<u64>,
    /// Presentation hint for consumers ("table", "board", ...).
    #[serde(default)]
    pub visualization: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

impl View {
    /// Name of the view that lists every row.
    pub const ALL: &'static str = "all";

    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: Uuid::nil(),
            table_id: Uuid::nil(),
            display_name: name.clone(),
            name,
            description: String::new(),
            query_definition: BTreeMap::new(),
            sort_expression: None,
            page_size: None,
            visualization: None,
            is_default: false,
        }
    }

    /// The unfiltered default view.
    pub fn all() -> Self {
        let mut view = Self::new(Self::ALL);
        view.display_name = "All".to_string();
        view.visualization = Some("table".to_string());
        view.is_default = true;
        view
    }

    pub fn with_filter(mut self, field: impl Into<String>, value: serde_json::Value) -> Self {
        self.query_definition.insert(field.into(), value);
        self
    }

    pub fn with_sort(mut self, expression: impl Into<String>) -> Self {
        self.sort_expression = Some(expression.into());
        self
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = Some(page_size);
        self
    }
}

/// Table-level flags.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableFlags {
    pub is_system: bool,
    pub supports_soft_delete: bool,
    pub has_audit_trail: bool,
}

/// A user-defined record type with ordered fields and views.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Table {
    #[serde(default = "Uuid::nil")]
    pub id: Uuid,
    /// Immutable slug, unique across the catalog.
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub flags: TableFlags,
    #[serde(default)]
    pub default_view: String,
    /// `{{field}}` template producing a human label for a row.
    #[serde(default)]
    pub row_label_template: Option<String>,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub views: Vec<View>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: Uuid::nil(),
            display_name: name.clone(),
            name,
            description: String::new(),
            flags: TableFlags::default(),
            default_view: String::new(),
            row_label_template: None,
            fields: Vec::new(),
            views: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_view(mut self, view: View) -> Self {
        self.views.push(view);
        self
    }

    pub fn soft_delete(mut self) -> Self {
        self.flags.supports_soft_delete = true;
        self
    }

    pub fn audited(mut self) -> Self {
        self.flags.has_audit_trail = true;
        self
    }

    pub fn with_row_label(mut self, template: impl Into<String>) -> Self {
        self.row_label_template = Some(template.into());
        self
    }

    /// Case-insensitive field lookup.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Case-insensitive view lookup.
    pub fn view(&self, name: &str) -> Option<&View> {
        self.views.iter().find(|v| v.name.eq_ignore_ascii_case(name))
    }

    pub fn default_view(&self) -> Option<&View> {
        self.view(&self.default_view)
            .or_else(|| self.views.iter().find(|v| v.is_default))
    }
}

// =============================================================================
// Rows
// =============================================================================

/// A stored row: an opaque document of canonical values plus bookkeeping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub table_id: Uuid,
    /// Field name → canonical JSON value.
    pub data: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Starts at 1, incremented by every update.
    pub version: i64,
}

impl Record {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A lookup field resolved to its target row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LookupResolution {
    pub target_id: Uuid,
    pub label: Option<String>,
    pub target_table_id: Uuid,
    pub target_table_name: String,
}

/// A record together with its decoded values and resolved lookups.
#[derive(Clone, Debug, Serialize)]
pub struct ResolvedRecord {
    pub record: Record,
    pub values: Values,
    pub lookups: BTreeMap<String, LookupResolution>,
}

/// One entry of a table's audit trail.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub record_id: Uuid,
    pub table_id: Uuid,
    pub action: AuditAction,
    pub version: i64,
    pub at: DateTime<Utc>,
    pub data: serde_json::Map<String, serde_json::Value>,
}

// =============================================================================
// Queries
// =============================================================================

/// A structured filter `(field, operator, value)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub operator: FilterOperator,
    pub value: serde_json::Value,
}

impl Filter {
    pub fn new(
        field: impl Into<String>,
        operator: FilterOperator,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self::new(field, FilterOperator::Equals, value)
    }
}

/// Query input: filters, optional full-text, ordering and pagination.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySpec {
    pub filters: Vec<Filter>,
    pub full_text: Option<String>,
    pub order_by: Option<String>,
    pub descending: bool,
    pub skip: u64,
    pub take: Option<u64>,
    pub view: Option<String>,
}

impl QuerySpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn full_text(mut self, text: impl Into<String>) -> Self {
        self.full_text = Some(text.into());
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.order_by = Some(field.into());
        self.descending = descending;
        self
    }

    pub fn page(mut self, skip: u64, take: u64) -> Self {
        self.skip = skip;
        self.take = Some(take);
        self
    }

    pub fn view(mut self, name: impl Into<String>) -> Self {
        self.view = Some(name.into());
        self
    }
}

/// Convenience for building a raw document from `(name, value)` pairs.
pub fn document<I, K>(pairs: I) -> serde_json::Map<String, serde_json::Value>
where
    I: IntoIterator<Item = (K, serde_json::Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Case-insensitive lookup into a canonical value map.
pub fn value_ci<'a>(values: &'a Values, name: &str) -> Option<&'a CanonicalValue> {
    values.get(name).or_else(|| {
        values
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    })
}
