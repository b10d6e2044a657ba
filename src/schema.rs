// 📐 Schema Catalog - per-domain field definitions
// Read-only from the engine's point of view: administrators load schemas,
// the classifier and the execution engine only look them up.

use crate::error::{ImportError, Result};
use anyhow::Context as AnyhowContext;
use chrono::Utc;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

// ============================================================================
// DOMAIN
// ============================================================================

/// Closed set of target domains an import can land in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Products,
    Machines,
    Users,
    Sales,
    Customers,
    Suppliers,
    Inventory,
    Locations,
}

impl Domain {
    pub const ALL: [Domain; 8] = [
        Domain::Products,
        Domain::Machines,
        Domain::Users,
        Domain::Sales,
        Domain::Customers,
        Domain::Suppliers,
        Domain::Inventory,
        Domain::Locations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Products => "products",
            Domain::Machines => "machines",
            Domain::Users => "users",
            Domain::Sales => "sales",
            Domain::Customers => "customers",
            Domain::Suppliers => "suppliers",
            Domain::Inventory => "inventory",
            Domain::Locations => "locations",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        Domain::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == wanted)
            .ok_or_else(|| ImportError::InvalidRequest(format!("unknown domain '{}'", s)))
    }
}

// ============================================================================
// FIELD DEFINITIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Date,
    Email,
    Json,
}

impl Default for FieldType {
    fn default() -> Self {
        FieldType::String
    }
}

/// Optional hints an administrator attaches to a field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    /// System (column) name in the target table
    pub name: String,

    /// Human-readable label, also accepted as a header
    #[serde(default)]
    pub display_name: String,

    #[serde(default, rename = "type")]
    pub field_type: FieldType,

    #[serde(default)]
    pub required: bool,

    /// Alternate header spellings accepted for this field
    #[serde(default)]
    pub synonyms: Vec<String>,

    #[serde(default)]
    pub validation: ValidationHints,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        FieldDefinition {
            display_name: name.clone(),
            name,
            field_type,
            required: false,
            synonyms: Vec::new(),
            validation: ValidationHints::default(),
            default_value: None,
        }
    }

    /// Builder: mark as required
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Builder: set display name
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    /// Builder: add a synonym
    pub fn with_synonym(mut self, synonym: impl Into<String>) -> Self {
        self.synonyms.push(synonym.into());
        self
    }

    /// Builder: set default value
    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default_value = Some(value);
        self
    }

    /// Normalized names a header may carry to match this field:
    /// system name, display name and every synonym.
    pub fn candidate_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.synonyms.len() + 2);
        for raw in std::iter::once(&self.name)
            .chain(std::iter::once(&self.display_name))
            .chain(self.synonyms.iter())
        {
            let normalized = normalize_header(raw);
            if !normalized.is_empty() && !names.contains(&normalized) {
                names.push(normalized);
            }
        }
        names
    }
}

// ============================================================================
// SCHEMA DEFINITION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default)]
    pub id: i64,
    pub domain: Domain,
    pub table_name: String,
    #[serde(default)]
    pub display_name: String,
    pub fields: Vec<FieldDefinition>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub unique_fields: Vec<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_active() -> bool {
    true
}

impl SchemaDefinition {
    pub fn new(domain: Domain, table_name: impl Into<String>) -> Self {
        SchemaDefinition {
            id: 0,
            domain,
            table_name: table_name.into(),
            display_name: domain.as_str().to_string(),
            fields: Vec::new(),
            required_fields: Vec::new(),
            unique_fields: Vec::new(),
            version: default_version(),
            is_active: true,
        }
    }

    /// Builder: append a field (iteration order = classification order)
    pub fn with_field(mut self, field: FieldDefinition) -> Self {
        self.fields.push(field);
        self
    }

    /// Builder: mark a field unique
    pub fn with_unique(mut self, field_name: impl Into<String>) -> Self {
        self.unique_fields.push(field_name.into());
        self
    }

    /// A field is required when flagged or listed in `required_fields`
    pub fn is_required(&self, field: &FieldDefinition) -> bool {
        field.required || self.required_fields.iter().any(|r| r == &field.name)
    }

    pub fn required_field_count(&self) -> usize {
        self.fields.iter().filter(|f| self.is_required(f)).count()
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }
}

// ============================================================================
// HEADER NORMALIZATION
// ============================================================================

fn separator_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\s\-_]+").expect("static separator pattern"))
}

/// Lowercase, trim, and collapse whitespace/hyphen/underscore runs to `_`.
///
/// "  Product-Name " → "product_name"
pub fn normalize_header(header: &str) -> String {
    let lowered = header.trim().to_lowercase();
    separator_runs().replace_all(&lowered, "_").into_owned()
}

// ============================================================================
// CATALOG STORE
// ============================================================================

const SCHEMA_COLUMNS: &str = "id, domain, table_name, display_name, fields, required_fields,
     unique_fields, version, is_active";

/// Raw column values, decoded into a `SchemaDefinition` outside the row closure
struct SchemaRow {
    id: i64,
    domain: String,
    table_name: String,
    display_name: String,
    fields: String,
    required_fields: String,
    unique_fields: String,
    version: String,
    is_active: bool,
}

fn schema_from_row(row: &Row<'_>) -> rusqlite::Result<SchemaRow> {
    Ok(SchemaRow {
        id: row.get(0)?,
        domain: row.get(1)?,
        table_name: row.get(2)?,
        display_name: row.get(3)?,
        fields: row.get(4)?,
        required_fields: row.get(5)?,
        unique_fields: row.get(6)?,
        version: row.get(7)?,
        is_active: row.get(8)?,
    })
}

fn decode_schema(raw: SchemaRow) -> Result<SchemaDefinition> {
    Ok(SchemaDefinition {
        id: raw.id,
        domain: raw.domain.parse()?,
        table_name: raw.table_name,
        display_name: raw.display_name,
        fields: serde_json::from_str(&raw.fields)?,
        required_fields: serde_json::from_str(&raw.required_fields)?,
        unique_fields: serde_json::from_str(&raw.unique_fields)?,
        version: raw.version,
        is_active: raw.is_active,
    })
}

/// Insert a schema definition, returning its row id
pub fn insert_schema_definition(conn: &Connection, schema: &SchemaDefinition) -> Result<i64> {
    conn.execute(
        "INSERT INTO schema_definitions (
            domain, table_name, display_name, fields, required_fields,
            unique_fields, version, is_active, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            schema.domain.as_str(),
            schema.table_name,
            schema.display_name,
            serde_json::to_string(&schema.fields)?,
            serde_json::to_string(&schema.required_fields)?,
            serde_json::to_string(&schema.unique_fields)?,
            schema.version,
            schema.is_active,
            Utc::now().to_rfc3339(),
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

/// Latest active schema for a domain, if any
pub fn find_active_schema(conn: &Connection, domain: Domain) -> Result<Option<SchemaDefinition>> {
    let sql = format!(
        "SELECT {} FROM schema_definitions
         WHERE domain = ?1 AND is_active = 1
         ORDER BY id DESC LIMIT 1",
        SCHEMA_COLUMNS
    );

    let raw = conn
        .query_row(&sql, params![domain.as_str()], schema_from_row)
        .optional()?;

    raw.map(decode_schema).transpose()
}

/// One active schema per domain (latest version), in registration order
pub fn list_active_schemas(conn: &Connection) -> Result<Vec<SchemaDefinition>> {
    let sql = format!(
        "SELECT {} FROM schema_definitions
         WHERE id IN (
             SELECT MAX(id) FROM schema_definitions WHERE is_active = 1 GROUP BY domain
         )
         ORDER BY id ASC",
        SCHEMA_COLUMNS
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], schema_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter().map(decode_schema).collect()
}

/// Load schema definitions from a JSON file (array of schemas)
pub fn load_schema_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<SchemaDefinition>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read schema file: {:?}", path.as_ref()))?;

    let schemas: Vec<SchemaDefinition> =
        serde_json::from_str(&content).context("Failed to parse schema JSON")?;

    Ok(schemas)
}

// ============================================================================
// TESTS
// ============================================================================
