// 🏷️ Validation Rules - Rules as Data
// Typed, prioritized per-domain rules. Each rule type carries only its own
// parameters; the validation engine matches on them exhaustively.

use crate::error::{ImportError, Result};
use crate::schema::Domain;
use anyhow::Context as AnyhowContext;
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

// ============================================================================
// SEVERITY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Invalidates the row
    Error,
    /// Recorded, row stays valid
    Warning,
    /// Recorded, row stays valid
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Error
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// RULE DEFINITION
// ============================================================================

/// Sub-formats understood by the `format` rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatKind {
    Email,
    Uuid,
    Date,
    Phone,
    Url,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CrossFieldCondition {
    /// Field is required only when `dependent_field` is present and non-empty
    RequiredIf { dependent_field: String },
}

impl CrossFieldCondition {
    pub fn dependent_field(&self) -> &str {
        match self {
            CrossFieldCondition::RequiredIf { dependent_field } => dependent_field,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule_type", rename_all = "snake_case")]
pub enum RuleDefinition {
    Required,
    Range {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    Regex {
        pattern: String,
    },
    Enum {
        #[serde(alias = "allowed_values")]
        values: Vec<String>,
    },
    Length {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_length: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_length: Option<usize>,
    },
    Format {
        format: FormatKind,
    },
    CrossField {
        condition: CrossFieldCondition,
    },
    /// Needs the whole dataset; checked by the target table's constraints
    Unique,
    /// Needs an external lookup; checked by the target table's constraints
    ForeignKey {
        #[serde(default)]
        table: String,
        #[serde(default)]
        column: String,
    },
    Custom {
        #[serde(default)]
        name: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

impl RuleDefinition {
    pub fn rule_type(&self) -> &'static str {
        match self {
            RuleDefinition::Required => "required",
            RuleDefinition::Range { .. } => "range",
            RuleDefinition::Regex { .. } => "regex",
            RuleDefinition::Enum { .. } => "enum",
            RuleDefinition::Length { .. } => "length",
            RuleDefinition::Format { .. } => "format",
            RuleDefinition::CrossField { .. } => "cross_field",
            RuleDefinition::Unique => "unique",
            RuleDefinition::ForeignKey { .. } => "foreign_key",
            RuleDefinition::Custom { .. } => "custom",
        }
    }

    /// Field whose presence also triggers this rule, if any
    pub fn dependency(&self) -> Option<&str> {
        match self {
            RuleDefinition::CrossField { condition } => Some(condition.dependent_field()),
            _ => None,
        }
    }
}

// ============================================================================
// VALIDATION RULE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    #[serde(default)]
    pub id: i64,

    pub domain: Domain,

    /// Target field this rule guards
    pub field_name: String,

    #[serde(flatten)]
    pub definition: RuleDefinition,

    #[serde(default)]
    pub severity: Severity,

    /// Template with {{field}}, {{value}}, {{row}} placeholders
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default = "default_active")]
    pub is_active: bool,

    /// Ascending: lower runs first
    #[serde(default)]
    pub priority: i32,
}

fn default_active() -> bool {
    true
}

impl ValidationRule {
    pub fn new(domain: Domain, field_name: impl Into<String>, definition: RuleDefinition) -> Self {
        ValidationRule {
            id: 0,
            domain,
            field_name: field_name.into(),
            definition,
            severity: Severity::Error,
            error_message: None,
            is_active: true,
            priority: 0,
        }
    }

    /// Builder: set severity
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Builder: set message template
    pub fn with_message(mut self, template: impl Into<String>) -> Self {
        self.error_message = Some(template.into());
        self
    }

    /// Builder: set priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn rule_type(&self) -> &'static str {
        self.definition.rule_type()
    }
}

// ============================================================================
// RULE SET
// ============================================================================

/// Active rules for one domain, ordered by ascending priority
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<ValidationRule>,
}

impl RuleSet {
    pub fn new() -> Self {
        RuleSet { rules: Vec::new() }
    }

    /// Keep active rules only, sorted by priority (stable for equal priorities)
    pub fn from_rules(mut rules: Vec<ValidationRule>) -> Self {
        rules.retain(|r| r.is_active);
        rules.sort_by_key(|r| r.priority);
        RuleSet { rules }
    }

    pub fn add_rule(&mut self, rule: ValidationRule) {
        if rule.is_active {
            self.rules.push(rule);
            self.rules.sort_by_key(|r| r.priority);
        }
    }

    pub fn rules(&self) -> &[ValidationRule] {
        &self.rules
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

/// Read a JSON array of rules
pub fn load_rule_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<ValidationRule>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read rules file: {:?}", path.as_ref()))?;

    let rules: Vec<ValidationRule> =
        serde_json::from_str(&content).context("Failed to parse rules JSON")?;

    Ok(rules)
}

// ============================================================================
// RULE STORE
// ============================================================================

pub fn insert_rule(conn: &Connection, rule: &ValidationRule) -> Result<i64> {
    if rule.field_name.trim().is_empty() {
        return Err(ImportError::InvalidRule("field_name must not be empty".to_string()));
    }

    conn.execute(
        "INSERT INTO validation_rules (
            domain, field_name, rule_type, rule_definition, severity,
            error_message, is_active, priority, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            rule.domain.as_str(),
            rule.field_name,
            rule.rule_type(),
            serde_json::to_string(&rule.definition)?,
            rule.severity.as_str(),
            rule.error_message,
            rule.is_active,
            rule.priority,
            Utc::now().to_rfc3339(),
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

/// Active rules for a domain, ascending priority then insertion order
pub fn find_active_rules(conn: &Connection, domain: Domain) -> Result<RuleSet> {
    let mut stmt = conn.prepare(
        "SELECT id, field_name, rule_definition, severity, error_message, priority
         FROM validation_rules
         WHERE domain = ?1 AND is_active = 1
         ORDER BY priority ASC, id ASC",
    )?;

    let raw = stmt
        .query_map(params![domain.as_str()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, i32>(5)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut rules = Vec::with_capacity(raw.len());
    for (id, field_name, definition_json, severity, error_message, priority) in raw {
        let definition: RuleDefinition = serde_json::from_str(&definition_json)?;
        let severity: Severity = serde_json::from_value(serde_json::Value::String(severity))?;

        rules.push(ValidationRule {
            id,
            domain,
            field_name,
            definition,
            severity,
            error_message,
            is_active: true,
            priority,
        });
    }

    Ok(RuleSet::from_rules(rules))
}

// ============================================================================
// TESTS
// ============================================================================
