// ✅ Validation Engine
// Evaluates every mapped row against the active rule set. The report is a
// snapshot: each run recomputes it from scratch.

use crate::parser::Record;
use crate::rules::{CrossFieldCondition, FormatKind, RuleDefinition, RuleSet, Severity, ValidationRule};
use chrono::{DateTime, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::OnceLock;

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowIssue {
    /// 1-based row number in the sample
    pub row: usize,
    pub field: String,
    pub rule_type: String,
    pub message: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub total_rows: usize,
    pub valid_rows: usize,
    pub invalid_rows: usize,
    /// Error-severity failures, row order then rule priority order
    pub errors: Vec<RowIssue>,
    /// Warning and info failures, same ordering
    pub warnings: Vec<RowIssue>,
    pub rules_applied: usize,
}

impl ValidationReport {
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Row numbers carrying at least one error-severity failure
    pub fn invalid_row_numbers(&self) -> BTreeSet<usize> {
        self.errors.iter().map(|e| e.row).collect()
    }

    pub fn issues_for_row(&self, row: usize) -> Vec<&RowIssue> {
        self.errors.iter().filter(|e| e.row == row).collect()
    }
}

/// What execution would do with the sample, shown to approvers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPlan {
    pub to_insert: usize,
    pub to_skip: usize,
}

impl ActionPlan {
    pub fn from_report(report: &ValidationReport) -> Self {
        ActionPlan {
            to_insert: report.valid_rows,
            to_skip: report.invalid_rows,
        }
    }
}

// ============================================================================
// VALUE HELPERS
// ============================================================================

/// Re-key a source row by target field; unmatched headers become Null
pub fn apply_mapping(row: &Record, mapping: &BTreeMap<String, String>) -> Record {
    let mut record = Record::new();
    for (header, field) in mapping {
        let value = row.get(header).cloned().unwrap_or(Value::Null);
        record.insert(field.clone(), value);
    }
    record
}

/// Absent, null, or empty after trimming
pub fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn email_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("static email pattern"))
}

fn phone_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+?[0-9 ()\-.]{7,20}$").expect("static phone pattern"))
}

fn url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^https?://[^\s/$.?#][^\s]*$").expect("static url pattern"))
}

pub fn is_valid_date(s: &str) -> bool {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
        || NaiveDate::parse_from_str(s, "%m/%d/%Y").is_ok()
        || DateTime::parse_from_rfc3339(s).is_ok()
}

pub fn check_format(format: FormatKind, s: &str) -> bool {
    let s = s.trim();
    match format {
        FormatKind::Email => email_pattern().is_match(s),
        FormatKind::Uuid => uuid::Uuid::parse_str(s).is_ok(),
        FormatKind::Date => is_valid_date(s),
        FormatKind::Phone => {
            phone_pattern().is_match(s) && s.chars().filter(|c| c.is_ascii_digit()).count() >= 7
        }
        FormatKind::Url => url_pattern().is_match(s),
    }
}

fn format_name(format: FormatKind) -> &'static str {
    match format {
        FormatKind::Email => "email address",
        FormatKind::Uuid => "UUID",
        FormatKind::Date => "date",
        FormatKind::Phone => "phone number",
        FormatKind::Url => "URL",
    }
}

fn render(template: &str, field: &str, value: &str, row: usize) -> String {
    template
        .replace("{{field}}", field)
        .replace("{{value}}", value)
        .replace("{{row}}", &row.to_string())
}

fn bounds_text<T: std::fmt::Display>(min: Option<T>, max: Option<T>) -> String {
    match (min, max) {
        (Some(min), Some(max)) => format!("between {} and {}", min, max),
        (Some(min), None) => format!("at least {}", min),
        (None, Some(max)) => format!("at most {}", max),
        (None, None) => "within range".to_string(),
    }
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct ValidationEngine {
    rules: RuleSet,
    /// Compiled `regex` rule patterns; Err holds the compile error
    patterns: HashMap<String, Result<Regex, String>>,
}

impl ValidationEngine {
    pub fn new(rules: RuleSet) -> Self {
        let mut patterns = HashMap::new();
        for rule in rules.rules() {
            if let RuleDefinition::Regex { pattern } = &rule.definition {
                patterns
                    .entry(pattern.clone())
                    .or_insert_with(|| Regex::new(pattern).map_err(|e| e.to_string()));
            }
        }
        ValidationEngine { rules, patterns }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.rule_count()
    }

    /// Validate every row of the sample under the given mapping
    pub fn validate(&self, rows: &[Record], mapping: &BTreeMap<String, String>) -> ValidationReport {
        let mut report = ValidationReport {
            total_rows: rows.len(),
            rules_applied: self.rules.rule_count(),
            ..ValidationReport::default()
        };

        for (idx, row) in rows.iter().enumerate() {
            let row_number = idx + 1;
            let record = apply_mapping(row, mapping);
            let mut row_invalid = false;

            for rule in self.rules.rules() {
                if !applies_to(rule, &record) {
                    continue;
                }

                if let Some(issue) = self.evaluate(rule, &record, row_number) {
                    if issue.severity == Severity::Error {
                        row_invalid = true;
                        report.errors.push(issue);
                    } else {
                        report.warnings.push(issue);
                    }
                }
            }

            if row_invalid {
                report.invalid_rows += 1;
            } else {
                report.valid_rows += 1;
            }
        }

        report
    }

    /// One rule against one mapped record; `Some` on failure
    pub fn evaluate(&self, rule: &ValidationRule, record: &Record, row: usize) -> Option<RowIssue> {
        let field = rule.field_name.as_str();
        let value = record.get(field);
        let blank = is_blank(value);
        let text = value.map(stringify).unwrap_or_default();

        let default_message: Option<String> = match &rule.definition {
            RuleDefinition::Required => blank.then(|| format!("{} is required", field)),

            RuleDefinition::Range { min, max } => match value.and_then(as_number) {
                None => Some(format!("{} must be a number", field)),
                Some(n) => {
                    let below = min.map_or(false, |m| n < m);
                    let above = max.map_or(false, |m| n > m);
                    (below || above).then(|| format!("{} must be {}", field, bounds_text(*min, *max)))
                }
            },

            RuleDefinition::Regex { pattern } => {
                if blank {
                    None
                } else {
                    match self.patterns.get(pattern) {
                        Some(Ok(re)) => (!re.is_match(&text))
                            .then(|| format!("{} does not match the expected pattern", field)),
                        Some(Err(e)) => Some(format!("invalid pattern '{}' for {}: {}", pattern, field, e)),
                        None => Some(format!("pattern '{}' for {} was not compiled", pattern, field)),
                    }
                }
            }

            RuleDefinition::Enum { values } => {
                if blank {
                    None
                } else {
                    (!values.iter().any(|v| v == text.trim()))
                        .then(|| format!("{} must be one of: {}", field, values.join(", ")))
                }
            }

            RuleDefinition::Length { min_length, max_length } => {
                if blank {
                    None
                } else {
                    let len = text.chars().count();
                    let short = min_length.map_or(false, |m| len < m);
                    let long = max_length.map_or(false, |m| len > m);
                    (short || long).then(|| {
                        format!("{} length must be {}", field, bounds_text(*min_length, *max_length))
                    })
                }
            }

            RuleDefinition::Format { format } => {
                if blank {
                    None
                } else {
                    (!check_format(*format, &text))
                        .then(|| format!("{} must be a valid {}", field, format_name(*format)))
                }
            }

            RuleDefinition::CrossField { condition } => match condition {
                CrossFieldCondition::RequiredIf { dependent_field } => {
                    let triggered = !is_blank(record.get(dependent_field.as_str()));
                    (triggered && blank).then(|| {
                        format!("{} is required when {} is provided", field, dependent_field)
                    })
                }
            },

            // Deferred: need the full dataset or an external lookup
            RuleDefinition::Unique | RuleDefinition::ForeignKey { .. } | RuleDefinition::Custom { .. } => None,
        };

        default_message.map(|fallback| RowIssue {
            row,
            field: field.to_string(),
            rule_type: rule.rule_type().to_string(),
            message: match &rule.error_message {
                Some(template) => render(template, field, &text, row),
                None => fallback,
            },
            severity: rule.severity,
            value: (!blank).then(|| text.clone()),
        })
    }
}

/// A rule runs when its field, or its cross-field dependency, is in the record
fn applies_to(rule: &ValidationRule, record: &Record) -> bool {
    record.contains_key(&rule.field_name)
        || rule
            .definition
            .dependency()
            .map_or(false, |dep| record.contains_key(dep))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Domain;
    use serde_json::json;

    fn rule(field: &str, definition: RuleDefinition) -> ValidationRule {
        ValidationRule::new(Domain::Products, field, definition)
    }

    fn identity_mapping(fields: &[&str]) -> BTreeMap<String, String> {
        fields.iter().map(|f| (f.to_string(), f.to_string())).collect()
    }

    fn row(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("row fixture must be an object"),
        }
    }

    fn engine(rules: Vec<ValidationRule>) -> ValidationEngine {
        ValidationEngine::new(RuleSet::from_rules(rules))
    }

    fn check(rule: ValidationRule, record: Value) -> Option<RowIssue> {
        let engine = engine(vec![rule.clone()]);
        engine.evaluate(&rule, &row(record), 1)
    }

    #[test]
    fn test_required() {
        let r = rule("name", RuleDefinition::Required);
        assert!(check(r.clone(), json!({"name": "Widget"})).is_none());
        assert!(check(r.clone(), json!({"name": "   "})).is_some());
        assert!(check(r.clone(), json!({"name": null})).is_some());
        assert!(check(r, json!({})).is_some());
    }

    #[test]
    fn test_range() {
        let r = rule("price", RuleDefinition::Range { min: Some(0.0), max: Some(100.0) });
        assert!(check(r.clone(), json!({"price": "42.5"})).is_none());
        assert!(check(r.clone(), json!({"price": 100})).is_none());

        // Blank is not a number
        let blank = check(r.clone(), json!({"price": ""})).unwrap();
        assert_eq!(blank.message, "price must be a number");
        assert!(check(r.clone(), json!({"price": null})).is_some());

        let not_numeric = check(r.clone(), json!({"price": "abc"})).unwrap();
        assert_eq!(not_numeric.message, "price must be a number");

        let too_high = check(r, json!({"price": "100.01"})).unwrap();
        assert_eq!(too_high.message, "price must be between 0 and 100");
    }

    #[test]
    fn test_regex_and_invalid_pattern() {
        let r = rule("code", RuleDefinition::Regex { pattern: "^[A-Z]{3}$".to_string() });
        assert!(check(r.clone(), json!({"code": "ABC"})).is_none());
        assert!(check(r.clone(), json!({"code": "abcd"})).is_some());
        assert!(check(r, json!({"code": ""})).is_none());

        let broken = rule("code", RuleDefinition::Regex { pattern: "([".to_string() });
        let issue = check(broken, json!({"code": "x"})).unwrap();
        assert!(issue.message.contains("invalid pattern"));
    }

    #[test]
    fn test_enum() {
        let r = rule(
            "status",
            RuleDefinition::Enum { values: vec!["active".to_string(), "retired".to_string()] },
        );
        assert!(check(r.clone(), json!({"status": "active"})).is_none());
        assert!(check(r.clone(), json!({"status": null})).is_none());
        assert!(check(r, json!({"status": "lost"})).is_some());
    }

    #[test]
    fn test_length_counts_chars() {
        let r = rule("code", RuleDefinition::Length { min_length: Some(2), max_length: Some(4) });
        assert!(check(r.clone(), json!({"code": "ñaño"})).is_none());
        assert!(check(r.clone(), json!({"code": "a"})).is_some());
        assert!(check(r.clone(), json!({"code": "abcde"})).is_some());
        assert!(check(r, json!({"code": ""})).is_none());
    }

    #[test]
    fn test_formats() {
        assert!(check_format(FormatKind::Email, "ops@example.com"));
        assert!(!check_format(FormatKind::Email, "ops@example"));
        assert!(check_format(FormatKind::Uuid, "67e55044-10b1-426f-9247-bb680e5fe0c8"));
        assert!(!check_format(FormatKind::Uuid, "67e55044"));
        assert!(check_format(FormatKind::Date, "2024-02-29"));
        assert!(check_format(FormatKind::Date, "01/15/2024"));
        assert!(check_format(FormatKind::Date, "2024-01-15T10:30:00Z"));
        assert!(!check_format(FormatKind::Date, "2023-02-29"));
        assert!(check_format(FormatKind::Phone, "+1 (555) 010-9999"));
        assert!(!check_format(FormatKind::Phone, "12-34"));
        assert!(check_format(FormatKind::Url, "https://example.com/a"));
        assert!(!check_format(FormatKind::Url, "example.com"));

        let r = rule("email", RuleDefinition::Format { format: FormatKind::Email });
        assert!(check(r, json!({"email": ""})).is_none());
    }

    #[test]
    fn test_cross_field_required_if() {
        let r = rule(
            "discount_end",
            RuleDefinition::CrossField {
                condition: CrossFieldCondition::RequiredIf { dependent_field: "discount".to_string() },
            },
        );

        assert!(check(r.clone(), json!({"discount": "10", "discount_end": ""})).is_some());
        assert!(check(r.clone(), json!({"discount": "", "discount_end": ""})).is_none());
        assert!(check(r.clone(), json!({"discount": "10", "discount_end": "2024-12-31"})).is_none());
        // Dependency present, guarded field not mapped at all
        assert!(check(r, json!({"discount": "10"})).is_some());
    }

    #[test]
    fn test_deferred_rules_always_pass() {
        assert!(check(rule("sku", RuleDefinition::Unique), json!({"sku": "dup"})).is_none());
        assert!(check(
            rule("vendor_id", RuleDefinition::ForeignKey { table: "vendors".into(), column: "id".into() }),
            json!({"vendor_id": "nope"})
        )
        .is_none());
        assert!(check(
            rule("x", RuleDefinition::Custom { name: "checksum".into(), params: json!({}) }),
            json!({"x": "1"})
        )
        .is_none());
    }

    #[test]
    fn test_message_template() {
        let r = rule("price", RuleDefinition::Range { min: Some(1.0), max: None })
            .with_message("Row {{row}}: {{field}} = '{{value}}' is too small");

        let issue = engine(vec![r.clone()]).evaluate(&r, &row(json!({"price": "0"})), 7).unwrap();
        assert_eq!(issue.message, "Row 7: price = '0' is too small");
        assert_eq!(issue.value.as_deref(), Some("0"));
    }

    #[test]
    fn test_report_counts_and_severity() {
        let engine = engine(vec![
            rule("name", RuleDefinition::Required).with_priority(1),
            rule("price", RuleDefinition::Range { min: Some(0.0), max: None }).with_priority(2),
            rule("status", RuleDefinition::Enum { values: vec!["active".into()] })
                .with_severity(Severity::Warning)
                .with_priority(3),
            // Not mapped: never evaluated
            rule("sku", RuleDefinition::Required).with_priority(4),
        ]);

        let rows = vec![
            row(json!({"name": "A", "price": "1", "status": "active"})),
            row(json!({"name": "", "price": "-1", "status": "active"})),
            row(json!({"name": "C", "price": "3", "status": "odd"})),
        ];

        let report = engine.validate(&rows, &identity_mapping(&["name", "price", "status"]));

        assert_eq!(report.total_rows, 3);
        assert_eq!(report.valid_rows, 2);
        assert_eq!(report.invalid_rows, 1);
        assert_eq!(report.rules_applied, 4);
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.errors[0].field, "name");
        assert_eq!(report.errors[1].field, "price");
        assert!(report.errors.iter().all(|e| e.row == 2));
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].row, 3);
        assert_eq!(report.invalid_row_numbers().into_iter().collect::<Vec<_>>(), vec![2]);

        let plan = ActionPlan::from_report(&report);
        assert_eq!(plan, ActionPlan { to_insert: 2, to_skip: 1 });
    }

    #[test]
    fn test_mapping_applied_before_rules() {
        let engine = engine(vec![rule("name", RuleDefinition::Required)]);
        let mut mapping = BTreeMap::new();
        mapping.insert("Product Name".to_string(), "name".to_string());

        let rows = vec![row(json!({"Product Name": "Widget"})), row(json!({"Other": "x"}))];
        let report = engine.validate(&rows, &mapping);

        assert_eq!(report.valid_rows, 1);
        assert_eq!(report.errors[0].row, 2);
    }

    #[test]
    fn test_validation_is_deterministic() {
        let engine = engine(vec![
            rule("name", RuleDefinition::Required),
            rule("price", RuleDefinition::Range { min: Some(0.0), max: Some(10.0) }),
        ]);
        let rows = vec![
            row(json!({"name": "", "price": "11"})),
            row(json!({"name": "B", "price": "x"})),
        ];
        let mapping = identity_mapping(&["name", "price"]);

        assert_eq!(engine.validate(&rows, &mapping), engine.validate(&rows, &mapping));
    }
}
