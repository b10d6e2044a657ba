// ⚙️ Execution Engine - approved sample rows → target table
// One transaction per session, one savepoint per row. A bad row rolls back
// alone and is audited; anything that breaks the engine itself rolls back
// everything and the session ends FAILED.

use crate::audit::{insert_audit_entry, AuditAction, AuditEntry};
use crate::config::EngineConfig;
use crate::error::{ImportError, Result};
use crate::parser::Record;
use crate::schema::{FieldType, SchemaDefinition};
use crate::session::{save_session, ImportSession, SessionStatus};
use crate::state_machine::Event;
use crate::validation::{apply_mapping, as_number, is_blank, stringify};
use regex::Regex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, Statement};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::OnceLock;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
}

impl ExecutionResult {
    /// Terminal event for these counts
    pub fn final_event(&self) -> Event {
        if self.successful == 0 {
            Event::FailExecution
        } else if self.failed > 0 {
            Event::CompleteWithErrors
        } else {
            Event::Complete
        }
    }
}

fn identifier_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z_][a-z0-9_]{0,62}$").expect("static identifier pattern"))
}

/// Lowercase SQL identifier, at most 63 chars, never starting with a digit
pub fn is_safe_identifier(name: &str) -> bool {
    identifier_pattern().is_match(name)
}

// ============================================================================
// ROW PREPARATION
// ============================================================================

/// Columns written for `schema` under `mapping`, tenant column last
pub fn target_columns(schema: &SchemaDefinition, mapped: &BTreeSet<&str>, tenant_column: &str) -> Vec<String> {
    let mut columns: Vec<String> = schema
        .fields
        .iter()
        .filter(|f| f.name != tenant_column)
        .filter(|f| mapped.contains(f.name.as_str()) || f.default_value.is_some())
        .map(|f| f.name.clone())
        .collect();

    // Manually mapped fields the schema doesn't list still go to the table
    for name in mapped {
        if *name != tenant_column && schema.field(name).is_none() {
            columns.push(name.to_string());
        }
    }

    columns.push(tenant_column.to_string());
    columns
}

/// JSON value → SQLite value for a column of the given type
pub fn coerce_value(value: &Value, field_type: FieldType) -> SqlValue {
    match value {
        Value::Null => return SqlValue::Null,
        Value::String(s) if s.trim().is_empty() => return SqlValue::Null,
        _ => {}
    }

    match field_type {
        FieldType::Number => as_number(value)
            .map(SqlValue::Real)
            .unwrap_or_else(|| SqlValue::Text(stringify(value))),
        FieldType::Integer => match value {
            Value::Number(n) if n.is_i64() => n.as_i64().map_or(SqlValue::Null, SqlValue::Integer),
            _ => match as_number(value) {
                Some(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => SqlValue::Integer(n as i64),
                _ => SqlValue::Text(stringify(value)),
            },
        },
        FieldType::Boolean => match value {
            Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
            _ => match stringify(value).trim().to_lowercase().as_str() {
                "true" | "yes" | "1" => SqlValue::Integer(1),
                "false" | "no" | "0" => SqlValue::Integer(0),
                _ => SqlValue::Text(stringify(value)),
            },
        },
        FieldType::String | FieldType::Date | FieldType::Email | FieldType::Json => {
            SqlValue::Text(stringify(value))
        }
    }
}

/// Values for one mapped record in `columns` order; empty cells take the field default
fn row_values(
    record: &Record,
    columns: &[String],
    schema: &SchemaDefinition,
    organization_id: &str,
) -> Vec<SqlValue> {
    let (tenant, fields) = columns.split_last().map_or((None, columns), |(t, f)| (Some(t), f));

    let mut values: Vec<SqlValue> = fields
        .iter()
        .map(|column| {
            let definition = schema.field(column);
            let field_type = definition.map_or(FieldType::String, |d| d.field_type);
            let value = record.get(column);

            if is_blank(value) {
                definition
                    .and_then(|d| d.default_value.as_ref())
                    .map_or(SqlValue::Null, |d| coerce_value(d, field_type))
            } else {
                value.map_or(SqlValue::Null, |v| coerce_value(v, field_type))
            }
        })
        .collect();

    if tenant.is_some() {
        values.push(SqlValue::Text(organization_id.to_string()));
    }
    values
}

fn sql_to_json(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::from(*i),
        SqlValue::Real(f) => Value::from(*f),
        SqlValue::Text(s) => Value::String(s.clone()),
        SqlValue::Blob(b) => Value::from(b.len()),
    }
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct ExecutionEngine<'a> {
    conn: &'a Connection,
    config: &'a EngineConfig,
}

/// Everything one run needs, resolved up front
struct Plan<'s> {
    session: &'s ImportSession,
    schema: &'s SchemaDefinition,
    columns: Vec<String>,
    skip_rows: BTreeSet<usize>,
    executor: String,
}

impl<'a> ExecutionEngine<'a> {
    pub fn new(conn: &'a Connection, config: &'a EngineConfig) -> Self {
        ExecutionEngine { conn, config }
    }

    /// Run an EXECUTING session to its terminal status and persist it.
    ///
    /// Row failures and engine faults both end up on the returned session;
    /// only a failure to record the outcome itself is returned as `Err`.
    pub fn run(&self, session: &ImportSession, schema: &SchemaDefinition) -> Result<ImportSession> {
        let started = Instant::now();

        let plan = match self.plan(session, schema) {
            Ok(plan) => plan,
            Err(e) => return self.fail(session, e, started),
        };

        info!(
            session_id = %session.id,
            table = %schema.table_name,
            rows = session.sample_rows().len(),
            skipped = plan.skip_rows.len(),
            "Executing import"
        );

        match self.run_transaction(&plan, started) {
            Ok(finished) => Ok(finished),
            Err(e) => self.fail(session, e, started),
        }
    }

    /// End an EXECUTING session FAILED before any row is attempted
    pub fn abort(&self, session: &ImportSession, error: ImportError) -> Result<ImportSession> {
        self.fail(session, error, Instant::now())
    }

    fn plan<'s>(&self, session: &'s ImportSession, schema: &'s SchemaDefinition) -> Result<Plan<'s>> {
        let classification = session.classification.as_ref().ok_or_else(|| {
            ImportError::InvalidMapping("session has no column mapping".to_string())
        })?;

        let mapped: BTreeSet<&str> = classification.column_mapping.values().map(String::as_str).collect();
        let columns = target_columns(schema, &mapped, &self.config.tenant_column);

        if !is_safe_identifier(&schema.table_name) {
            return Err(ImportError::UnsafeIdentifier(schema.table_name.clone()));
        }
        if let Some(bad) = columns.iter().find(|c| !is_safe_identifier(c)) {
            return Err(ImportError::UnsafeIdentifier(bad.clone()));
        }

        let skip_rows = session
            .validation
            .as_ref()
            .map(|report| report.invalid_row_numbers())
            .unwrap_or_default();

        let executor = session
            .approval
            .approved_by
            .clone()
            .unwrap_or_else(|| self.config.executor.clone());

        Ok(Plan {
            session,
            schema,
            columns,
            skip_rows,
            executor,
        })
    }

    fn run_transaction(&self, plan: &Plan<'_>, started: Instant) -> Result<ImportSession> {
        let tx = self.conn.unchecked_transaction()?;

        let mut result = {
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                plan.schema.table_name,
                plan.columns.join(", "),
                (1..=plan.columns.len()).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ")
            );
            let mut stmt = tx.prepare(&sql)?;
            self.insert_rows(&tx, &mut stmt, plan)?
        };

        result.duration_ms = started.elapsed().as_millis() as u64;
        let finished = self.finish(plan.session, result)?;
        save_session(&tx, &finished, SessionStatus::Executing)?;
        tx.commit()?;

        info!(
            session_id = %finished.id,
            status = %finished.status,
            successful = finished.execution.as_ref().map_or(0, |r| r.successful),
            failed = finished.execution.as_ref().map_or(0, |r| r.failed),
            "Import finished"
        );
        Ok(finished)
    }

    fn insert_rows(&self, conn: &Connection, stmt: &mut Statement<'_>, plan: &Plan<'_>) -> Result<ExecutionResult> {
        let session = plan.session;
        let table = plan.schema.table_name.as_str();
        let mut result = ExecutionResult {
            total: session.sample_rows().len(),
            ..ExecutionResult::default()
        };

        let mapping = session
            .classification
            .as_ref()
            .map(|c| c.column_mapping.clone())
            .unwrap_or_default();

        for (idx, row) in session.sample_rows().iter().enumerate() {
            let row_number = idx + 1;
            let entry = AuditEntry::new(&session.id, AuditAction::Insert, table, row_number)
                .with_executor(&plan.executor);

            if plan.skip_rows.contains(&row_number) {
                let errors = session
                    .validation
                    .as_ref()
                    .map_or(0, |r| r.issues_for_row(row_number).len());
                let skip = AuditEntry { action: AuditAction::Skip, ..entry }
                    .with_note(format!("row skipped: {} validation error(s)", errors));
                insert_audit_entry(conn, &skip)?;
                result.skipped += 1;
                continue;
            }

            let record = apply_mapping(row, &mapping);
            let values = row_values(&record, &plan.columns, plan.schema, &session.organization_id);
            let after_state: Record = plan
                .columns
                .iter()
                .zip(values.iter())
                .map(|(c, v)| (c.clone(), sql_to_json(v)))
                .collect();

            conn.execute_batch("SAVEPOINT import_row")?;
            match stmt.execute(params_from_iter(values.iter())) {
                Ok(_) => {
                    conn.execute_batch("RELEASE import_row")?;
                    let entry = entry
                        .with_record(conn.last_insert_rowid().to_string())
                        .with_after_state(Value::Object(after_state));
                    insert_audit_entry(conn, &entry)?;
                    result.successful += 1;
                }
                Err(e) => {
                    conn.execute_batch("ROLLBACK TO import_row; RELEASE import_row")?;
                    debug!(session_id = %session.id, row = row_number, error = %e, "Row rejected");
                    insert_audit_entry(conn, &entry.failed(e.to_string()))?;
                    result.failed += 1;
                }
            }
        }

        Ok(result)
    }

    fn finish(&self, session: &ImportSession, result: ExecutionResult) -> Result<ImportSession> {
        let message = format!(
            "{} inserted, {} failed, {} skipped",
            result.successful, result.failed, result.skipped
        );
        let mut finished = session.transition(result.final_event())?.with_message(message);
        finished.execution = Some(result);
        Ok(finished)
    }

    /// Engine-level fault: nothing was committed; record the error and end FAILED
    fn fail(&self, session: &ImportSession, error: ImportError, started: Instant) -> Result<ImportSession> {
        warn!(session_id = %session.id, error = %error, "Import execution failed");

        let mut failed = session
            .transition(Event::FailExecution)?
            .with_message(format!("execution failed: {}", error));
        failed.execution = Some(ExecutionResult {
            total: session.sample_rows().len(),
            duration_ms: started.elapsed().as_millis() as u64,
            fatal_error: Some(error.to_string()),
            ..ExecutionResult::default()
        });

        save_session(self.conn, &failed, SessionStatus::Executing)?;
        Ok(failed)
    }
}
