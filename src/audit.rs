// 📜 Import Audit Ledger - append-only, one entry per row touched
// Entries are ordered by a per-session sequence so replay doesn't depend on
// clock resolution.

use crate::db::{page_bounds, Page};
use crate::error::{ImportError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Insert,
    Update,
    Merge,
    Skip,
    Delete,
    Restore,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Insert => "insert",
            AuditAction::Update => "update",
            AuditAction::Merge => "merge",
            AuditAction::Skip => "skip",
            AuditAction::Delete => "delete",
            AuditAction::Restore => "restore",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(AuditAction::Insert),
            "update" => Ok(AuditAction::Update),
            "merge" => Ok(AuditAction::Merge),
            "skip" => Ok(AuditAction::Skip),
            "delete" => Ok(AuditAction::Delete),
            "restore" => Ok(AuditAction::Restore),
            other => Err(ImportError::InvalidRequest(format!("unknown audit action '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    /// 1-based position within the session's ledger
    pub seq: i64,
    pub session_id: String,
    pub action: AuditAction,
    pub target_table: String,
    pub record_id: Option<String>,
    pub before_state: Option<Value>,
    pub after_state: Option<Value>,
    /// 1-based source row
    pub row_number: usize,
    pub success: bool,
    pub error_message: Option<String>,
    pub executed_by: String,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Unsaved entry; `seq` is assigned on insert
    pub fn new(session_id: &str, action: AuditAction, target_table: &str, row_number: usize) -> Self {
        AuditEntry {
            id: uuid::Uuid::new_v4().to_string(),
            seq: 0,
            session_id: session_id.to_string(),
            action,
            target_table: target_table.to_string(),
            record_id: None,
            before_state: None,
            after_state: None,
            row_number,
            success: true,
            error_message: None,
            executed_by: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_record(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    pub fn with_after_state(mut self, state: Value) -> Self {
        self.after_state = Some(state);
        self
    }

    pub fn with_executor(mut self, executor: &str) -> Self {
        self.executed_by = executor.to_string();
        self
    }

    pub fn failed(mut self, message: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(message.into());
        self
    }

    /// Successful entry that still carries an explanation (skips)
    pub fn with_note(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditFilters {
    pub action: Option<AuditAction>,
    pub success: Option<bool>,
    pub target_table: Option<String>,
}

// ============================================================================
// STORE
// ============================================================================

/// Append one entry and return its sequence number
pub fn insert_audit_entry(conn: &Connection, entry: &AuditEntry) -> Result<i64> {
    let seq: i64 = conn.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM import_audit_logs WHERE session_id = ?1",
        params![entry.session_id],
        |row| row.get(0),
    )?;

    conn.execute(
        "INSERT INTO import_audit_logs (
            id, seq, session_id, action, target_table, record_id, before_state,
            after_state, row_number, success, error_message, executed_by, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            entry.id,
            seq,
            entry.session_id,
            entry.action.as_str(),
            entry.target_table,
            entry.record_id,
            entry.before_state.as_ref().map(serde_json::to_string).transpose()?,
            entry.after_state.as_ref().map(serde_json::to_string).transpose()?,
            entry.row_number as i64,
            entry.success,
            entry.error_message,
            entry.executed_by,
            entry.created_at.to_rfc3339(),
        ],
    )?;

    Ok(seq)
}

pub fn count_audit_entries(conn: &Connection, session_id: &str) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM import_audit_logs WHERE session_id = ?1",
        params![session_id],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Entries for one session in ledger order
pub fn query_audit_log(
    conn: &Connection,
    session_id: &str,
    filters: &AuditFilters,
    page: u32,
    limit: u32,
) -> Result<Page<AuditEntry>> {
    let (page, limit, offset) = page_bounds(page, limit);

    let mut where_sql = String::from("WHERE session_id = ?");
    let mut values: Vec<rusqlite::types::Value> = vec![session_id.to_string().into()];

    if let Some(action) = filters.action {
        where_sql.push_str(" AND action = ?");
        values.push(action.as_str().to_string().into());
    }
    if let Some(success) = filters.success {
        where_sql.push_str(" AND success = ?");
        values.push(i64::from(success).into());
    }
    if let Some(table) = &filters.target_table {
        where_sql.push_str(" AND target_table = ?");
        values.push(table.clone().into());
    }

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM import_audit_logs {}", where_sql),
        params_from_iter(values.iter()),
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(&format!(
        "SELECT id, seq, session_id, action, target_table, record_id, before_state,
                after_state, row_number, success, error_message, executed_by, created_at
         FROM import_audit_logs {}
         ORDER BY seq ASC
         LIMIT {} OFFSET {}",
        where_sql, limit, offset
    ))?;

    let raw = stmt
        .query_map(params_from_iter(values.iter()), AuditRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let items = raw
        .into_iter()
        .map(AuditRow::into_entry)
        .collect::<Result<Vec<_>>>()?;

    Ok(Page {
        items,
        total: total as u64,
        page,
        limit,
    })
}

/// Column values as stored, before JSON and enum decoding
struct AuditRow {
    id: String,
    seq: i64,
    session_id: String,
    action: String,
    target_table: String,
    record_id: Option<String>,
    before_state: Option<String>,
    after_state: Option<String>,
    row_number: i64,
    success: bool,
    error_message: Option<String>,
    executed_by: String,
    created_at: String,
}

impl AuditRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(AuditRow {
            id: row.get(0)?,
            seq: row.get(1)?,
            session_id: row.get(2)?,
            action: row.get(3)?,
            target_table: row.get(4)?,
            record_id: row.get(5)?,
            before_state: row.get(6)?,
            after_state: row.get(7)?,
            row_number: row.get(8)?,
            success: row.get(9)?,
            error_message: row.get(10)?,
            executed_by: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    fn into_entry(self) -> Result<AuditEntry> {
        let decode = |raw: Option<String>| -> Result<Option<Value>> {
            raw.map(|s| serde_json::from_str(&s).map_err(ImportError::from))
                .transpose()
        };

        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| ImportError::InvalidRequest(format!("bad audit timestamp: {}", e)))?;

        Ok(AuditEntry {
            id: self.id,
            seq: self.seq,
            session_id: self.session_id,
            action: self.action.parse()?,
            target_table: self.target_table,
            record_id: self.record_id,
            before_state: decode(self.before_state)?,
            after_state: decode(self.after_state)?,
            row_number: self.row_number.max(0) as usize,
            success: self.success,
            error_message: self.error_message,
            executed_by: self.executed_by,
            created_at,
        })
    }
}
