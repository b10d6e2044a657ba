// 📦 Import Session - the unit of work
// Indexed columns for filtering + the whole session as a JSON payload.
// Every status change goes through a compare-and-set on the stored status.

use crate::approval::Approval;
use crate::classifier::ClassificationResult;
use crate::db::{page_bounds, Page};
use crate::error::{ImportError, Result};
use crate::execution::ExecutionResult;
use crate::parser::{FileType, ParsedFile, Record};
use crate::schema::Domain;
use crate::state_machine::{self, Event};
use crate::validation::{ActionPlan, ValidationReport};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Uploaded,
    Classifying,
    Classified,
    Mapping,
    Mapped,
    Validating,
    Validated,
    ValidationFailed,
    AwaitingApproval,
    Approved,
    Rejected,
    Executing,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 16] = [
        SessionStatus::Uploaded,
        SessionStatus::Classifying,
        SessionStatus::Classified,
        SessionStatus::Mapping,
        SessionStatus::Mapped,
        SessionStatus::Validating,
        SessionStatus::Validated,
        SessionStatus::ValidationFailed,
        SessionStatus::AwaitingApproval,
        SessionStatus::Approved,
        SessionStatus::Rejected,
        SessionStatus::Executing,
        SessionStatus::Completed,
        SessionStatus::CompletedWithErrors,
        SessionStatus::Failed,
        SessionStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Uploaded => "UPLOADED",
            SessionStatus::Classifying => "CLASSIFYING",
            SessionStatus::Classified => "CLASSIFIED",
            SessionStatus::Mapping => "MAPPING",
            SessionStatus::Mapped => "MAPPED",
            SessionStatus::Validating => "VALIDATING",
            SessionStatus::Validated => "VALIDATED",
            SessionStatus::ValidationFailed => "VALIDATION_FAILED",
            SessionStatus::AwaitingApproval => "AWAITING_APPROVAL",
            SessionStatus::Approved => "APPROVED",
            SessionStatus::Rejected => "REJECTED",
            SessionStatus::Executing => "EXECUTING",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            SessionStatus::Failed => "FAILED",
            SessionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::CompletedWithErrors
                | SessionStatus::Failed
                | SessionStatus::Rejected
                | SessionStatus::Cancelled
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_uppercase();
        SessionStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| ImportError::InvalidRequest(format!("unknown session status '{}'", s)))
    }
}

// ============================================================================
// FILE DESCRIPTOR
// ============================================================================

/// Headers plus a bounded sample; the full file is never stored
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub headers: Vec<String>,
    pub sample_rows: Vec<Record>,
    /// Row count of the whole parsed file, not just the sample
    pub total_rows: usize,
}

impl FileMetadata {
    pub fn is_truncated(&self) -> bool {
        self.total_rows > self.sample_rows.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    pub file_type: FileType,
    /// SHA-256 of the uploaded bytes
    pub checksum: String,
    pub metadata: FileMetadata,
}

impl FileDescriptor {
    pub fn from_upload(
        name: &str,
        bytes: &[u8],
        file_type: FileType,
        parsed: ParsedFile,
        sample_size: usize,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);

        let total_rows = parsed.rows.len();
        let sample_rows = parsed.rows.into_iter().take(sample_size).collect();

        FileDescriptor {
            name: name.to_string(),
            size: bytes.len() as u64,
            file_type,
            checksum: format!("{:x}", hasher.finalize()),
            metadata: FileMetadata {
                headers: parsed.headers,
                sample_rows,
                total_rows,
            },
        }
    }
}

// ============================================================================
// IMPORT SESSION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSession {
    pub id: String,
    pub organization_id: String,
    pub domain: Option<Domain>,
    pub status: SessionStatus,
    pub file: FileDescriptor,

    #[serde(default)]
    pub classification: Option<ClassificationResult>,
    #[serde(default)]
    pub validation: Option<ValidationReport>,
    #[serde(default)]
    pub action_plan: Option<ActionPlan>,
    #[serde(default)]
    pub approval: Approval,
    #[serde(default)]
    pub execution: Option<ExecutionResult>,

    pub uploaded_by: String,
    #[serde(default)]
    pub status_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImportSession {
    pub fn new(
        organization_id: &str,
        uploaded_by: &str,
        file: FileDescriptor,
        domain: Option<Domain>,
    ) -> Self {
        let now = Utc::now();
        ImportSession {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: organization_id.to_string(),
            domain,
            status: SessionStatus::Uploaded,
            file,
            classification: None,
            validation: None,
            action_plan: None,
            approval: Approval::default(),
            execution: None,
            uploaded_by: uploaded_by.to_string(),
            status_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// New session value in the status `event` leads to; `self` is untouched
    pub fn transition(&self, event: Event) -> Result<ImportSession> {
        let status = state_machine::transition(self.status, event)?;
        let mut next = self.clone();
        next.status = status;
        next.updated_at = Utc::now();
        if status.is_terminal() && next.completed_at.is_none() {
            next.completed_at = Some(next.updated_at);
        }
        Ok(next)
    }

    /// Builder-style message setter on an owned value
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.status_message = Some(message.into());
        self
    }

    pub fn headers(&self) -> &[String] {
        &self.file.metadata.headers
    }

    pub fn sample_rows(&self) -> &[Record] {
        &self.file.metadata.sample_rows
    }

    pub fn confidence(&self) -> f64 {
        self.classification.as_ref().map_or(0.0, |c| c.confidence)
    }
}

// ============================================================================
// SESSION STORE
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionFilters {
    pub organization_id: Option<String>,
    pub status: Option<SessionStatus>,
    pub domain: Option<Domain>,
    pub uploaded_by: Option<String>,
}

pub fn insert_session(conn: &Connection, session: &ImportSession) -> Result<()> {
    conn.execute(
        "INSERT INTO import_sessions (
            id, organization_id, domain, status, uploaded_by, payload, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            session.id,
            session.organization_id,
            session.domain.map(|d| d.as_str()),
            session.status.as_str(),
            session.uploaded_by,
            serde_json::to_string(session)?,
            session.created_at.to_rfc3339(),
            session.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn find_session(conn: &Connection, id: &str) -> Result<Option<ImportSession>> {
    let payload: Option<String> = conn
        .query_row(
            "SELECT payload FROM import_sessions WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;

    payload
        .map(|p| serde_json::from_str(&p).map_err(ImportError::from))
        .transpose()
}

pub fn get_session(conn: &Connection, id: &str) -> Result<ImportSession> {
    find_session(conn, id)?.ok_or_else(|| ImportError::SessionNotFound(id.to_string()))
}

/// Persist `session` only if the stored status still equals `expected`.
///
/// This is the one write path for sessions after creation; losing the race
/// returns `ConcurrentModification` and writes nothing.
pub fn save_session(conn: &Connection, session: &ImportSession, expected: SessionStatus) -> Result<()> {
    let changed = conn.execute(
        "UPDATE import_sessions
         SET domain = ?1, status = ?2, payload = ?3, updated_at = ?4
         WHERE id = ?5 AND status = ?6",
        params![
            session.domain.map(|d| d.as_str()),
            session.status.as_str(),
            serde_json::to_string(session)?,
            session.updated_at.to_rfc3339(),
            session.id,
            expected.as_str(),
        ],
    )?;

    if changed == 1 {
        return Ok(());
    }

    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM import_sessions WHERE id = ?1)",
        params![session.id],
        |row| row.get(0),
    )?;

    if exists {
        Err(ImportError::ConcurrentModification {
            session_id: session.id.clone(),
            expected,
        })
    } else {
        Err(ImportError::SessionNotFound(session.id.clone()))
    }
}

/// Newest first
pub fn list_sessions(
    conn: &Connection,
    filters: &SessionFilters,
    page: u32,
    limit: u32,
) -> Result<Page<ImportSession>> {
    let (page, limit, offset) = page_bounds(page, limit);

    let mut clauses: Vec<&str> = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();

    if let Some(org) = &filters.organization_id {
        clauses.push("organization_id = ?");
        values.push(org.clone().into());
    }
    if let Some(status) = filters.status {
        clauses.push("status = ?");
        values.push(status.as_str().to_string().into());
    }
    if let Some(domain) = filters.domain {
        clauses.push("domain = ?");
        values.push(domain.as_str().to_string().into());
    }
    if let Some(uploader) = &filters.uploaded_by {
        clauses.push("uploaded_by = ?");
        values.push(uploader.clone().into());
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM import_sessions {}", where_sql),
        params_from_iter(values.iter()),
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(&format!(
        "SELECT payload FROM import_sessions {}
         ORDER BY created_at DESC, rowid DESC
         LIMIT {} OFFSET {}",
        where_sql, limit, offset
    ))?;

    let payloads = stmt
        .query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let items = payloads
        .iter()
        .map(|p| serde_json::from_str(p).map_err(ImportError::from))
        .collect::<Result<Vec<ImportSession>>>()?;

    Ok(Page {
        items,
        total: total as u64,
        page,
        limit,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;
    use serde_json::json;

    fn parsed(rows: usize) -> ParsedFile {
        let rows = (0..rows)
            .map(|i| match json!({"name": format!("item {}", i)}) {
                serde_json::Value::Object(map) => map,
                _ => unreachable!(),
            })
            .collect();
        ParsedFile::new(vec!["name".to_string()], rows)
    }

    fn session(org: &str) -> ImportSession {
        let file = FileDescriptor::from_upload("items.csv", b"name\nitem 0\n", FileType::Csv, parsed(1), 10);
        ImportSession::new(org, "alice", file, None)
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(SessionStatus::CompletedWithErrors.as_str(), "COMPLETED_WITH_ERRORS");
        assert_eq!(
            serde_json::to_string(&SessionStatus::AwaitingApproval).unwrap(),
            "\"AWAITING_APPROVAL\""
        );
        assert_eq!("validation_failed".parse::<SessionStatus>().unwrap(), SessionStatus::ValidationFailed);
        assert!(SessionStatus::Cancelled.is_terminal());
        assert!(!SessionStatus::Approved.is_terminal());
    }

    #[test]
    fn test_file_descriptor_samples_rows() {
        let file = FileDescriptor::from_upload("items.csv", b"abc", FileType::Csv, parsed(25), 10);

        assert_eq!(file.size, 3);
        assert_eq!(file.checksum.len(), 64);
        assert_eq!(file.metadata.sample_rows.len(), 10);
        assert_eq!(file.metadata.total_rows, 25);
        assert!(file.metadata.is_truncated());
    }

    #[test]
    fn test_transition_returns_new_value() {
        let original = session("org-1");
        let next = original.transition(Event::StartClassification).unwrap();

        assert_eq!(original.status, SessionStatus::Uploaded);
        assert_eq!(next.status, SessionStatus::Classifying);
        assert!(original.transition(Event::Approve).is_err());

        let cancelled = original.transition(Event::Cancel).unwrap();
        assert!(cancelled.completed_at.is_some());
    }

    #[test]
    fn test_store_roundtrip_and_compare_and_set() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let created = session("org-1");
        insert_session(&conn, &created).unwrap();
        assert_eq!(get_session(&conn, &created.id).unwrap(), created);

        let next = created.transition(Event::StartClassification).unwrap();
        save_session(&conn, &next, SessionStatus::Uploaded).unwrap();

        // Stale writer still believes the session is UPLOADED
        let stale = created.transition(Event::Cancel).unwrap();
        let err = save_session(&conn, &stale, SessionStatus::Uploaded).unwrap_err();
        assert!(matches!(err, ImportError::ConcurrentModification { .. }));
        assert_eq!(get_session(&conn, &created.id).unwrap().status, SessionStatus::Classifying);

        let ghost = session("org-1");
        assert!(matches!(
            save_session(&conn, &ghost, SessionStatus::Uploaded).unwrap_err(),
            ImportError::SessionNotFound(_)
        ));
        assert!(matches!(get_session(&conn, "missing"), Err(ImportError::SessionNotFound(_))));
    }

    #[test]
    fn test_list_sessions_filters_and_pages() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        for _ in 0..3 {
            insert_session(&conn, &session("org-1")).unwrap();
        }
        insert_session(&conn, &session("org-2")).unwrap();

        let filters = SessionFilters {
            organization_id: Some("org-1".to_string()),
            ..SessionFilters::default()
        };

        let first = list_sessions(&conn, &filters, 1, 2).unwrap();
        assert_eq!(first.total, 3);
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.total_pages(), 2);

        let second = list_sessions(&conn, &filters, 2, 2).unwrap();
        assert_eq!(second.items.len(), 1);

        let uploaded = SessionFilters {
            status: Some(SessionStatus::Uploaded),
            ..SessionFilters::default()
        };
        assert_eq!(list_sessions(&conn, &uploaded, 1, 50).unwrap().total, 4);

        let approved = SessionFilters {
            status: Some(SessionStatus::Approved),
            ..SessionFilters::default()
        };
        assert_eq!(list_sessions(&conn, &approved, 1, 50).unwrap().total, 0);
    }
}
