// 🧭 Import Service - the operations callers drive a session through
// Each operation: load → check the transition chain → compute → compare-and-set.
// Short steps persist only their outcome; execution persists EXECUTING first
// so a second executor loses the race.

use crate::approval::{Approval, ApprovalDecision, ApprovalGate};
use crate::audit::{query_audit_log, AuditEntry, AuditFilters};
use crate::classifier::ColumnClassifier;
use crate::config::EngineConfig;
use crate::db::{setup_database, Page};
use crate::error::{ImportError, Result};
use crate::execution::ExecutionEngine;
use crate::parser::{DefaultParser, FileParser, FileType};
use crate::rules::{find_active_rules, insert_rule, ValidationRule};
use crate::schema::{find_active_schema, insert_schema_definition, list_active_schemas, Domain, SchemaDefinition};
use crate::session::{
    self, get_session, insert_session, save_session, FileDescriptor, ImportSession, SessionFilters,
};
use crate::state_machine::Event;
use crate::validation::{ActionPlan, ValidationEngine};
use rusqlite::Connection;
use std::collections::BTreeMap;
use tracing::{info, warn};

pub struct ImportService {
    conn: Connection,
    config: EngineConfig,
    parser: Box<dyn FileParser>,
}

impl ImportService {
    /// Wrap a connection, creating the engine tables if needed
    pub fn new(conn: Connection, config: EngineConfig) -> Result<Self> {
        setup_database(&conn)?;
        Ok(ImportService {
            conn,
            config,
            parser: Box::new(DefaultParser::new()),
        })
    }

    /// Swap the upload parser (spreadsheet support lives outside the crate)
    pub fn with_parser(mut self, parser: Box<dyn FileParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // CATALOG ADMINISTRATION
    // ========================================================================

    pub fn register_schema(&self, schema: &SchemaDefinition) -> Result<i64> {
        insert_schema_definition(&self.conn, schema)
    }

    pub fn register_rule(&self, rule: &ValidationRule) -> Result<i64> {
        insert_rule(&self.conn, rule)
    }

    // ========================================================================
    // UPLOAD
    // ========================================================================

    /// Parse an upload and store a new UPLOADED session
    pub fn create_session(
        &self,
        organization_id: &str,
        uploaded_by: &str,
        file_name: &str,
        bytes: &[u8],
        domain: Option<Domain>,
    ) -> Result<ImportSession> {
        if organization_id.trim().is_empty() {
            return Err(ImportError::InvalidRequest("organization id is required".to_string()));
        }

        let file_type = FileType::from_file_name(file_name).ok_or_else(|| {
            ImportError::InvalidRequest(format!("unsupported file type: {}", file_name))
        })?;

        let parsed = self
            .parser
            .parse(bytes, file_type)
            .map_err(|e| ImportError::InvalidRequest(format!("{:#}", e)))?;

        let file = FileDescriptor::from_upload(file_name, bytes, file_type, parsed, self.config.sample_size);
        if file.metadata.is_truncated() {
            warn!(
                file = %file_name,
                total_rows = file.metadata.total_rows,
                sample_rows = file.metadata.sample_rows.len(),
                "Upload exceeds sample size; only the sample will be validated and imported"
            );
        }

        let session = ImportSession::new(organization_id, uploaded_by, file, domain);
        insert_session(&self.conn, &session)?;

        info!(
            session_id = %session.id,
            organization_id = %session.organization_id,
            file_type = %file_type,
            rows = session.file.metadata.total_rows,
            "Import session created"
        );
        Ok(session)
    }

    // ========================================================================
    // CLASSIFY / MAP
    // ========================================================================

    /// Resolve the domain and map headers to fields.
    ///
    /// Domain resolution order: `override_domain`, the session's domain, then
    /// auto-detection. When nothing resolves, or the domain has no active
    /// schema, the session goes back to UPLOADED with a message.
    pub fn classify_session(
        &self,
        session_id: &str,
        override_domain: Option<Domain>,
        manual_mapping: Option<&BTreeMap<String, String>>,
    ) -> Result<ImportSession> {
        let current = get_session(&self.conn, session_id)?;
        let classifying = current.transition(Event::StartClassification)?;
        let classifier = ColumnClassifier::new(self.config.detection_threshold);

        let domain = match override_domain.or(current.domain) {
            Some(domain) => Some(domain),
            None => {
                let schemas = list_active_schemas(&self.conn)?;
                classifier
                    .detect_domain(current.headers(), &schemas)
                    .map(|detection| detection.domain)
            }
        };

        let Some(domain) = domain else {
            return self.revert_classification(&current, classifying, "could not detect a domain from the file headers".to_string());
        };

        let Some(schema) = find_active_schema(&self.conn, domain)? else {
            return self.revert_classification(&current, classifying, format!("no active schema for domain '{}'", domain));
        };

        let result = match manual_mapping {
            Some(mapping) => classifier.apply_manual_mapping(current.headers(), domain, mapping)?,
            None => classifier.classify(current.headers(), &schema),
        };

        let mut classified = classifying.transition(Event::FinishClassification)?;
        classified.domain = Some(domain);
        classified.status_message = None;
        classified.validation = None;
        classified.action_plan = None;
        classified.classification = Some(result);

        save_session(&self.conn, &classified, current.status)?;

        info!(
            session_id = %classified.id,
            domain = %domain,
            confidence = classified.confidence(),
            "Session classified"
        );
        Ok(classified)
    }

    fn revert_classification(
        &self,
        current: &ImportSession,
        classifying: ImportSession,
        message: String,
    ) -> Result<ImportSession> {
        warn!(session_id = %current.id, reason = %message, "Classification reverted");
        let mut reverted = classifying
            .transition(Event::RevertClassification)?
            .with_message(message);
        reverted.classification = None;
        reverted.validation = None;
        reverted.action_plan = None;
        save_session(&self.conn, &reverted, current.status)?;
        Ok(reverted)
    }

    /// Replace the column mapping; any earlier validation is discarded
    pub fn update_mapping(&self, session_id: &str, mapping: &BTreeMap<String, String>) -> Result<ImportSession> {
        let current = get_session(&self.conn, session_id)?;
        let mapping_state = current.transition(Event::StartMapping)?;

        let domain = current
            .domain
            .or_else(|| current.classification.as_ref().map(|c| c.detected_domain))
            .ok_or_else(|| ImportError::InvalidMapping("session has no domain".to_string()))?;

        let result = ColumnClassifier::new(self.config.detection_threshold)
            .apply_manual_mapping(current.headers(), domain, mapping)?;

        let mut mapped = mapping_state.transition(Event::FinishMapping)?;
        mapped.classification = Some(result);
        mapped.validation = None;
        mapped.action_plan = None;
        mapped.status_message = None;

        save_session(&self.conn, &mapped, current.status)?;
        info!(session_id = %mapped.id, columns = mapping.len(), "Mapping updated");
        Ok(mapped)
    }

    // ========================================================================
    // VALIDATE
    // ========================================================================

    /// Run the domain's active rules over the sample
    pub fn validate_session(&self, session_id: &str) -> Result<ImportSession> {
        let current = get_session(&self.conn, session_id)?;
        let validating = current.transition(Event::StartValidation)?;

        let classification = current
            .classification
            .as_ref()
            .ok_or_else(|| ImportError::InvalidMapping("session has no column mapping".to_string()))?;
        let domain = current.domain.unwrap_or(classification.detected_domain);

        if current.file.metadata.is_truncated() {
            warn!(
                session_id = %current.id,
                total_rows = current.file.metadata.total_rows,
                sample_rows = current.sample_rows().len(),
                "Validating sample only"
            );
        }

        let engine = ValidationEngine::new(find_active_rules(&self.conn, domain)?);
        let report = engine.validate(current.sample_rows(), &classification.column_mapping);

        let event = if report.valid_rows == 0 {
            Event::FailValidation
        } else {
            Event::PassValidation
        };

        let message = format!(
            "{} valid, {} invalid, {} warning(s)",
            report.valid_rows,
            report.invalid_rows,
            report.warnings.len()
        );
        let mut validated = validating.transition(event)?.with_message(message);
        validated.action_plan = Some(ActionPlan::from_report(&report));
        validated.validation = Some(report);

        save_session(&self.conn, &validated, current.status)?;
        info!(
            session_id = %validated.id,
            status = %validated.status,
            errors = validated.validation.as_ref().map_or(0, |r| r.error_count()),
            "Session validated"
        );
        Ok(validated)
    }

    // ========================================================================
    // APPROVAL
    // ========================================================================

    /// Auto-approve a clean, confident session; otherwise queue it for review
    pub fn submit_for_approval(&self, session_id: &str) -> Result<ImportSession> {
        let current = get_session(&self.conn, session_id)?;

        let error_count = current.validation.as_ref().map_or(0, |r| r.error_count());
        let gate = ApprovalGate::new(self.config.auto_approve_threshold);

        let submitted = match gate.decide(current.confidence(), error_count) {
            ApprovalDecision::AutoApprove => {
                let mut approved = current.transition(Event::AutoApprove)?;
                approved.approval = Approval::auto(approved.updated_at);
                approved
            }
            ApprovalDecision::ManualReview => current.transition(Event::SubmitForApproval)?,
        };

        save_session(&self.conn, &submitted, current.status)?;
        info!(session_id = %submitted.id, status = %submitted.status, "Submitted for approval");
        Ok(submitted)
    }

    /// Approve a queued session, then execute it unless `auto_execute` is false
    pub fn approve_session(&self, session_id: &str, approver: &str, auto_execute: bool) -> Result<ImportSession> {
        if approver.trim().is_empty() {
            return Err(ImportError::InvalidRequest("approver is required".to_string()));
        }

        let current = get_session(&self.conn, session_id)?;
        let mut approved = current.transition(Event::Approve)?;
        approved.approval = Approval::approved(approver, approved.updated_at);

        save_session(&self.conn, &approved, current.status)?;
        info!(session_id = %approved.id, approver = %approver, "Session approved");

        if auto_execute {
            self.execute_session(session_id)
        } else {
            Ok(approved)
        }
    }

    /// Reject a queued session; a reason is mandatory
    pub fn reject_session(&self, session_id: &str, approver: &str, reason: &str) -> Result<ImportSession> {
        let current = get_session(&self.conn, session_id)?;
        if reason.trim().is_empty() {
            return Err(ImportError::InvalidRequest("a rejection reason is required".to_string()));
        }

        let mut rejected = current
            .transition(Event::Reject)?
            .with_message(format!("rejected: {}", reason.trim()));
        rejected.approval = Approval::rejected(approver, reason.trim(), rejected.updated_at);

        save_session(&self.conn, &rejected, current.status)?;
        info!(session_id = %rejected.id, approver = %approver, "Session rejected");
        Ok(rejected)
    }

    // ========================================================================
    // EXECUTE / CANCEL
    // ========================================================================

    /// Write the approved sample to the domain's table
    pub fn execute_session(&self, session_id: &str) -> Result<ImportSession> {
        let current = get_session(&self.conn, session_id)?;

        let mut executing = current.transition(Event::StartExecution)?;
        executing.started_at = Some(executing.updated_at);
        executing.status_message = None;
        save_session(&self.conn, &executing, current.status)?;

        let engine = ExecutionEngine::new(&self.conn, &self.config);
        // From here on every failure must end the session FAILED
        let schema = match executing.domain {
            Some(domain) => find_active_schema(&self.conn, domain).and_then(|found| {
                found.ok_or_else(|| ImportError::SchemaNotFound(domain.to_string()))
            }),
            None => Err(ImportError::SchemaNotFound("(none)".to_string())),
        };

        match schema {
            Ok(schema) => engine.run(&executing, &schema),
            Err(e) => engine.abort(&executing, e),
        }
    }

    /// Abandon a session that hasn't started executing
    pub fn cancel_session(&self, session_id: &str, actor: &str, reason: Option<&str>) -> Result<ImportSession> {
        let current = get_session(&self.conn, session_id)?;

        let message = match reason.map(str::trim).filter(|r| !r.is_empty()) {
            Some(reason) => format!("cancelled by {}: {}", actor, reason),
            None => format!("cancelled by {}", actor),
        };
        let cancelled = current.transition(Event::Cancel)?.with_message(message);

        save_session(&self.conn, &cancelled, current.status)?;
        info!(session_id = %cancelled.id, actor = %actor, "Session cancelled");
        Ok(cancelled)
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn get_session(&self, session_id: &str) -> Result<ImportSession> {
        get_session(&self.conn, session_id)
    }

    pub fn list_sessions(&self, filters: &SessionFilters, page: u32, limit: u32) -> Result<Page<ImportSession>> {
        session::list_sessions(&self.conn, filters, page, limit)
    }

    pub fn get_audit_log(
        &self,
        session_id: &str,
        filters: &AuditFilters,
        page: u32,
        limit: u32,
    ) -> Result<Page<AuditEntry>> {
        get_session(&self.conn, session_id)?;
        query_audit_log(&self.conn, session_id, filters, page, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{RuleDefinition, Severity};
    use crate::schema::{FieldDefinition, FieldType};
    use crate::session::SessionStatus;

    fn service() -> ImportService {
        let svc = ImportService::new(Connection::open_in_memory().unwrap(), EngineConfig::default()).unwrap();
        svc.register_schema(
            &SchemaDefinition::new(Domain::Products, "products")
                .with_field(
                    FieldDefinition::new("name", FieldType::String)
                        .required()
                        .with_synonym("product name"),
                )
                .with_field(FieldDefinition::new("price", FieldType::Number).required()),
        )
        .unwrap();
        svc.register_rule(&ValidationRule::new(Domain::Products, "name", RuleDefinition::Required))
            .unwrap();
        svc.register_rule(
            &ValidationRule::new(
                Domain::Products,
                "price",
                RuleDefinition::Range { min: Some(0.0), max: None },
            )
            .with_severity(Severity::Warning),
        )
        .unwrap();
        svc.connection()
            .execute_batch(
                "CREATE TABLE products (
                    id INTEGER PRIMARY KEY,
                    organization_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    price REAL
                )",
            )
            .unwrap();
        svc
    }

    #[test]
    fn test_clean_upload_runs_to_completion() {
        let svc = service();
        let session = svc
            .create_session("org-1", "alice", "p.csv", b"Product Name,Price\nWidget,9.99\nGadget,5\n", None)
            .unwrap();
        assert_eq!(session.status, SessionStatus::Uploaded);

        let classified = svc.classify_session(&session.id, None, None).unwrap();
        assert_eq!(classified.status, SessionStatus::Classified);
        assert_eq!(classified.domain, Some(Domain::Products));
        assert_eq!(classified.confidence(), 100.0);

        let validated = svc.validate_session(&session.id).unwrap();
        assert_eq!(validated.status, SessionStatus::Validated);
        assert_eq!(validated.action_plan, Some(ActionPlan { to_insert: 2, to_skip: 0 }));

        let approved = svc.submit_for_approval(&session.id).unwrap();
        assert_eq!(approved.status, SessionStatus::Approved);
        assert_eq!(approved.approval.status, crate::approval::ApprovalStatus::AutoApproved);

        let done = svc.execute_session(&session.id).unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert!(done.started_at.is_some());
    }

    #[test]
    fn test_classify_reverts_when_nothing_matches() {
        let svc = service();
        let session = svc
            .create_session("org-1", "alice", "x.csv", b"foo,bar\n1,2\n", None)
            .unwrap();

        let reverted = svc.classify_session(&session.id, None, None).unwrap();
        assert_eq!(reverted.status, SessionStatus::Uploaded);
        assert!(reverted.status_message.is_some());
        assert!(reverted.classification.is_none());

        // A domain with no schema also reverts
        let reverted = svc.classify_session(&session.id, Some(Domain::Users), None).unwrap();
        assert_eq!(reverted.status, SessionStatus::Uploaded);
    }

    #[test]
    fn test_low_confidence_waits_for_review_then_rejects() {
        let svc = service();
        let session = svc
            .create_session("org-1", "alice", "p.csv", b"Product Name,Cost\nWidget,9.99\n", None)
            .unwrap();

        let classified = svc.classify_session(&session.id, Some(Domain::Products), None).unwrap();
        assert_eq!(classified.confidence(), 50.0);

        svc.validate_session(&session.id).unwrap();
        let queued = svc.submit_for_approval(&session.id).unwrap();
        assert_eq!(queued.status, SessionStatus::AwaitingApproval);

        let err = svc.reject_session(&session.id, "bob", "  ").unwrap_err();
        assert!(matches!(err, ImportError::InvalidRequest(_)));
        assert_eq!(svc.get_session(&session.id).unwrap().status, SessionStatus::AwaitingApproval);

        let rejected = svc.reject_session(&session.id, "bob", "wrong file").unwrap();
        assert_eq!(rejected.status, SessionStatus::Rejected);
        assert_eq!(rejected.approval.rejection_reason.as_deref(), Some("wrong file"));
    }

    #[test]
    fn test_update_mapping_recovers_failed_validation() {
        let svc = service();
        let session = svc
            .create_session(
                "org-1",
                "alice",
                "p.csv",
                b"Product Name,Title,Price\n,Widget,3\n",
                Some(Domain::Products),
            )
            .unwrap();

        svc.classify_session(&session.id, None, None).unwrap();
        let failed = svc.validate_session(&session.id).unwrap();
        assert_eq!(failed.status, SessionStatus::ValidationFailed);

        let mut mapping = BTreeMap::new();
        mapping.insert("Title".to_string(), "name".to_string());
        mapping.insert("Price".to_string(), "price".to_string());
        let mapped = svc.update_mapping(&session.id, &mapping).unwrap();
        assert_eq!(mapped.status, SessionStatus::Mapped);
        assert!(mapped.validation.is_none());

        let validated = svc.validate_session(&session.id).unwrap();
        assert_eq!(validated.status, SessionStatus::Validated);
    }

    #[test]
    fn test_unsupported_upload_is_rejected() {
        let svc = service();
        let err = svc
            .create_session("org-1", "alice", "p.xlsx", b"PK", None)
            .unwrap_err();
        assert!(matches!(err, ImportError::InvalidRequest(_)));

        let err = svc.create_session("org-1", "alice", "p.pdf", b"%PDF", None).unwrap_err();
        assert!(matches!(err, ImportError::InvalidRequest(_)));
    }
}
