// Smart Import Engine - Core Library
// Exposes all modules for use in the CLI and tests

pub mod db;
pub mod error;
pub mod config;
pub mod parser;
pub mod schema;         // Schema Catalog - fields, synonyms, defaults
pub mod rules;          // Rule Store - typed, prioritized rules as data
pub mod classifier;     // Column Classifier - header → field mapping
pub mod validation;     // Validation Engine - report + action plan
pub mod state_machine;  // Session lifecycle table
pub mod approval;       // Approval Gate
pub mod session;        // Session entity + compare-and-set store
pub mod audit;          // Append-only import ledger
pub mod execution;      // Transactional row inserts
pub mod service;        // Operations exposed to callers

// Re-export commonly used types
pub use db::{open_database, setup_database, Page, MAX_PAGE_LIMIT};
pub use error::{ImportError, Result};
pub use config::EngineConfig;
pub use parser::{DefaultParser, FileParser, FileType, ParsedFile, Record};
pub use schema::{
    Domain, FieldDefinition, FieldType, SchemaDefinition, ValidationHints,
    find_active_schema, insert_schema_definition, list_active_schemas, load_schema_file,
    normalize_header,
};
pub use rules::{
    CrossFieldCondition, FormatKind, RuleDefinition, RuleSet, Severity, ValidationRule,
    find_active_rules, insert_rule, load_rule_file,
};
pub use classifier::{ClassificationResult, ColumnClassifier, DomainDetection};
pub use validation::{ActionPlan, RowIssue, ValidationEngine, ValidationReport};
pub use state_machine::{Event, allowed_from, next_status};
pub use approval::{Approval, ApprovalDecision, ApprovalGate, ApprovalStatus};
pub use session::{FileDescriptor, FileMetadata, ImportSession, SessionFilters, SessionStatus};
pub use audit::{AuditAction, AuditEntry, AuditFilters};
pub use execution::{ExecutionEngine, ExecutionResult, is_safe_identifier};
pub use service::ImportService;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
