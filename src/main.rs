use anyhow::{bail, Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use smart_import::{
    load_rule_file, load_schema_file, open_database, AuditFilters, Domain, EngineConfig,
    ImportService, ImportSession, SessionFilters, SessionStatus,
};

const DEFAULT_DATABASE: &str = "smart_import.db";
const DEFAULT_ORGANIZATION: &str = "default";

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "smart_import=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");
    let rest = args.get(2..).unwrap_or(&[]);

    match command {
        "seed" => run_seed(rest),
        "import" => run_import(rest),
        "approve" => run_approve(rest),
        "reject" => run_reject(rest),
        "cancel" => run_cancel(rest),
        "status" => run_status(rest),
        "list" => run_list(rest),
        "audit" => run_audit(rest),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("smart-import {}", smart_import::VERSION);
    println!();
    println!("USAGE:");
    println!("  smart-import seed <schemas.json> <rules.json> [tables.sql]");
    println!("  smart-import import <file> [--org ORG] [--user USER] [--domain DOMAIN] [--approve]");
    println!("  smart-import approve <session-id> <approver>");
    println!("  smart-import reject <session-id> <approver> <reason>");
    println!("  smart-import cancel <session-id> <actor> [reason]");
    println!("  smart-import status <session-id>");
    println!("  smart-import list [--org ORG] [--status STATUS] [--page N]");
    println!("  smart-import audit <session-id> [--page N]");
    println!();
    println!("Database path comes from IMPORT_DATABASE (default: {})", DEFAULT_DATABASE);
}

fn database_path() -> PathBuf {
    env::var("IMPORT_DATABASE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATABASE))
}

fn open_service() -> Result<ImportService> {
    let path = database_path();
    let conn = open_database(&path)?;
    let config = EngineConfig::from_env()?;
    ImportService::new(conn, config).context("Failed to initialize import service")
}

/// Value following `--name`, if present
fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn has_flag(args: &[String], name: &str) -> bool {
    args.iter().any(|a| a == name)
}

fn positional<'a>(args: &'a [String], index: usize, what: &str) -> Result<&'a str> {
    match args.get(index) {
        Some(value) if !value.starts_with("--") => Ok(value.as_str()),
        _ => bail!("Missing argument: {}", what),
    }
}

fn page_flag(args: &[String]) -> Result<u32> {
    flag_value(args, "--page")
        .map(|p| p.parse::<u32>().with_context(|| format!("--page must be a number, got {:?}", p)))
        .transpose()
        .map(|p| p.unwrap_or(1))
}

fn print_session(session: &ImportSession) {
    println!("  Session:  {}", session.id);
    println!("  Status:   {}", session.status);
    if let Some(domain) = session.domain {
        println!("  Domain:   {}", domain);
    }
    if let Some(classification) = &session.classification {
        println!("  Confidence: {:.1}%", classification.confidence);
        for (header, field) in &classification.column_mapping {
            println!("    {} → {}", header, field);
        }
        if !classification.unmapped_columns.is_empty() {
            println!("    unmapped: {}", classification.unmapped_columns.join(", "));
        }
    }
    if let Some(report) = &session.validation {
        println!(
            "  Validation: {} valid, {} invalid, {} warning(s)",
            report.valid_rows,
            report.invalid_rows,
            report.warnings.len()
        );
        for issue in report.errors.iter().take(10) {
            println!("    ❌ {}", issue.message);
        }
    }
    if let Some(result) = &session.execution {
        println!(
            "  Execution: {} inserted, {} failed, {} skipped in {} ms",
            result.successful, result.failed, result.skipped, result.duration_ms
        );
        if let Some(fatal) = &result.fatal_error {
            println!("    ⚠️  {}", fatal);
        }
    }
    if let Some(message) = &session.status_message {
        println!("  Message:  {}", message);
    }
}

// ============================================================================
// COMMANDS
// ============================================================================

fn run_seed(args: &[String]) -> Result<()> {
    let schemas_path = positional(args, 0, "schemas.json")?;
    let rules_path = positional(args, 1, "rules.json")?;
    let service = open_service()?;

    println!("🌱 Seeding catalog into {:?}", database_path());

    let mut schema_count = 0;
    for schema in load_schema_file(schemas_path)? {
        match service.register_schema(&schema) {
            Ok(_) => schema_count += 1,
            Err(e) => tracing::warn!(domain = %schema.domain, error = %e, "Schema not registered"),
        }
    }
    println!("✓ {} schema definition(s) registered", schema_count);

    let mut rule_count = 0;
    for rule in load_rule_file(rules_path)? {
        match service.register_rule(&rule) {
            Ok(_) => rule_count += 1,
            Err(e) => tracing::warn!(field = %rule.field_name, error = %e, "Rule not registered"),
        }
    }
    println!("✓ {} validation rule(s) registered", rule_count);

    if let Some(sql_path) = args.get(2) {
        let sql = fs::read_to_string(sql_path)
            .with_context(|| format!("Failed to read table definitions: {:?}", sql_path))?;
        service
            .connection()
            .execute_batch(&sql)
            .context("Failed to create target tables")?;
        println!("✓ Target tables created from {}", sql_path);
    }

    Ok(())
}

fn run_import(args: &[String]) -> Result<()> {
    let file_path = Path::new(positional(args, 0, "file")?);
    let organization = flag_value(args, "--org").unwrap_or(DEFAULT_ORGANIZATION);
    let uploaded_by = flag_value(args, "--user").unwrap_or("cli");
    let domain = flag_value(args, "--domain")
        .map(|d| d.parse::<Domain>())
        .transpose()?;

    let bytes = fs::read(file_path).with_context(|| format!("Failed to read upload: {:?}", file_path))?;
    let file_name = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .context("Upload path has no file name")?;

    let service = open_service()?;

    println!("📂 Uploading {}...", file_name);
    let session = service.create_session(organization, uploaded_by, file_name, &bytes, domain)?;
    println!("✓ Session {} ({} rows)", session.id, session.file.metadata.total_rows);

    println!("\n🔎 Classifying...");
    let session = service.classify_session(&session.id, None, None)?;
    if session.status == SessionStatus::Uploaded {
        print_session(&session);
        bail!("Classification did not resolve a domain; retry with --domain");
    }

    println!("\n🧪 Validating...");
    let session = service.validate_session(&session.id)?;
    if session.status == SessionStatus::ValidationFailed {
        print_session(&session);
        bail!("No valid rows to import");
    }

    println!("\n✅ Submitting for approval...");
    let mut session = service.submit_for_approval(&session.id)?;
    if session.status == SessionStatus::AwaitingApproval {
        if has_flag(args, "--approve") {
            session = service.approve_session(&session.id, uploaded_by, true)?;
        } else {
            print_session(&session);
            println!("\n⏸️  Waiting for review: smart-import approve {} <approver>", session.id);
            return Ok(());
        }
    } else {
        println!("\n⚙️  Executing...");
        session = service.execute_session(&session.id)?;
    }

    println!();
    print_session(&session);
    Ok(())
}

fn run_approve(args: &[String]) -> Result<()> {
    let session_id = positional(args, 0, "session-id")?;
    let approver = positional(args, 1, "approver")?;
    let session = open_service()?.approve_session(session_id, approver, true)?;
    print_session(&session);
    Ok(())
}

fn run_reject(args: &[String]) -> Result<()> {
    let session_id = positional(args, 0, "session-id")?;
    let approver = positional(args, 1, "approver")?;
    let reason = args.get(2..).unwrap_or(&[]).join(" ");
    let session = open_service()?.reject_session(session_id, approver, &reason)?;
    print_session(&session);
    Ok(())
}

fn run_cancel(args: &[String]) -> Result<()> {
    let session_id = positional(args, 0, "session-id")?;
    let actor = positional(args, 1, "actor")?;
    let reason = args.get(2..).unwrap_or(&[]).join(" ");
    let session = open_service()?.cancel_session(session_id, actor, Some(reason.as_str()))?;
    print_session(&session);
    Ok(())
}

fn run_status(args: &[String]) -> Result<()> {
    let session_id = positional(args, 0, "session-id")?;
    let session = open_service()?.get_session(session_id)?;
    print_session(&session);
    Ok(())
}

fn run_list(args: &[String]) -> Result<()> {
    let filters = SessionFilters {
        organization_id: flag_value(args, "--org").map(str::to_string),
        status: flag_value(args, "--status").map(|s| s.parse()).transpose()?,
        ..SessionFilters::default()
    };
    let page = open_service()?.list_sessions(&filters, page_flag(args)?, 20)?;

    println!("📋 Sessions (page {} of {}, {} total)", page.page, page.total_pages(), page.total);
    for session in &page.items {
        println!(
            "  {}  {:<22} {:<10} {}",
            session.id,
            session.status.as_str(),
            session.domain.map_or("-", |d| d.as_str()),
            session.file.name
        );
    }
    Ok(())
}

fn run_audit(args: &[String]) -> Result<()> {
    let session_id = positional(args, 0, "session-id")?;
    let page = open_service()?.get_audit_log(session_id, &AuditFilters::default(), page_flag(args)?, 50)?;

    println!("📜 Audit log (page {} of {}, {} entries)", page.page, page.total_pages(), page.total);
    for entry in &page.items {
        let marker = if entry.success { "✓" } else { "✗" };
        println!(
            "  {:>4} {} row {:<5} {:<7} {}",
            entry.seq,
            marker,
            entry.row_number,
            entry.action.as_str(),
            entry.error_message.as_deref().unwrap_or("")
        );
    }
    Ok(())
}
