use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Largest page a caller may request
pub const MAX_PAGE_LIMIT: u32 = 500;

/// Open (or create) the import database and make sure every table exists
pub fn open_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database: {:?}", path))?;
    setup_database(&conn).context("Failed to initialize database schema")?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> rusqlite::Result<()> {
    // Enable WAL mode for crash recovery (in-memory databases keep "memory")
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    // ==========================================================================
    // Import Sessions (indexed columns + JSON payload of the whole session)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS import_sessions (
            id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL,
            domain TEXT,
            status TEXT NOT NULL,
            uploaded_by TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Schema Definitions (versioned, one active per domain wins)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_definitions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            domain TEXT NOT NULL,
            table_name TEXT NOT NULL,
            display_name TEXT NOT NULL,
            fields TEXT NOT NULL,
            required_fields TEXT NOT NULL,
            unique_fields TEXT NOT NULL,
            version TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            UNIQUE (domain, table_name, version)
        )",
        [],
    )?;

    // ==========================================================================
    // Validation Rules (one per domain + field + rule type)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS validation_rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            domain TEXT NOT NULL,
            field_name TEXT NOT NULL,
            rule_type TEXT NOT NULL,
            rule_definition TEXT NOT NULL,
            severity TEXT NOT NULL DEFAULT 'error',
            error_message TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            priority INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            UNIQUE (domain, field_name, rule_type)
        )",
        [],
    )?;

    // ==========================================================================
    // Import Audit Log (append-only)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS import_audit_logs (
            id TEXT PRIMARY KEY,
            seq INTEGER NOT NULL,
            session_id TEXT NOT NULL,
            action TEXT NOT NULL,
            target_table TEXT NOT NULL,
            record_id TEXT,
            before_state TEXT,
            after_state TEXT,
            row_number INTEGER NOT NULL,
            success INTEGER NOT NULL,
            error_message TEXT,
            executed_by TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_org_status ON import_sessions(organization_id, status)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_created ON import_sessions(created_at)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_rules_domain ON validation_rules(domain, is_active, priority)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_session_table_record
         ON import_audit_logs(session_id, target_table, record_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_created ON import_audit_logs(created_at)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// PAGINATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> u64 {
        if self.limit == 0 {
            return 0;
        }
        self.total.div_ceil(u64::from(self.limit))
    }
}

/// Normalize a 1-based page and a limit; returns (page, limit, offset)
pub fn page_bounds(page: u32, limit: u32) -> (u32, u32, i64) {
    let page = page.max(1);
    let limit = limit.clamp(1, MAX_PAGE_LIMIT);
    let offset = i64::from(page - 1) * i64::from(limit);
    (page, limit, offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        setup_database(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('import_sessions', 'schema_definitions', 'validation_rules', 'import_audit_logs')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }

    #[test]
    fn test_page_bounds() {
        assert_eq!(page_bounds(0, 0), (1, 1, 0));
        assert_eq!(page_bounds(3, 20), (3, 20, 40));
        assert_eq!(page_bounds(1, 10_000), (1, MAX_PAGE_LIMIT, 0));
    }

    #[test]
    fn test_total_pages() {
        let page: Page<u8> = Page { items: vec![], total: 41, page: 1, limit: 20 };
        assert_eq!(page.total_pages(), 3);
    }
}
