// ⚙️ Engine configuration
// Thresholds and sampling knobs, with defaults and env overrides

use anyhow::{Context, Result};
use std::env;

/// Default minimum confidence for auto-approval.
pub const DEFAULT_AUTO_APPROVE_THRESHOLD: f64 = 95.0;
/// Default score a domain must exceed to be auto-detected.
pub const DEFAULT_DETECTION_THRESHOLD: f64 = 30.0;
/// Default number of rows kept in the session's file metadata.
pub const DEFAULT_SAMPLE_SIZE: usize = 1000;
/// Default tenant column injected into every inserted row.
pub const DEFAULT_TENANT_COLUMN: &str = "organization_id";
/// Default executor name written to the audit ledger.
pub const DEFAULT_EXECUTOR: &str = "import_engine";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Confidence (0-100) at or above which an error-free import is auto-approved
    pub auto_approve_threshold: f64,

    /// Best detection score must be strictly above this value
    pub detection_threshold: f64,

    /// Rows retained from the parsed file for validation and execution
    pub sample_size: usize,

    /// Column carrying the organization id in every target table
    pub tenant_column: String,

    /// Identity recorded on audit entries when no approver is known
    pub executor: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            auto_approve_threshold: DEFAULT_AUTO_APPROVE_THRESHOLD,
            detection_threshold: DEFAULT_DETECTION_THRESHOLD,
            sample_size: DEFAULT_SAMPLE_SIZE,
            tenant_column: DEFAULT_TENANT_COLUMN.to_string(),
            executor: DEFAULT_EXECUTOR.to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// | Env Var                         | Default           |
    /// |---------------------------------|-------------------|
    /// | `IMPORT_AUTO_APPROVE_THRESHOLD` | `95`              |
    /// | `IMPORT_DETECTION_THRESHOLD`    | `30`              |
    /// | `IMPORT_SAMPLE_SIZE`            | `1000`            |
    /// | `IMPORT_TENANT_COLUMN`          | `organization_id` |
    /// | `IMPORT_EXECUTOR`               | `import_engine`   |
    pub fn from_env() -> Result<Self> {
        let mut config = EngineConfig::default();

        if let Ok(raw) = env::var("IMPORT_AUTO_APPROVE_THRESHOLD") {
            config.auto_approve_threshold = raw
                .parse()
                .with_context(|| format!("IMPORT_AUTO_APPROVE_THRESHOLD must be a number, got {:?}", raw))?;
        }

        if let Ok(raw) = env::var("IMPORT_DETECTION_THRESHOLD") {
            config.detection_threshold = raw
                .parse()
                .with_context(|| format!("IMPORT_DETECTION_THRESHOLD must be a number, got {:?}", raw))?;
        }

        if let Ok(raw) = env::var("IMPORT_SAMPLE_SIZE") {
            config.sample_size = raw
                .parse()
                .with_context(|| format!("IMPORT_SAMPLE_SIZE must be a positive integer, got {:?}", raw))?;
        }

        if let Ok(raw) = env::var("IMPORT_TENANT_COLUMN") {
            if !raw.trim().is_empty() {
                config.tenant_column = raw.trim().to_string();
            }
        }

        if let Ok(raw) = env::var("IMPORT_EXECUTOR") {
            if !raw.trim().is_empty() {
                config.executor = raw.trim().to_string();
            }
        }

        Ok(config)
    }

    /// Builder: override the sample size
    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size;
        self
    }

    /// Builder: override the auto-approval threshold
    pub fn with_auto_approve_threshold(mut self, threshold: f64) -> Self {
        self.auto_approve_threshold = threshold;
        self
    }
}
