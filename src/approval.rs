// ✅ Approval Gate
// Auto-approve when confidence and validation both clear the bar,
// otherwise park the session for a human.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    AutoApproved,
}

impl Default for ApprovalStatus {
    fn default() -> Self {
        ApprovalStatus::Pending
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub status: ApprovalStatus,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
}

impl Approval {
    pub fn auto(at: DateTime<Utc>) -> Self {
        Approval {
            status: ApprovalStatus::AutoApproved,
            approved_by: None,
            approved_at: Some(at),
            rejection_reason: None,
        }
    }

    pub fn approved(approver: &str, at: DateTime<Utc>) -> Self {
        Approval {
            status: ApprovalStatus::Approved,
            approved_by: Some(approver.to_string()),
            approved_at: Some(at),
            rejection_reason: None,
        }
    }

    pub fn rejected(approver: &str, reason: &str, at: DateTime<Utc>) -> Self {
        Approval {
            status: ApprovalStatus::Rejected,
            approved_by: Some(approver.to_string()),
            approved_at: Some(at),
            rejection_reason: Some(reason.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    AutoApprove,
    ManualReview,
}

#[derive(Debug, Clone)]
pub struct ApprovalGate {
    /// Minimum confidence (inclusive) for auto-approval
    pub threshold: f64,
}

impl ApprovalGate {
    pub fn new(threshold: f64) -> Self {
        ApprovalGate { threshold }
    }

    /// Auto-approve iff confidence >= threshold and no error-severity failures
    pub fn decide(&self, confidence: f64, error_count: usize) -> ApprovalDecision {
        if confidence >= self.threshold && error_count == 0 {
            ApprovalDecision::AutoApprove
        } else {
            ApprovalDecision::ManualReview
        }
    }
}

impl Default for ApprovalGate {
    fn default() -> Self {
        ApprovalGate::new(crate::config::DEFAULT_AUTO_APPROVE_THRESHOLD)
    }
}
