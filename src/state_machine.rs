// 🚦 Session State Machine
// One table of (current status, event) → next status. Every operation asks
// this table before touching a session; nothing else re-checks status.

use crate::error::{ImportError, Result};
use crate::session::SessionStatus;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    StartClassification,
    FinishClassification,
    RevertClassification,
    StartMapping,
    FinishMapping,
    StartValidation,
    PassValidation,
    FailValidation,
    SubmitForApproval,
    AutoApprove,
    Approve,
    Reject,
    StartExecution,
    Complete,
    CompleteWithErrors,
    FailExecution,
    Cancel,
}

impl Event {
    /// Operation name as a caller would say it
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::StartClassification => "classify",
            Event::FinishClassification => "finish classification",
            Event::RevertClassification => "revert classification",
            Event::StartMapping => "update mapping",
            Event::FinishMapping => "finish mapping",
            Event::StartValidation => "validate",
            Event::PassValidation => "pass validation",
            Event::FailValidation => "fail validation",
            Event::SubmitForApproval => "submit for approval",
            Event::AutoApprove => "auto-approve",
            Event::Approve => "approve",
            Event::Reject => "reject",
            Event::StartExecution => "execute",
            Event::Complete => "complete",
            Event::CompleteWithErrors => "complete with errors",
            Event::FailExecution => "fail execution",
            Event::Cancel => "cancel",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The transition table. `None` means the event is illegal in `from`.
pub fn next_status(from: SessionStatus, event: Event) -> Option<SessionStatus> {
    use Event::*;
    use SessionStatus::*;

    match (from, event) {
        (Uploaded | Classified, StartClassification) => Some(Classifying),
        (Classifying, FinishClassification) => Some(Classified),
        (Classifying, RevertClassification) => Some(Uploaded),

        (Classified | Mapped | Validated | ValidationFailed, StartMapping) => Some(Mapping),
        (Mapping, FinishMapping) => Some(Mapped),

        (Classified | Mapped, StartValidation) => Some(Validating),
        (Validating, PassValidation) => Some(Validated),
        (Validating, FailValidation) => Some(ValidationFailed),

        (Validated, SubmitForApproval) => Some(AwaitingApproval),
        (Validated, AutoApprove) => Some(Approved),
        (AwaitingApproval, Approve) => Some(Approved),
        (AwaitingApproval, Reject) => Some(Rejected),

        (Approved, StartExecution) => Some(Executing),
        (Executing, Complete) => Some(Completed),
        (Executing, CompleteWithErrors) => Some(CompletedWithErrors),
        (Executing, FailExecution) => Some(Failed),

        // No mid-transaction cancel
        (Executing, Cancel) => None,
        (status, Cancel) if !status.is_terminal() => Some(Cancelled),

        _ => None,
    }
}

/// Statuses from which `event` is legal
pub fn allowed_from(event: Event) -> Vec<SessionStatus> {
    SessionStatus::ALL
        .iter()
        .copied()
        .filter(|s| next_status(*s, event).is_some())
        .collect()
}

/// Look up a transition, turning an illegal one into the single error path
pub fn transition(from: SessionStatus, event: Event) -> Result<SessionStatus> {
    next_status(from, event).ok_or_else(|| ImportError::InvalidTransition {
        event,
        current: from,
        required: allowed_from(event),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionStatus::*;

    #[test]
    fn test_happy_path_chain() {
        let chain = [
            (Event::StartClassification, Classifying),
            (Event::FinishClassification, Classified),
            (Event::StartMapping, Mapping),
            (Event::FinishMapping, Mapped),
            (Event::StartValidation, Validating),
            (Event::PassValidation, Validated),
            (Event::SubmitForApproval, AwaitingApproval),
            (Event::Approve, Approved),
            (Event::StartExecution, Executing),
            (Event::Complete, Completed),
        ];

        let mut status = Uploaded;
        for (event, expected) in chain {
            status = transition(status, event).unwrap();
            assert_eq!(status, expected, "after {}", event);
        }
        assert!(status.is_terminal());
    }

    #[test]
    fn test_reclassification_allowed() {
        assert_eq!(transition(Classified, Event::StartClassification).unwrap(), Classifying);
        assert!(transition(Validated, Event::StartClassification).is_err());
    }

    #[test]
    fn test_validate_preconditions() {
        assert_eq!(
            allowed_from(Event::StartValidation),
            vec![Classified, Mapped]
        );
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        let events = [
            Event::StartClassification,
            Event::StartMapping,
            Event::StartValidation,
            Event::SubmitForApproval,
            Event::Approve,
            Event::Reject,
            Event::StartExecution,
            Event::Cancel,
        ];

        for status in [Completed, CompletedWithErrors, Failed, Rejected, Cancelled] {
            for event in events {
                assert!(
                    next_status(status, event).is_none(),
                    "{} should not accept {}",
                    status,
                    event
                );
            }
        }
    }

    #[test]
    fn test_cancel_rules() {
        assert_eq!(transition(Uploaded, Event::Cancel).unwrap(), Cancelled);
        assert_eq!(transition(AwaitingApproval, Event::Cancel).unwrap(), Cancelled);
        assert_eq!(transition(Approved, Event::Cancel).unwrap(), Cancelled);
        assert!(transition(Executing, Event::Cancel).is_err());
    }

    #[test]
    fn test_error_names_current_and_required() {
        match transition(Completed, Event::Approve) {
            Err(ImportError::InvalidTransition { event, current, required }) => {
                assert_eq!(event, Event::Approve);
                assert_eq!(current, Completed);
                assert_eq!(required, vec![AwaitingApproval]);
            }
            other => panic!("expected InvalidTransition, got {:?}", other),
        }
    }
}
