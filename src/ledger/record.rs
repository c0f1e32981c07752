use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::action::ActionDescriptor;

use super::reversibility::{classify_action_type, Reversibility};

/// Lifecycle of a unit of work. Compensation is the only path out of
/// Active. A partially compensated unit may re-enter Compensating to
/// finish the remaining entries; Compensated and CompensationFailed
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    #[default]
    Active,
    Compensating,
    Compensated,
    PartiallyCompensated,
    CompensationFailed,
}

impl UnitState {
    pub fn allowed_transitions(&self) -> &'static [UnitState] {
        use UnitState::*;
        match self {
            Active => &[Compensating],
            Compensating => &[Compensated, PartiallyCompensated, CompensationFailed],
            Compensated => &[],
            PartiallyCompensated => &[Compensating],
            CompensationFailed => &[],
        }
    }

    pub fn can_transition_to(&self, target: UnitState) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitState::Compensated | UnitState::CompensationFailed)
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "Active",
            Self::Compensating => "Compensating",
            Self::Compensated => "Compensated",
            Self::PartiallyCompensated => "PartiallyCompensated",
            Self::CompensationFailed => "CompensationFailed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStatus {
    #[default]
    NotAttempted,
    Compensated,
    CompensationFailed,
    ManualStepsRequired,
}

/// One successfully-executed action as the ledger remembers it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutedAction {
    pub action_id: String,
    pub unit_id: String,
    pub action_type: String,
    pub target: String,
    pub parameters: Map<String, Value>,
    pub result: Value,
    pub executed_at: DateTime<Utc>,
    pub reversibility: Reversibility,
    pub compensation_status: CompensationStatus,
}

impl ExecutedAction {
    pub fn new(unit_id: impl Into<String>, action: &ActionDescriptor, result: Value) -> Self {
        Self {
            action_id: Uuid::new_v4().to_string(),
            unit_id: unit_id.into(),
            action_type: action.action_type.clone(),
            target: action.target.clone(),
            parameters: action.parameters.clone(),
            result,
            executed_at: Utc::now(),
            reversibility: classify_action_type(&action.action_type),
            compensation_status: CompensationStatus::NotAttempted,
        }
    }

    /// Prior values captured by the caller before the original call, used
    /// for best-effort restore of partially-reversible actions.
    pub fn previous_state(&self) -> Option<&Value> {
        self.parameters.get("previous_state")
    }
}

/// A named, ordered group of executed actions compensated together.
/// Entries are append-only and strictly in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitOfWork {
    pub id: String,
    pub name: String,
    pub entries: Vec<ExecutedAction>,
    pub state: UnitState,
    pub created_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl UnitOfWork {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            entries: Vec::new(),
            state: UnitState::Active,
            created_at: Utc::now(),
            archived_at: None,
        }
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// Appends are accepted only while Active and not yet archived.
    pub fn is_appendable(&self) -> bool {
        self.state == UnitState::Active && !self.is_archived()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_transitions() {
        assert!(UnitState::Active.can_transition_to(UnitState::Compensating));
        assert!(UnitState::Compensating.can_transition_to(UnitState::Compensated));
        assert!(UnitState::Compensating.can_transition_to(UnitState::PartiallyCompensated));
        assert!(UnitState::Compensating.can_transition_to(UnitState::CompensationFailed));
        assert!(UnitState::PartiallyCompensated.can_transition_to(UnitState::Compensating));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!UnitState::Active.can_transition_to(UnitState::Compensated));
        assert!(!UnitState::Compensated.can_transition_to(UnitState::Active));
        assert!(!UnitState::CompensationFailed.can_transition_to(UnitState::Compensating));
    }

    #[test]
    fn test_terminal_states() {
        assert!(UnitState::Compensated.is_terminal());
        assert!(UnitState::CompensationFailed.is_terminal());
        assert!(!UnitState::PartiallyCompensated.is_terminal());
        assert!(!UnitState::Active.is_terminal());
        assert!(!UnitState::Compensating.is_terminal());
    }

    #[test]
    fn test_archived_unit_rejects_appends() {
        let mut unit = UnitOfWork::new("u1", "provision");
        assert!(unit.is_appendable());

        unit.archived_at = Some(Utc::now());
        assert!(!unit.is_appendable());
        assert_eq!(unit.state, UnitState::Active);
    }

    #[test]
    fn test_executed_action_classifies_on_creation() {
        let action = ActionDescriptor::new("s1", "create_ticket", "helpdesk")
            .with_parameter("title", json!("disk full"));
        let entry = ExecutedAction::new("u1", &action, json!({"id": "T-9"}));

        assert_eq!(entry.reversibility, Reversibility::Reversible);
        assert_eq!(entry.compensation_status, CompensationStatus::NotAttempted);
        assert_eq!(entry.unit_id, "u1");
    }

    #[test]
    fn test_previous_state_accessor() {
        let action = ActionDescriptor::new("s1", "update_status", "crm")
            .with_parameter("status", json!("closed"))
            .with_parameter("previous_state", json!({"status": "open"}));
        let entry = ExecutedAction::new("u1", &action, json!({}));

        assert_eq!(entry.previous_state(), Some(&json!({"status": "open"})));
    }
}
