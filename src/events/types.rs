//! Execution events published on every component transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::escalation::{Decision, Priority, RiskLevel};
use crate::ledger::{Reversibility, UnitState};
use crate::retry::FaultClassification;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl ExecutionEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    RetryScheduled {
        target: String,
        action_type: String,
        attempt: u32,
        delay_ms: u64,
        classification: FaultClassification,
    },
    ExecutionSucceeded {
        target: String,
        action_type: String,
        attempts: u32,
    },
    ExecutionFailed {
        target: String,
        action_type: String,
        attempts: u32,
        classification: FaultClassification,
        retryable: bool,
    },

    CacheHit {
        key: String,
        hit_count: u64,
    },
    CacheStored {
        key: String,
        action_type: String,
        expires_at: DateTime<Utc>,
    },
    CacheInvalidated {
        removed: usize,
    },
    CacheEvicted {
        evicted: usize,
    },

    UnitStarted {
        unit_id: String,
        name: String,
    },
    ActionRecorded {
        unit_id: String,
        action_id: String,
        action_type: String,
        reversibility: Reversibility,
    },
    UnitArchived {
        unit_id: String,
        entries: usize,
    },
    CompensationStarted {
        unit_id: String,
        entries: usize,
    },
    CompensationFinished {
        unit_id: String,
        state: UnitState,
        compensated: usize,
        failed: usize,
        manual_steps: usize,
    },

    ApprovalQueued {
        approval_id: String,
        action_type: String,
        priority: Priority,
        risk_level: RiskLevel,
    },
    ApprovalResolved {
        approval_id: String,
        decision: Decision,
        decided_by: String,
    },
    ApprovalExpired {
        approval_id: String,
        priority: Priority,
        risk_level: RiskLevel,
    },
    ApprovalExecuting {
        approval_id: String,
        action_type: String,
    },
    ApprovalCompleted {
        approval_id: String,
    },
    ApprovalFailed {
        approval_id: String,
        error: String,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::ExecutionSucceeded { .. } => "execution_succeeded",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::CacheHit { .. } => "cache_hit",
            Self::CacheStored { .. } => "cache_stored",
            Self::CacheInvalidated { .. } => "cache_invalidated",
            Self::CacheEvicted { .. } => "cache_evicted",
            Self::UnitStarted { .. } => "unit_started",
            Self::ActionRecorded { .. } => "action_recorded",
            Self::UnitArchived { .. } => "unit_archived",
            Self::CompensationStarted { .. } => "compensation_started",
            Self::CompensationFinished { .. } => "compensation_finished",
            Self::ApprovalQueued { .. } => "approval_queued",
            Self::ApprovalResolved { .. } => "approval_resolved",
            Self::ApprovalExpired { .. } => "approval_expired",
            Self::ApprovalExecuting { .. } => "approval_executing",
            Self::ApprovalCompleted { .. } => "approval_completed",
            Self::ApprovalFailed { .. } => "approval_failed",
        }
    }

    /// Approval id for escalation events, if this event carries one.
    pub fn approval_id(&self) -> Option<&str> {
        match self {
            Self::ApprovalQueued { approval_id, .. }
            | Self::ApprovalResolved { approval_id, .. }
            | Self::ApprovalExpired { approval_id, .. }
            | Self::ApprovalExecuting { approval_id, .. }
            | Self::ApprovalCompleted { approval_id, .. }
            | Self::ApprovalFailed { approval_id, .. } => Some(approval_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names() {
        let event = ExecutionEvent::new(EventPayload::CacheHit {
            key: "k".into(),
            hit_count: 2,
        });
        assert_eq!(event.event_type(), "cache_hit");
    }

    #[test]
    fn test_events_round_trip_through_json() {
        let payloads = vec![
            EventPayload::RetryScheduled {
                target: "crm".into(),
                action_type: "create_task".into(),
                attempt: 1,
                delay_ms: 1000,
                classification: FaultClassification::TransientService,
            },
            EventPayload::ApprovalQueued {
                approval_id: "a-1".into(),
                action_type: "delete_record".into(),
                priority: Priority::High,
                risk_level: RiskLevel::Critical,
            },
            EventPayload::CompensationFinished {
                unit_id: "u-1".into(),
                state: UnitState::Compensated,
                compensated: 3,
                failed: 0,
                manual_steps: 0,
            },
        ];

        for payload in payloads {
            let event = ExecutionEvent::new(payload);
            let json = serde_json::to_string(&event).unwrap();
            let back: ExecutionEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(back.event_type(), event.event_type());
        }
    }

    #[test]
    fn test_approval_id_extraction() {
        let payload = EventPayload::ApprovalExpired {
            approval_id: "a-9".into(),
            priority: Priority::Medium,
            risk_level: RiskLevel::Medium,
        };
        assert_eq!(payload.approval_id(), Some("a-9"));
        assert_eq!(
            EventPayload::CacheInvalidated { removed: 1 }.approval_id(),
            None
        );
    }
}
