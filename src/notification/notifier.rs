use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::escalation::{Decision, EscalationEntry};

/// External human-interface collaborator told about approval traffic.
/// Implementations must not fail the queue; swallow and log errors.
#[async_trait]
pub trait ApprovalNotifier: Send + Sync {
    async fn approval_requested(&self, entry: &EscalationEntry);
    async fn approval_resolved(&self, entry: &EscalationEntry);
}

/// Default notifier: structured log lines, nothing external.
pub struct TracingNotifier;

#[async_trait]
impl ApprovalNotifier for TracingNotifier {
    async fn approval_requested(&self, entry: &EscalationEntry) {
        info!(
            approval_id = %entry.approval_id,
            action = %entry.action.summary(),
            priority = %entry.priority,
            risk_level = %entry.risk_level,
            reason = %entry.reason,
            deadline = ?entry.deadline,
            "Approval requested"
        );
    }

    async fn approval_resolved(&self, entry: &EscalationEntry) {
        info!(
            approval_id = %entry.approval_id,
            decision = %entry.decision,
            decided_by = entry.decided_by.as_deref().unwrap_or(""),
            "Approval resolved"
        );
    }
}

/// Notifier double that records what it was told. For tests and dry runs.
#[derive(Default)]
pub struct RecordingNotifier {
    requested: Mutex<Vec<String>>,
    resolved: Mutex<Vec<(String, Decision)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().clone()
    }

    pub fn resolved(&self) -> Vec<(String, Decision)> {
        self.resolved.lock().clone()
    }
}

#[async_trait]
impl ApprovalNotifier for RecordingNotifier {
    async fn approval_requested(&self, entry: &EscalationEntry) {
        self.requested.lock().push(entry.approval_id.clone());
    }

    async fn approval_resolved(&self, entry: &EscalationEntry) {
        self.resolved
            .lock()
            .push((entry.approval_id.clone(), entry.decision));
    }
}
