use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::action::ActionDescriptor;

/// Urgency of a queued approval. Sets how long a human gets to decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Decision window per priority. Critical entries never expire on
    /// their own; they wait for an explicit call.
    pub fn deadline(&self) -> Option<Duration> {
        match self {
            Priority::Low => Some(Duration::from_secs(3600)),
            Priority::Medium => Some(Duration::from_secs(1800)),
            Priority::High => Some(Duration::from_secs(900)),
            Priority::Critical => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Risk framing from the upstream classifier. Drives what happens when
/// an entry expires undecided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Decision state of an approval. Leaves Pending exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Pending,
    Approve,
    Modify,
    Reject,
    Expired,
}

impl Decision {
    pub fn is_pending(&self) -> bool {
        matches!(self, Decision::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Pending => "pending",
            Decision::Approve => "approve",
            Decision::Modify => "modify",
            Decision::Reject => "reject",
            Decision::Expired => "expired",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A queued action awaiting a human approve/modify/reject decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationEntry {
    pub approval_id: String,
    pub action: ActionDescriptor,
    pub priority: Priority,
    pub risk_level: RiskLevel,
    pub reason: String,
    pub queued_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub decision: Decision,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub modifications: Option<Map<String, Value>>,
}

impl EscalationEntry {
    pub fn new(
        action: ActionDescriptor,
        reason: impl Into<String>,
        priority: Priority,
        risk_level: RiskLevel,
    ) -> Self {
        let queued_at = Utc::now();
        let deadline = priority
            .deadline()
            .and_then(|window| chrono::Duration::from_std(window).ok())
            .map(|window| queued_at + window);
        Self {
            approval_id: Uuid::new_v4().to_string(),
            action,
            priority,
            risk_level,
            reason: reason.into(),
            queued_at,
            deadline,
            decision: Decision::Pending,
            decided_by: None,
            decided_at: None,
            modifications: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.decision.is_pending()
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map(|deadline| now >= deadline).unwrap_or(false)
    }

    /// Elapsed between queueing and the decision, if one was made.
    pub fn time_to_decision(&self) -> Option<chrono::Duration> {
        self.decided_at.map(|decided_at| decided_at - self.queued_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(priority: Priority) -> EscalationEntry {
        EscalationEntry::new(
            ActionDescriptor::new("s1", "delete_record", "crm"),
            "destructive action",
            priority,
            RiskLevel::High,
        )
    }

    #[test]
    fn test_deadlines_by_priority() {
        assert_eq!(
            Priority::Low.deadline(),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(
            Priority::Medium.deadline(),
            Some(Duration::from_secs(1800))
        );
        assert_eq!(Priority::High.deadline(), Some(Duration::from_secs(900)));
        assert_eq!(Priority::Critical.deadline(), None);
    }

    #[test]
    fn test_new_entry_is_pending_with_deadline() {
        let entry = entry(Priority::High);
        assert!(entry.is_pending());
        let deadline = entry.deadline.unwrap();
        assert_eq!(
            (deadline - entry.queued_at).num_seconds(),
            900
        );
    }

    #[test]
    fn test_critical_entry_has_no_deadline() {
        let entry = entry(Priority::Critical);
        assert_eq!(entry.deadline, None);
        assert!(!entry.is_past_deadline(Utc::now() + chrono::Duration::days(30)));
    }

    #[test]
    fn test_time_to_decision() {
        let mut entry = entry(Priority::Low);
        assert_eq!(entry.time_to_decision(), None);

        entry.decided_at = Some(entry.queued_at + chrono::Duration::seconds(42));
        assert_eq!(
            entry.time_to_decision().map(|d| d.num_seconds()),
            Some(42)
        );
    }
}
