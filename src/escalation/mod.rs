//! Human-in-the-loop escalation: queueing, deadlines, decisions, feedback.

mod entry;
mod feedback;
mod queue;

pub use entry::{Decision, EscalationEntry, Priority, RiskLevel};
pub use feedback::{
    average_time_to_decision_ms, counts_by_risk, DecisionCounts, DecisionFeedback,
    ExecutionOutcome, FeedbackLog,
};
pub use queue::{ApprovedRunner, EscalationQueue, EscalationStats};
