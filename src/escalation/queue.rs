//! Approval queue for actions that must not run unattended.
//!
//! Every entry leaves Pending exactly once. Human resolution and deadline
//! expiry race for that transition; whichever claims the entry first wins
//! and the loser becomes a no-op.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::action::ActionDescriptor;
use crate::config::EscalationConfig;
use crate::error::{EnactorError, Result};
use crate::escalation::entry::{Decision, EscalationEntry, Priority, RiskLevel};
use crate::escalation::feedback::{DecisionCounts, DecisionFeedback, ExecutionOutcome, FeedbackLog};
use crate::events::{EventBus, EventPayload};
use crate::notification::ApprovalNotifier;

/// Executes an action once a reviewer has released it.
#[async_trait]
pub trait ApprovedRunner: Send + Sync {
    async fn run(&self, action: &ActionDescriptor) -> Result<Value>;
}

/// Counters over the queue's lifetime, grouped by risk level.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EscalationStats {
    pub queued: u64,
    pub pending: usize,
    pub by_risk: HashMap<RiskLevel, DecisionCounts>,
    pub decisions: u64,
    pub avg_time_to_decision_ms: f64,
}

pub struct EscalationQueue {
    entries: DashMap<String, EscalationEntry>,
    timers: DashMap<String, JoinHandle<()>>,
    runner: Arc<dyn ApprovedRunner>,
    notifier: Option<Arc<dyn ApprovalNotifier>>,
    feedback: Option<FeedbackLog>,
    config: EscalationConfig,
    stats: Mutex<EscalationStats>,
    events: EventBus,
}

impl EscalationQueue {
    pub fn new(
        runner: Arc<dyn ApprovedRunner>,
        config: EscalationConfig,
        events: EventBus,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            timers: DashMap::new(),
            runner,
            notifier: None,
            feedback: None,
            config,
            stats: Mutex::new(EscalationStats::default()),
            events,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ApprovalNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_feedback_log(mut self, log: FeedbackLog) -> Self {
        self.feedback = Some(log);
        self
    }

    /// Queue an action for review. Returns the approval id; if the priority
    /// carries a deadline, an expiry timer starts immediately.
    pub async fn enqueue(
        self: &Arc<Self>,
        action: ActionDescriptor,
        reason: impl Into<String>,
        priority: Priority,
        risk_level: RiskLevel,
    ) -> String {
        let entry = EscalationEntry::new(action, reason, priority, risk_level);
        let approval_id = entry.approval_id.clone();

        info!(
            approval_id = %approval_id,
            action = %entry.action.summary(),
            priority = %priority,
            risk_level = %risk_level,
            reason = %entry.reason,
            deadline = ?entry.deadline,
            "Action queued for approval"
        );
        self.events.publish(EventPayload::ApprovalQueued {
            approval_id: approval_id.clone(),
            action_type: entry.action.action_type.clone(),
            priority,
            risk_level,
        });
        self.stats.lock().queued += 1;

        // The entry must be resolvable before the notifier hears about it; a
        // notifier may react (and call resolve) from inside the callback.
        let deadline = entry.deadline;
        self.entries.insert(approval_id.clone(), entry.clone());
        if let Some(deadline) = deadline {
            self.schedule_expiry(&approval_id, deadline);
        }

        if let Some(notifier) = &self.notifier {
            notifier.approval_requested(&entry).await;
        }

        approval_id
    }

    /// Apply a reviewer's decision. Approve and Modify release the action to
    /// the runner and return its result; Reject drops it and returns None.
    ///
    /// Only Approve, Modify, and Reject are accepted here, and Modify must
    /// carry the parameter changes to merge.
    pub async fn resolve(
        &self,
        approval_id: &str,
        decision: Decision,
        decided_by: &str,
        modifications: Option<Map<String, Value>>,
    ) -> Result<Option<Value>> {
        match decision {
            Decision::Modify if modifications.is_none() => {
                return Err(EnactorError::InvalidDecision(
                    "modify requires modifications".to_string(),
                ))
            }
            Decision::Approve | Decision::Modify | Decision::Reject => {}
            Decision::Pending | Decision::Expired => {
                return Err(EnactorError::InvalidDecision(decision.as_str().to_string()))
            }
        }

        let entry = self.claim(approval_id, decision, decided_by, modifications)?;
        self.cancel_timer(approval_id);
        self.finish_resolution(entry).await
    }

    /// Atomically move a pending entry to `decision`. Fails if the entry is
    /// unknown or some other caller decided it first.
    fn claim(
        &self,
        approval_id: &str,
        decision: Decision,
        decided_by: &str,
        modifications: Option<Map<String, Value>>,
    ) -> Result<EscalationEntry> {
        let mut entry = self
            .entries
            .get_mut(approval_id)
            .ok_or_else(|| EnactorError::ApprovalNotFound(approval_id.to_string()))?;
        if !entry.is_pending() {
            return Err(EnactorError::AlreadyDecided {
                id: approval_id.to_string(),
                decision: entry.decision.as_str().to_string(),
            });
        }
        entry.decision = decision;
        entry.decided_by = Some(decided_by.to_string());
        entry.decided_at = Some(Utc::now());
        entry.modifications = modifications;
        Ok(entry.clone())
    }

    async fn finish_resolution(&self, entry: EscalationEntry) -> Result<Option<Value>> {
        self.events.publish(EventPayload::ApprovalResolved {
            approval_id: entry.approval_id.clone(),
            decision: entry.decision,
            decided_by: entry.decided_by.clone().unwrap_or_default(),
        });
        self.record_decision_stats(&entry);
        if let Some(notifier) = &self.notifier {
            notifier.approval_resolved(&entry).await;
        }

        if entry.decision == Decision::Reject {
            info!(approval_id = %entry.approval_id, "Approval rejected; action dropped");
            self.emit_feedback(&entry, None);
            return Ok(None);
        }

        let action = match &entry.modifications {
            Some(mods) => entry.action.with_modifications(mods),
            None => entry.action.clone(),
        };

        self.events.publish(EventPayload::ApprovalExecuting {
            approval_id: entry.approval_id.clone(),
            action_type: action.action_type.clone(),
        });

        match self.runner.run(&action).await {
            Ok(result) => {
                self.events.publish(EventPayload::ApprovalCompleted {
                    approval_id: entry.approval_id.clone(),
                });
                self.emit_feedback(&entry, Some(ExecutionOutcome::Succeeded));
                Ok(Some(result))
            }
            Err(error) => {
                warn!(
                    approval_id = %entry.approval_id,
                    error = %error,
                    "Approved action failed during execution"
                );
                self.events.publish(EventPayload::ApprovalFailed {
                    approval_id: entry.approval_id.clone(),
                    error: error.to_string(),
                });
                self.emit_feedback(&entry, Some(ExecutionOutcome::Failed));
                Err(error)
            }
        }
    }

    fn schedule_expiry(self: &Arc<Self>, approval_id: &str, deadline: DateTime<Utc>) {
        let queue = Arc::clone(self);
        let id = approval_id.to_string();
        let handle = tokio::spawn(async move {
            let wait = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;
            queue.handle_expiry(&id).await;
        });
        self.timers.insert(approval_id.to_string(), handle);
    }

    /// Deadline handler. Never fails: any error here is logged and the entry
    /// is left in whatever state the race produced.
    async fn handle_expiry(&self, approval_id: &str) {
        // Drop our own timer handle without aborting it: this function runs
        // inside that task, and the auto-resolve path below would otherwise
        // cancel itself at the next await point.
        self.timers.remove(approval_id);

        let risk_level = match self.entries.get(approval_id) {
            Some(entry) if entry.is_pending() => entry.risk_level,
            _ => return,
        };

        let auto = match risk_level {
            RiskLevel::Low if self.config.auto_approve_low_on_expiry => Some(Decision::Approve),
            RiskLevel::High | RiskLevel::Critical if self.config.auto_reject_high_on_expiry => {
                Some(Decision::Reject)
            }
            _ => None,
        };

        match auto {
            Some(decision) => {
                info!(
                    approval_id = %approval_id,
                    decision = %decision,
                    risk_level = %risk_level,
                    "Deadline passed; auto-resolving per expiry policy"
                );
                match self.resolve(approval_id, decision, "system", None).await {
                    Ok(_)
                    | Err(EnactorError::AlreadyDecided { .. })
                    | Err(EnactorError::ApprovalNotFound(_)) => {}
                    Err(error) => {
                        warn!(
                            approval_id = %approval_id,
                            error = %error,
                            "Auto-resolution on expiry failed"
                        );
                    }
                }
            }
            None => self.expire(approval_id).await,
        }
    }

    async fn expire(&self, approval_id: &str) {
        let entry = {
            let mut entry = match self.entries.get_mut(approval_id) {
                Some(entry) => entry,
                None => return,
            };
            // A resolve may have claimed the entry since the policy check.
            if !entry.is_pending() {
                return;
            }
            entry.decision = Decision::Expired;
            entry.decided_by = Some("system".to_string());
            entry.decided_at = Some(Utc::now());
            entry.clone()
        };

        info!(
            approval_id = %approval_id,
            priority = %entry.priority,
            risk_level = %entry.risk_level,
            "Approval expired without a decision"
        );
        self.events.publish(EventPayload::ApprovalExpired {
            approval_id: approval_id.to_string(),
            priority: entry.priority,
            risk_level: entry.risk_level,
        });
        self.record_decision_stats(&entry);
        if let Some(notifier) = &self.notifier {
            notifier.approval_resolved(&entry).await;
        }
        self.emit_feedback(&entry, None);
    }

    fn cancel_timer(&self, approval_id: &str) {
        if let Some((_, handle)) = self.timers.remove(approval_id) {
            handle.abort();
        }
    }

    fn emit_feedback(&self, entry: &EscalationEntry, outcome: Option<ExecutionOutcome>) {
        if let Some(log) = &self.feedback {
            let feedback = DecisionFeedback::from_entry(entry, outcome);
            if let Err(error) = log.append(&feedback) {
                warn!(
                    approval_id = %entry.approval_id,
                    error = %error,
                    "Failed to record decision feedback"
                );
            }
        }
    }

    fn record_decision_stats(&self, entry: &EscalationEntry) {
        let mut stats = self.stats.lock();
        stats
            .by_risk
            .entry(entry.risk_level)
            .or_default()
            .record(entry.decision);
        if let Some(elapsed) = entry.time_to_decision() {
            let ms = elapsed.num_milliseconds().max(0) as f64;
            stats.decisions += 1;
            let n = stats.decisions as f64;
            stats.avg_time_to_decision_ms += (ms - stats.avg_time_to_decision_ms) / n;
        }
    }

    pub fn get(&self, approval_id: &str) -> Option<EscalationEntry> {
        self.entries
            .get(approval_id)
            .map(|entry| entry.value().clone())
    }

    /// Pending entries, oldest first.
    pub fn list_pending(&self) -> Vec<EscalationEntry> {
        let mut pending: Vec<EscalationEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_pending())
            .map(|entry| entry.value().clone())
            .collect();
        pending.sort_by_key(|entry| entry.queued_at);
        pending
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn statistics(&self) -> EscalationStats {
        let mut stats = self.stats.lock().clone();
        stats.pending = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_pending())
            .count();
        stats
    }

    /// Drop every entry and abort every timer. Counters survive.
    pub fn clear(&self) {
        self.shutdown();
        self.entries.clear();
    }

    /// Abort all expiry timers. Entries stay queryable but no longer expire.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.timers.iter().map(|timer| timer.key().clone()).collect();
        for id in ids {
            self.cancel_timer(&id);
        }
    }
}
