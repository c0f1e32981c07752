use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{EnactorError, Result};
use crate::escalation::entry::{Decision, EscalationEntry, Priority, RiskLevel};

/// How the approved action went once it was released for execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Succeeded,
    Failed,
}

/// One resolved approval, flattened for offline analysis of how humans
/// decide and how those decisions pan out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionFeedback {
    pub created_at: DateTime<Utc>,
    pub approval_id: String,
    pub action_type: String,
    pub target: String,
    pub priority: Priority,
    pub risk_level: RiskLevel,
    pub decision: Decision,
    pub decided_by: String,
    pub time_to_decision_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modifications: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_outcome: Option<ExecutionOutcome>,
}

impl DecisionFeedback {
    pub fn from_entry(entry: &EscalationEntry, outcome: Option<ExecutionOutcome>) -> Self {
        let time_to_decision_ms = entry
            .time_to_decision()
            .and_then(|d| u64::try_from(d.num_milliseconds()).ok())
            .unwrap_or(0);
        Self {
            created_at: Utc::now(),
            approval_id: entry.approval_id.clone(),
            action_type: entry.action.action_type.clone(),
            target: entry.action.target.clone(),
            priority: entry.priority,
            risk_level: entry.risk_level,
            decision: entry.decision,
            decided_by: entry.decided_by.clone().unwrap_or_default(),
            time_to_decision_ms,
            modifications: entry.modifications.clone(),
            execution_outcome: outcome,
        }
    }
}

/// Append-only JSONL log of decision feedback.
#[derive(Debug, Clone)]
pub struct FeedbackLog {
    path: PathBuf,
}

impl FeedbackLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn from_dir(dir: &Path) -> Self {
        Self {
            path: dir.join("escalation").join("decisions.jsonl"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, feedback: &DecisionFeedback) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(feedback)
            .map_err(|e| EnactorError::Persistence(format!("JSON serialize failed: {}", e)))?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(format!("{}\n", line).as_bytes())?;
        file.flush()?;

        debug!(
            approval_id = %feedback.approval_id,
            decision = %feedback.decision,
            "Decision feedback recorded"
        );
        Ok(())
    }

    pub fn load(&self) -> Result<Vec<DecisionFeedback>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path)?;
        let records = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping invalid feedback line: {}", e);
                    None
                }
            })
            .collect();
        Ok(records)
    }
}

/// Tally of terminal decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecisionCounts {
    pub approved: u64,
    pub modified: u64,
    pub rejected: u64,
    pub expired: u64,
}

impl DecisionCounts {
    pub fn record(&mut self, decision: Decision) {
        match decision {
            Decision::Approve => self.approved += 1,
            Decision::Modify => self.modified += 1,
            Decision::Reject => self.rejected += 1,
            Decision::Expired => self.expired += 1,
            Decision::Pending => {}
        }
    }

    pub fn total(&self) -> u64 {
        self.approved + self.modified + self.rejected + self.expired
    }

    /// Share of decisions that released the action (approve or modify).
    pub fn approval_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        (self.approved + self.modified) as f64 / total as f64
    }
}

pub fn counts_by_risk(records: &[DecisionFeedback]) -> HashMap<RiskLevel, DecisionCounts> {
    let mut by_risk: HashMap<RiskLevel, DecisionCounts> = HashMap::new();
    for record in records {
        by_risk.entry(record.risk_level).or_default().record(record.decision);
    }
    by_risk
}

pub fn average_time_to_decision_ms(records: &[DecisionFeedback]) -> Option<f64> {
    if records.is_empty() {
        return None;
    }
    let total: u64 = records.iter().map(|r| r.time_to_decision_ms).sum();
    Some(total as f64 / records.len() as f64)
}
