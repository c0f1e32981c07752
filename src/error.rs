use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::FaultClassification;

/// Structured description of a fault returned by a remote call.
///
/// Adapters populate whatever they know: an HTTP status, a transport error
/// code (`ECONNREFUSED`, `EAI_AGAIN`, ...), rate-limit hints from response
/// headers. Classification reads the structured fields first and falls back
/// to message markers, so a bare message is always acceptable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Server-provided wait from a Retry-After header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
    /// Absolute rate-limit window reset, when the server exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
    /// Set on the retry engine's own per-attempt timeout, so classification
    /// never depends on the rendered message text.
    #[serde(default)]
    pub attempt_timed_out: bool,
}

impl FaultPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            code: None,
            retry_after: None,
            reset_at: None,
            attempt_timed_out: false,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_retry_after(mut self, wait: Duration) -> Self {
        self.retry_after = Some(wait);
        self
    }

    pub fn with_reset_at(mut self, reset_at: DateTime<Utc>) -> Self {
        self.reset_at = Some(reset_at);
        self
    }

    /// Fault for an attempt that exceeded the policy's per-attempt timeout.
    pub fn timed_out(timeout: Duration) -> Self {
        Self {
            attempt_timed_out: true,
            ..Self::new(format!("attempt timed out after {}ms", timeout.as_millis()))
        }
    }
}

impl std::fmt::Display for FaultPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.status, self.code.as_deref()) {
            (Some(status), Some(code)) => {
                write!(f, "{} (HTTP {}, {})", self.message, status, code)
            }
            (Some(status), None) => write!(f, "{} (HTTP {})", self.message, status),
            (None, Some(code)) => write!(f, "{} ({})", self.message, code),
            (None, None) => write!(f, "{}", self.message),
        }
    }
}

impl From<&str> for FaultPayload {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for FaultPayload {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// The one error execution callers see after the retry engine gives up: the
/// original fault annotated with its classification and the attempts consumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedFault {
    pub classification: FaultClassification,
    pub retryable: bool,
    pub attempts: u32,
    pub fault: FaultPayload,
}

impl ClassifiedFault {
    pub fn new(classification: FaultClassification, retryable: bool, fault: FaultPayload) -> Self {
        Self {
            classification,
            retryable,
            attempts: 1,
            fault,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

impl std::fmt::Display for ClassifiedFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} fault after {} attempt{}: {}",
            self.classification.as_str(),
            self.attempts,
            if self.attempts == 1 { "" } else { "s" },
            self.fault
        )
    }
}

impl std::error::Error for ClassifiedFault {}

#[derive(Error, Debug)]
pub enum EnactorError {
    #[error(transparent)]
    Fault(#[from] ClassifiedFault),

    #[error("Execution cancelled: {0}")]
    Cancelled(String),

    #[error("Unit of work not found: {0}")]
    UnitNotFound(String),

    #[error("Unit of work already exists: {0}")]
    UnitAlreadyExists(String),

    #[error("Unit {id} rejects appends in state {state}")]
    UnitNotAppendable { id: String, state: String },

    #[error("Unit {id} cannot begin compensation from state {state}")]
    InvalidUnitTransition { id: String, state: String },

    #[error("Approval not found: {0}")]
    ApprovalNotFound(String),

    #[error("Approval {id} already decided: {decision}")]
    AlreadyDecided { id: String, decision: String },

    #[error("Invalid decision for resolve: {0}")]
    InvalidDecision(String),

    #[error("No inverse operation registered for action type: {0}")]
    NoInverse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, EnactorError>;
