//! Action descriptors: the immutable unit everything else operates on.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Immutable record describing one proposed side-effecting operation.
///
/// `correlation_id` ties the action to the upstream signal that proposed it;
/// `target` names the remote service the action runs against. Build one with
/// the `with_*` setters, then treat it as read-only: every transformation
/// (parameter modification on an approved-with-changes escalation) produces a
/// fresh descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub correlation_id: String,
    pub action_type: String,
    pub target: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl ActionDescriptor {
    pub fn new(
        correlation_id: impl Into<String>,
        action_type: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            action_type: action_type.into(),
            target: target.into(),
            parameters: Map::new(),
            context: Map::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// New descriptor with `modifications` shallow-merged over `parameters`.
    /// Used when a reviewer approves an action with changes.
    pub fn with_modifications(&self, modifications: &Map<String, Value>) -> Self {
        let mut modified = self.clone();
        for (key, value) in modifications {
            modified.parameters.insert(key.clone(), value.clone());
        }
        modified
    }

    /// One-line description for logs and remediation instructions.
    pub fn summary(&self) -> String {
        format!(
            "{} against {} (correlation {})",
            self.action_type, self.target, self.correlation_id
        )
    }
}
