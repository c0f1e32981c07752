use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FaultPayload;

use super::record::ExecutedAction;

/// Static classification of whether an action type's effect can be
/// auto-undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reversibility {
    /// A registered inverse operation fully undoes the effect.
    Reversible,
    /// Best-effort restore from previous state captured in the parameters.
    PartiallyReversible,
    /// The effect cannot be undone by calling an API (emails, notifications).
    NonReversible,
    /// Undoing is itself destructive and needs human confirmation.
    ConfirmationRequired,
}

impl Reversibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reversible => "reversible",
            Self::PartiallyReversible => "partially_reversible",
            Self::NonReversible => "non_reversible",
            Self::ConfirmationRequired => "confirmation_required",
        }
    }
}

impl fmt::Display for Reversibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Action types whose behavior the prefix rules below would misjudge.
const EXACT_CLASSIFICATIONS: &[(&str, Reversibility)] = &[
    // Once posted, a comment has been read; retracting it does not unread it.
    ("add_comment", Reversibility::NonReversible),
    ("add_note", Reversibility::NonReversible),
    ("create_invoice", Reversibility::ConfirmationRequired),
];

/// Classify an action type from its naming convention. Unknown types
/// default to NonReversible so nothing is auto-undone on a guess.
pub fn classify_action_type(action_type: &str) -> Reversibility {
    let lowered = action_type.to_ascii_lowercase();
    if let Some((_, reversibility)) = EXACT_CLASSIFICATIONS
        .iter()
        .find(|(name, _)| *name == lowered)
    {
        return *reversibility;
    }

    if has_prefix(&lowered, &["create_", "add_", "register_", "open_"]) {
        Reversibility::Reversible
    } else if has_prefix(&lowered, &["update_", "set_", "assign_", "change_"]) {
        Reversibility::PartiallyReversible
    } else if has_prefix(&lowered, &["delete_", "remove_", "drop_", "purge_", "close_"]) {
        Reversibility::ConfirmationRequired
    } else {
        Reversibility::NonReversible
    }
}

/// The inverse action type for a creation-style operation, if its prefix
/// has a conventional counterpart.
pub fn inverse_action_type(action_type: &str) -> Option<String> {
    let lowered = action_type.to_ascii_lowercase();
    for (prefix, inverse) in [
        ("create_", "delete_"),
        ("add_", "remove_"),
        ("register_", "unregister_"),
        ("open_", "close_"),
    ] {
        if let Some(rest) = lowered.strip_prefix(prefix) {
            return Some(format!("{inverse}{rest}"));
        }
    }
    None
}

fn has_prefix(value: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|prefix| value.starts_with(prefix))
}

/// Undoes one executed action. Registered per action type; invoked with
/// the original entry so it can read parameters and the produced result.
#[async_trait]
pub trait InverseOperation: Send + Sync {
    async fn invert(&self, entry: &ExecutedAction) -> std::result::Result<Value, FaultPayload>;
}

/// Lookup table from action type to its registered inverse.
#[derive(Default)]
pub struct InverseRegistry {
    inverses: DashMap<String, Arc<dyn InverseOperation>>,
}

impl InverseRegistry {
    pub fn new() -> Self {
        Self {
            inverses: DashMap::new(),
        }
    }

    pub fn register(&self, action_type: impl Into<String>, operation: Arc<dyn InverseOperation>) {
        self.inverses.insert(action_type.into(), operation);
    }

    pub fn get(&self, action_type: &str) -> Option<Arc<dyn InverseOperation>> {
        self.inverses
            .get(action_type)
            .map(|entry| entry.value().clone())
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.inverses.contains_key(action_type)
    }
}
