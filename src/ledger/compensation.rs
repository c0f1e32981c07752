use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::action::ActionDescriptor;
use crate::error::{EnactorError, Result};
use crate::events::{EventBus, EventPayload};
use crate::retry::RetryEngine;
use crate::util::compact_json_preview;

use super::record::{CompensationStatus, ExecutedAction, UnitOfWork, UnitState};
use super::reversibility::{inverse_action_type, InverseOperation, InverseRegistry, Reversibility};

/// Knobs for one compensation run.
#[derive(Debug, Clone)]
pub struct CompensationOptions {
    /// Halt the walk at the first failed undo instead of continuing.
    pub stop_on_failure: bool,
    /// Hold destructive undos for a human instead of running them.
    pub require_confirmation: bool,
    /// Upper bound on entries walked, newest first.
    pub max_actions: Option<usize>,
    pub timeout_per_action: Duration,
}

impl Default for CompensationOptions {
    fn default() -> Self {
        Self {
            stop_on_failure: false,
            require_confirmation: true,
            max_actions: None,
            timeout_per_action: Duration::from_secs(30),
        }
    }
}

impl CompensationOptions {
    pub fn with_stop_on_failure(mut self, stop_on_failure: bool) -> Self {
        self.stop_on_failure = stop_on_failure;
        self
    }

    pub fn with_require_confirmation(mut self, require_confirmation: bool) -> Self {
        self.require_confirmation = require_confirmation;
        self
    }

    pub fn with_max_actions(mut self, max_actions: usize) -> Self {
        self.max_actions = Some(max_actions);
        self
    }

    pub fn with_timeout_per_action(mut self, timeout: Duration) -> Self {
        self.timeout_per_action = timeout;
        self
    }
}

/// Outcome of a compensation run. Every entry that could not be undone
/// cleanly appears in `manual_steps_required` with an instruction.
#[derive(Debug, Clone, Serialize)]
pub struct CompensationReport {
    pub unit_id: String,
    pub final_state: UnitState,
    pub success: bool,
    pub compensated: Vec<String>,
    pub failed: Vec<String>,
    pub manual_steps_required: Vec<String>,
    pub manual_instructions: Vec<String>,
    pub duration_ms: u64,
}

/// Dry-run classification of what a compensation run would face.
#[derive(Debug, Clone, Serialize)]
pub struct CompensationPlan {
    pub can_compensate: bool,
    pub reversible: usize,
    pub partially_reversible: usize,
    pub non_reversible: usize,
    pub confirmation_required: usize,
    pub warnings: Vec<String>,
}

enum EntryOutcome {
    Compensated,
    Failed(String),
    Manual(String),
}

/// Records executed actions per unit of work and unwinds them in exact
/// reverse order on failure. Inverse calls run through the retry engine
/// so transient faults during rollback get the same treatment as the
/// forward path.
pub struct CompensationLedger {
    units: DashMap<String, UnitOfWork>,
    inverses: InverseRegistry,
    engine: Arc<RetryEngine>,
    defaults: CompensationOptions,
    events: EventBus,
}

impl CompensationLedger {
    pub fn new(engine: Arc<RetryEngine>, events: EventBus) -> Self {
        Self {
            units: DashMap::new(),
            inverses: InverseRegistry::new(),
            engine,
            defaults: CompensationOptions::default(),
            events,
        }
    }

    pub fn with_defaults(mut self, defaults: CompensationOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn default_options(&self) -> CompensationOptions {
        self.defaults.clone()
    }

    pub fn register_inverse(
        &self,
        action_type: impl Into<String>,
        operation: Arc<dyn InverseOperation>,
    ) {
        self.inverses.register(action_type, operation);
    }

    /// Create an Active unit. Fails if the id is already in use.
    pub fn begin(&self, id: &str, name: &str) -> Result<()> {
        match self.units.entry(id.to_string()) {
            Entry::Occupied(_) => Err(EnactorError::UnitAlreadyExists(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(UnitOfWork::new(id, name));
                debug!(unit_id = %id, name = %name, "Unit of work started");
                self.events.publish(EventPayload::UnitStarted {
                    unit_id: id.to_string(),
                    name: name.to_string(),
                });
                Ok(())
            }
        }
    }

    /// Record one executed action, classifying its reversibility. Only
    /// Active, unarchived units accept appends.
    pub fn append(
        &self,
        unit_id: &str,
        action: &ActionDescriptor,
        result: Value,
    ) -> Result<ExecutedAction> {
        let entry = {
            let mut unit = self
                .units
                .get_mut(unit_id)
                .ok_or_else(|| EnactorError::UnitNotFound(unit_id.to_string()))?;
            if !unit.is_appendable() {
                let state = if unit.is_archived() {
                    format!("{} (archived)", unit.state)
                } else {
                    unit.state.to_string()
                };
                return Err(EnactorError::UnitNotAppendable {
                    id: unit_id.to_string(),
                    state,
                });
            }
            let entry = ExecutedAction::new(unit_id, action, result);
            unit.entries.push(entry.clone());
            entry
        };

        self.events.publish(EventPayload::ActionRecorded {
            unit_id: unit_id.to_string(),
            action_id: entry.action_id.clone(),
            action_type: entry.action_type.clone(),
            reversibility: entry.reversibility,
        });
        Ok(entry)
    }

    /// Archive a unit after its workflow finished cleanly. No further
    /// appends are accepted; compensation remains possible.
    pub fn complete(&self, unit_id: &str) -> Result<()> {
        let newly_archived = {
            let mut unit = self
                .units
                .get_mut(unit_id)
                .ok_or_else(|| EnactorError::UnitNotFound(unit_id.to_string()))?;
            if unit.state != UnitState::Active {
                return Err(EnactorError::InvalidUnitTransition {
                    id: unit_id.to_string(),
                    state: unit.state.to_string(),
                });
            }
            if unit.is_archived() {
                None
            } else {
                unit.archived_at = Some(Utc::now());
                Some(unit.entries.len())
            }
        };

        if let Some(entries) = newly_archived {
            debug!(unit_id = %unit_id, entries, "Unit of work archived");
            self.events.publish(EventPayload::UnitArchived {
                unit_id: unit_id.to_string(),
                entries,
            });
        }
        Ok(())
    }

    pub fn get(&self, unit_id: &str) -> Option<UnitOfWork> {
        self.units.get(unit_id).map(|unit| unit.value().clone())
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Drop every unit. For teardown and test isolation.
    pub fn clear(&self) {
        self.units.clear();
    }

    /// Dry-run pass over a unit's entries: what would compensation face.
    pub fn validate(&self, unit_id: &str) -> Result<CompensationPlan> {
        let unit = self
            .units
            .get(unit_id)
            .ok_or_else(|| EnactorError::UnitNotFound(unit_id.to_string()))?;

        let mut plan = CompensationPlan {
            can_compensate: unit.state.can_transition_to(UnitState::Compensating),
            reversible: 0,
            partially_reversible: 0,
            non_reversible: 0,
            confirmation_required: 0,
            warnings: Vec::new(),
        };
        let mut missing_inverse: HashSet<&str> = HashSet::new();

        for entry in &unit.entries {
            match entry.reversibility {
                Reversibility::Reversible => {
                    plan.reversible += 1;
                    if !self.inverses.contains(&entry.action_type)
                        && missing_inverse.insert(&entry.action_type)
                    {
                        plan.warnings.push(format!(
                            "no inverse operation registered for '{}'",
                            entry.action_type
                        ));
                    }
                }
                Reversibility::PartiallyReversible => {
                    plan.partially_reversible += 1;
                    if entry.previous_state().is_none() {
                        plan.warnings.push(format!(
                            "'{}' captured no previous state; restore will be manual",
                            entry.action_type
                        ));
                    }
                }
                Reversibility::NonReversible => plan.non_reversible += 1,
                Reversibility::ConfirmationRequired => plan.confirmation_required += 1,
            }
        }

        if plan.non_reversible > 0 {
            plan.warnings.push(format!(
                "{} action(s) cannot be undone automatically and will need manual follow-up",
                plan.non_reversible
            ));
        }
        if !plan.can_compensate {
            plan.warnings.push(format!(
                "unit is in state {} and cannot start compensation",
                unit.state
            ));
        }
        Ok(plan)
    }

    /// Unwind every entry of a unit in reverse execution order.
    pub async fn compensate(
        &self,
        unit_id: &str,
        options: CompensationOptions,
    ) -> Result<CompensationReport> {
        self.run_compensation(unit_id, None, options).await
    }

    /// Unwind only the newest `last_n` entries.
    pub async fn partial_compensate(
        &self,
        unit_id: &str,
        last_n: usize,
        options: CompensationOptions,
    ) -> Result<CompensationReport> {
        self.run_compensation(unit_id, Some(last_n), options).await
    }

    async fn run_compensation(
        &self,
        unit_id: &str,
        last_n: Option<usize>,
        options: CompensationOptions,
    ) -> Result<CompensationReport> {
        let started = Instant::now();

        // Claim the unit and snapshot the batch; the walk itself runs
        // without holding the map entry.
        let batch: Vec<ExecutedAction> = {
            let mut unit = self
                .units
                .get_mut(unit_id)
                .ok_or_else(|| EnactorError::UnitNotFound(unit_id.to_string()))?;
            if !unit.state.can_transition_to(UnitState::Compensating) {
                return Err(EnactorError::InvalidUnitTransition {
                    id: unit_id.to_string(),
                    state: unit.state.to_string(),
                });
            }
            unit.state = UnitState::Compensating;

            // On a resumed walk, entries already undone or handed to an
            // operator are skipped; failed ones are retried.
            let mut entries: Vec<ExecutedAction> = unit
                .entries
                .iter()
                .rev()
                .filter(|entry| {
                    matches!(
                        entry.compensation_status,
                        CompensationStatus::NotAttempted | CompensationStatus::CompensationFailed
                    )
                })
                .cloned()
                .collect();
            if let Some(n) = last_n {
                entries.truncate(n);
            }
            if let Some(max) = options.max_actions {
                entries.truncate(max);
            }
            entries
        };

        info!(unit_id = %unit_id, entries = batch.len(), "Compensation started");
        self.events.publish(EventPayload::CompensationStarted {
            unit_id: unit_id.to_string(),
            entries: batch.len(),
        });

        let mut compensated = Vec::new();
        let mut failed = Vec::new();
        let mut manual_steps = Vec::new();
        let mut manual_instructions = Vec::new();

        for entry in &batch {
            let outcome = self.compensate_entry(entry, &options).await;
            let status = match &outcome {
                EntryOutcome::Compensated => CompensationStatus::Compensated,
                EntryOutcome::Failed(_) => CompensationStatus::CompensationFailed,
                EntryOutcome::Manual(_) => CompensationStatus::ManualStepsRequired,
            };
            self.set_entry_status(unit_id, &entry.action_id, status);

            match outcome {
                EntryOutcome::Compensated => compensated.push(entry.action_id.clone()),
                EntryOutcome::Failed(error) => {
                    warn!(
                        unit_id = %unit_id,
                        action_id = %entry.action_id,
                        action_type = %entry.action_type,
                        error = %error,
                        "Compensation step failed"
                    );
                    failed.push(entry.action_id.clone());
                    manual_steps.push(entry.action_id.clone());
                    manual_instructions.push(format!(
                        "Manually revert {}: automatic undo failed with {}.",
                        describe_entry(entry),
                        error
                    ));
                    if options.stop_on_failure {
                        break;
                    }
                }
                EntryOutcome::Manual(instruction) => {
                    manual_steps.push(entry.action_id.clone());
                    manual_instructions.push(instruction);
                }
            }
        }

        // The final state reflects the whole unit, not just this batch; a
        // partial walk leaves untouched entries behind and must not mark the
        // unit fully compensated.
        let final_state = {
            let statuses: Vec<CompensationStatus> = self
                .units
                .get(unit_id)
                .map(|unit| {
                    unit.entries
                        .iter()
                        .map(|entry| entry.compensation_status)
                        .collect()
                })
                .unwrap_or_default();
            if statuses
                .iter()
                .all(|status| *status == CompensationStatus::Compensated)
            {
                UnitState::Compensated
            } else if !statuses.is_empty()
                && statuses
                    .iter()
                    .all(|status| *status == CompensationStatus::CompensationFailed)
            {
                UnitState::CompensationFailed
            } else {
                UnitState::PartiallyCompensated
            }
        };
        if let Some(mut unit) = self.units.get_mut(unit_id) {
            unit.state = final_state;
        }

        let report = CompensationReport {
            unit_id: unit_id.to_string(),
            final_state,
            success: failed.is_empty(),
            compensated,
            failed,
            manual_steps_required: manual_steps,
            manual_instructions,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            unit_id = %unit_id,
            state = %final_state,
            compensated = report.compensated.len(),
            failed = report.failed.len(),
            manual_steps = report.manual_steps_required.len(),
            "Compensation finished"
        );
        self.events.publish(EventPayload::CompensationFinished {
            unit_id: unit_id.to_string(),
            state: final_state,
            compensated: report.compensated.len(),
            failed: report.failed.len(),
            manual_steps: report.manual_steps_required.len(),
        });
        Ok(report)
    }

    async fn compensate_entry(
        &self,
        entry: &ExecutedAction,
        options: &CompensationOptions,
    ) -> EntryOutcome {
        match entry.reversibility {
            Reversibility::NonReversible => EntryOutcome::Manual(format!(
                "Manually revert {}: its effect is not automatically reversible.",
                describe_entry(entry)
            )),
            Reversibility::ConfirmationRequired if options.require_confirmation => {
                EntryOutcome::Manual(format!(
                    "Confirm and manually revert {}: destructive undo was withheld.",
                    describe_entry(entry)
                ))
            }
            Reversibility::PartiallyReversible if entry.previous_state().is_none() => {
                EntryOutcome::Manual(format!(
                    "Manually restore prior values for {}: no previous state was captured.",
                    describe_entry(entry)
                ))
            }
            _ => self.invoke_inverse(entry, options).await,
        }
    }

    async fn invoke_inverse(
        &self,
        entry: &ExecutedAction,
        options: &CompensationOptions,
    ) -> EntryOutcome {
        let Some(inverse) = self.inverses.get(&entry.action_type) else {
            return EntryOutcome::Manual(format!(
                "Manually revert {}: no inverse operation is registered for '{}'.",
                describe_entry(entry),
                entry.action_type
            ));
        };

        let action = compensation_action(entry);
        let policy = self
            .engine
            .policies()
            .policy_for(&action.target)
            .with_timeout(options.timeout_per_action);

        match self
            .engine
            .execute_with_policy(&action, || inverse.invert(entry), &policy)
            .await
        {
            Ok(_) => EntryOutcome::Compensated,
            Err(error) => EntryOutcome::Failed(error.to_string()),
        }
    }

    fn set_entry_status(&self, unit_id: &str, action_id: &str, status: CompensationStatus) {
        if let Some(mut unit) = self.units.get_mut(unit_id) {
            if let Some(stored) = unit
                .entries
                .iter_mut()
                .find(|entry| entry.action_id == action_id)
            {
                stored.compensation_status = status;
            }
        }
    }
}

/// The descriptor an inverse call runs under, so per-target policies and
/// statistics see compensation traffic like any other.
fn compensation_action(entry: &ExecutedAction) -> ActionDescriptor {
    let action_type = inverse_action_type(&entry.action_type)
        .unwrap_or_else(|| format!("undo_{}", entry.action_type));
    ActionDescriptor::new(
        entry.unit_id.clone(),
        action_type,
        entry.target.clone(),
    )
    .with_parameters(entry.parameters.clone())
}

fn describe_entry(entry: &ExecutedAction) -> String {
    format!(
        "{} against {} (parameters {}, result {})",
        entry.action_type,
        entry.target,
        compact_json_preview(&Value::Object(entry.parameters.clone()), 200),
        compact_json_preview(&entry.result, 120)
    )
}
