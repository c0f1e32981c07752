//! Front door for executing actions: duplicate suppression, retries, and
//! unit-of-work recording composed into one pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::action::ActionDescriptor;
use crate::error::{EnactorError, FaultPayload, Result};
use crate::escalation::ApprovedRunner;
use crate::idempotency::IdempotencyCache;
use crate::ledger::CompensationLedger;
use crate::retry::RetryEngine;

/// Context key naming the unit of work an action should be recorded under.
pub const UNIT_CONTEXT_KEY: &str = "unit_id";

/// Performs the remote call for one action.
///
/// Implementations translate their transport failures into `FaultPayload`
/// and never retry internally; the engine owns that loop.
#[async_trait]
pub trait ActionAdapter: Send + Sync {
    async fn perform(
        &self,
        action: &ActionDescriptor,
    ) -> std::result::Result<Value, FaultPayload>;
}

/// Composed execution pipeline.
///
/// A dispatched action first consults the idempotency cache; a miss runs
/// the adapter under the retry engine, and a success is cached and, when
/// the action names a unit of work, appended to the compensation ledger.
/// The same pipeline backs escalation: approved actions re-enter here.
pub struct Dispatcher {
    engine: Arc<RetryEngine>,
    cache: Arc<IdempotencyCache>,
    ledger: Arc<CompensationLedger>,
    adapter: Arc<dyn ActionAdapter>,
}

impl Dispatcher {
    pub fn new(
        engine: Arc<RetryEngine>,
        cache: Arc<IdempotencyCache>,
        ledger: Arc<CompensationLedger>,
        adapter: Arc<dyn ActionAdapter>,
    ) -> Self {
        Self {
            engine,
            cache,
            ledger,
            adapter,
        }
    }

    pub fn engine(&self) -> &Arc<RetryEngine> {
        &self.engine
    }

    pub fn cache(&self) -> &Arc<IdempotencyCache> {
        &self.cache
    }

    pub fn ledger(&self) -> &Arc<CompensationLedger> {
        &self.ledger
    }

    /// Run an action through the pipeline. The unit of work, if any, is
    /// taken from the `unit_id` entry of the action context.
    pub async fn dispatch(&self, action: &ActionDescriptor) -> Result<Value> {
        let unit_id = action
            .context
            .get(UNIT_CONTEXT_KEY)
            .and_then(Value::as_str)
            .map(str::to_string);
        self.execute_pipeline(action, unit_id.as_deref()).await
    }

    /// Run an action and record it under an explicit unit of work.
    pub async fn dispatch_in_unit(
        &self,
        unit_id: &str,
        action: &ActionDescriptor,
    ) -> Result<Value> {
        self.execute_pipeline(action, Some(unit_id)).await
    }

    async fn execute_pipeline(
        &self,
        action: &ActionDescriptor,
        unit: Option<&str>,
    ) -> Result<Value> {
        // Check the unit up front so a bad id fails before any side effect.
        if let Some(unit_id) = unit {
            let unit = self
                .ledger
                .get(unit_id)
                .ok_or_else(|| EnactorError::UnitNotFound(unit_id.to_string()))?;
            if !unit.is_appendable() {
                return Err(EnactorError::UnitNotAppendable {
                    id: unit_id.to_string(),
                    state: unit.state.to_string(),
                });
            }
        }

        self.cache
            .wrap(action, || async move {
                let result = self
                    .engine
                    .execute(action, || self.adapter.perform(action))
                    .await?;
                if let Some(unit_id) = unit {
                    self.ledger.append(unit_id, action, result.clone())?;
                }
                Ok(result)
            })
            .await
    }
}

#[async_trait]
impl ApprovedRunner for Dispatcher {
    async fn run(&self, action: &ActionDescriptor) -> Result<Value> {
        self.dispatch(action).await
    }
}
