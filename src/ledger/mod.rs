//! Per-unit action recording and reverse-order compensation.

mod compensation;
mod record;
mod reversibility;

pub use compensation::{
    CompensationLedger, CompensationOptions, CompensationPlan, CompensationReport,
};
pub use record::{CompensationStatus, ExecutedAction, UnitOfWork, UnitState};
pub use reversibility::{
    classify_action_type, inverse_action_type, InverseOperation, InverseRegistry, Reversibility,
};
