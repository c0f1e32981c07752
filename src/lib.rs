pub mod action;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod escalation;
pub mod events;
pub mod idempotency;
pub mod ledger;
pub mod notification;
pub mod retry;
pub mod util;

pub use action::ActionDescriptor;
pub use config::EnactorConfig;
pub use dispatch::{ActionAdapter, Dispatcher, UNIT_CONTEXT_KEY};
pub use error::{ClassifiedFault, EnactorError, FaultPayload, Result};
pub use escalation::{
    ApprovedRunner, Decision, EscalationEntry, EscalationQueue, FeedbackLog, Priority, RiskLevel,
};
pub use events::{EventBus, EventPayload, EventReceiver, ExecutionEvent};
pub use idempotency::{derive_key, IdempotencyCache, IdempotencyRecord, JsonlCacheStore};
pub use ledger::{
    CompensationLedger, CompensationOptions, CompensationReport, ExecutedAction, InverseOperation,
    Reversibility, UnitOfWork, UnitState,
};
pub use notification::{ApprovalNotifier, RecordingNotifier, TracingNotifier};
pub use retry::{FaultClassification, PolicyRegistry, RetryEngine, RetryPolicy, TokenRefresher};
