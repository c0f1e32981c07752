//! Event stream for component transitions.

mod bus;
mod types;

pub use bus::{EventBus, EventReceiver};
pub use types::{EventPayload, ExecutionEvent};
