//! Fault classification, backoff, and the retry execution loop.

mod backoff;
mod classify;
mod executor;
mod policy;
mod stats;

pub use backoff::{next_delay, BackoffShape, RATE_LIMIT_BUFFER};
pub use classify::{classify, rate_limit_hint, FaultClassification, RateLimitHint};
pub use executor::{RetryEngine, TokenRefresher};
pub use policy::{PolicyRegistry, RetryPolicy};
pub use stats::{StatsRegistry, TargetStats};
