//! Configuration types and loading.
//!
//! Provides all configuration structures for enactor:
//! - `EnactorConfig`: Top-level configuration with validation
//! - Per-component configs: retry, cache, ledger, escalation, events

mod settings;

pub use settings::{
    CacheConfig, EnactorConfig, EscalationConfig, EventsConfig, LedgerConfig, RetryConfig,
};
