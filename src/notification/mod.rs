//! Approval notification seam.
//!
//! The escalation queue talks to the human interface through
//! `ApprovalNotifier`; `TracingNotifier` is the log-only default.

mod notifier;

pub use notifier::{ApprovalNotifier, RecordingNotifier, TracingNotifier};
