//! The retry loop: attempt, classify, wait, repeat.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use std::future::Future;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::action::ActionDescriptor;
use crate::error::{ClassifiedFault, EnactorError, FaultPayload, Result};
use crate::events::{EventBus, EventPayload};

use super::backoff::next_delay;
use super::classify::{classify, rate_limit_hint, FaultClassification};
use super::policy::{PolicyRegistry, RetryPolicy};
use super::stats::StatsRegistry;

/// Refreshes credentials for a target after an Authorization fault.
///
/// Invoked at most once per execution. The returned token is for adapters
/// that cache credentials externally; the engine only cares that the
/// refresh succeeded.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, target: &str) -> Result<String>;
}

/// Drives a fallible async operation to completion under a retry policy.
///
/// The operation returns `FaultPayload` on failure; the engine classifies
/// it, decides retryability against the policy whitelist, waits out the
/// backoff, and hands back a `ClassifiedFault` once it gives up. Statistics
/// and events are side channels; they never affect the outcome.
pub struct RetryEngine {
    policies: PolicyRegistry,
    stats: Arc<StatsRegistry>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    events: EventBus,
}

impl RetryEngine {
    pub fn new(policies: PolicyRegistry, events: EventBus) -> Self {
        Self {
            policies,
            stats: Arc::new(StatsRegistry::new()),
            refresher: None,
            events,
        }
    }

    pub fn with_token_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    pub fn stats(&self) -> &StatsRegistry {
        &self.stats
    }

    /// Execute under the target's registered policy (or the fallback).
    pub async fn execute<T, F, Fut>(&self, action: &ActionDescriptor, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, FaultPayload>>,
    {
        let policy = self.policies.policy_for(&action.target);
        self.run(action, operation, &policy, None).await
    }

    /// Execute under an explicit policy, ignoring the registry.
    pub async fn execute_with_policy<T, F, Fut>(
        &self,
        action: &ActionDescriptor,
        operation: F,
        policy: &RetryPolicy,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, FaultPayload>>,
    {
        self.run(action, operation, policy, None).await
    }

    /// Execute with a cancellation signal checked between attempts. The
    /// in-flight call itself is never interrupted; cancellation lands
    /// during the inter-attempt wait.
    pub async fn execute_cancellable<T, F, Fut>(
        &self,
        action: &ActionDescriptor,
        operation: F,
        cancel: watch::Receiver<bool>,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, FaultPayload>>,
    {
        let policy = self.policies.policy_for(&action.target);
        self.run(action, operation, &policy, Some(cancel)).await
    }

    async fn run<T, F, Fut>(
        &self,
        action: &ActionDescriptor,
        operation: F,
        policy: &RetryPolicy,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, FaultPayload>>,
    {
        let target = action.target.as_str();
        let mut attempt: u32 = 1;
        let mut auth_refreshed = false;

        loop {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(policy.timeout, operation()).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(fault)) => Err(fault),
                Err(_) => Err(FaultPayload::timed_out(policy.timeout)),
            };
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

            let fault = match outcome {
                Ok(value) => {
                    self.stats.record_success(target, latency_ms);
                    debug!(
                        target = %target,
                        action_type = %action.action_type,
                        attempt = attempt,
                        "Execution succeeded"
                    );
                    self.events.publish(EventPayload::ExecutionSucceeded {
                        target: target.to_string(),
                        action_type: action.action_type.clone(),
                        attempts: attempt,
                    });
                    return Ok(value);
                }
                Err(fault) => fault,
            };

            let classification = classify(&fault);
            let hint = rate_limit_hint(&fault);
            self.stats.record_failure(target, latency_ms, classification);

            if classification == FaultClassification::Authorization
                && policy.allow_auth_refresh
                && !auth_refreshed
            {
                if let Some(refresher) = &self.refresher {
                    match refresher.refresh(target).await {
                        Ok(_) => {
                            auth_refreshed = true;
                            self.stats.record_auth_refresh(target);
                            info!(
                                target = %target,
                                action_type = %action.action_type,
                                "Token refreshed, retrying without consuming an attempt"
                            );
                            continue;
                        }
                        Err(error) => {
                            warn!(target = %target, error = %error, "Token refresh failed");
                        }
                    }
                }
            }

            let retryable = policy.is_retryable(classification);
            if !retryable || attempt >= policy.max_attempts {
                warn!(
                    target = %target,
                    action_type = %action.action_type,
                    classification = %classification,
                    retryable = retryable,
                    attempts = attempt,
                    error = %fault,
                    "Execution failed"
                );
                self.events.publish(EventPayload::ExecutionFailed {
                    target: target.to_string(),
                    action_type: action.action_type.clone(),
                    attempts: attempt,
                    classification,
                    retryable,
                });
                return Err(ClassifiedFault::new(classification, retryable, fault)
                    .with_attempts(attempt)
                    .into());
            }

            let delay = next_delay(attempt, policy, hint.as_ref());
            debug!(
                target = %target,
                action_type = %action.action_type,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                classification = %classification,
                "Retrying after backoff"
            );
            self.events.publish(EventPayload::RetryScheduled {
                target: target.to_string(),
                action_type: action.action_type.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                classification,
            });

            if wait_or_cancelled(delay, cancel.as_mut()).await {
                return Err(EnactorError::Cancelled(format!(
                    "{} cancelled between attempts",
                    action.summary()
                )));
            }
            attempt += 1;
        }
    }
}

/// Sleep for `delay`, returning true if the cancel signal fired first.
/// A dropped sender means cancellation can never arrive; keep sleeping.
async fn wait_or_cancelled(
    delay: std::time::Duration,
    cancel: Option<&mut watch::Receiver<bool>>,
) -> bool {
    let Some(cancel) = cancel else {
        tokio::time::sleep(delay).await;
        return false;
    };
    if *cancel.borrow() {
        return true;
    }

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = cancel.changed() => match changed {
                Ok(()) => {
                    if *cancel.borrow() {
                        return true;
                    }
                }
                Err(_) => {
                    sleep.as_mut().await;
                    return false;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn engine(policy: RetryPolicy) -> RetryEngine {
        RetryEngine::new(PolicyRegistry::new(policy), EventBus::default())
    }

    fn action() -> ActionDescriptor {
        ActionDescriptor::new("c-1", "create_task", "crm")
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
            .with_jitter_fraction(0.0)
    }

    struct CountingRefresher {
        calls: AtomicU32,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self, _target: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("token-2".into())
        }
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let engine = engine(fast_policy());
        let result = engine
            .execute(&action(), || async { Ok::<_, FaultPayload>(42) })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(engine.stats().snapshot("crm").unwrap().successes, 1);
    }

    #[tokio::test]
    async fn test_transient_fault_retries_to_success() {
        let engine = engine(fast_policy());
        let attempts = AtomicU32::new(0);

        let result = engine
            .execute(&action(), || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(FaultPayload::new("boom").with_status(503))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_validation_fault_never_retried() {
        let engine = engine(fast_policy().with_max_attempts(10));
        let attempts = AtomicU32::new(0);

        let error = engine
            .execute(&action(), || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(FaultPayload::new("bad request").with_status(400)) }
            })
            .await
            .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        match error {
            EnactorError::Fault(fault) => {
                assert_eq!(fault.classification, FaultClassification::Validation);
                assert!(!fault.retryable);
                assert_eq!(fault.attempts, 1);
            }
            other => panic!("expected classified fault, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_exhausted_attempts_propagate_classified_fault() {
        let engine = engine(fast_policy().with_max_attempts(3));
        let attempts = AtomicU32::new(0);

        let error = engine
            .execute(&action(), || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(FaultPayload::new("boom").with_status(502)) }
            })
            .await
            .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        match error {
            EnactorError::Fault(fault) => {
                assert_eq!(fault.classification, FaultClassification::TransientService);
                assert!(fault.retryable);
                assert_eq!(fault.attempts, 3);
            }
            other => panic!("expected classified fault, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_auth_refresh_is_free_and_single() {
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicU32::new(0),
        });
        let engine = engine(fast_policy().with_max_attempts(1))
            .with_token_refresher(refresher.clone());
        let attempts = AtomicU32::new(0);

        // First call 401s, the refreshed call succeeds. max_attempts=1 shows
        // the refresh retry does not consume an attempt.
        let result = engine
            .execute(&action(), || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(FaultPayload::new("unauthorized").with_status(401))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "ok");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.stats().snapshot("crm").unwrap().auth_refreshes, 1);
    }

    #[tokio::test]
    async fn test_second_auth_fault_propagates() {
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicU32::new(0),
        });
        let engine = engine(fast_policy().with_max_attempts(5))
            .with_token_refresher(refresher.clone());
        let attempts = AtomicU32::new(0);

        let error = engine
            .execute(&action(), || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(FaultPayload::new("forbidden").with_status(403)) }
            })
            .await
            .unwrap_err();

        // One original attempt plus the single free refresh retry.
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        match error {
            EnactorError::Fault(fault) => {
                assert_eq!(fault.classification, FaultClassification::Authorization);
                assert!(!fault.retryable);
            }
            other => panic!("expected classified fault, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_classifies_as_timeout() {
        let engine = engine(
            fast_policy()
                .with_max_attempts(2)
                .with_timeout(Duration::from_millis(10)),
        );

        let error = engine
            .execute(&action(), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, FaultPayload>(())
            })
            .await
            .unwrap_err();

        match error {
            EnactorError::Fault(fault) => {
                assert_eq!(fault.classification, FaultClassification::Timeout);
                assert_eq!(fault.attempts, 2);
            }
            other => panic!("expected classified fault, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_between_attempts() {
        let policy = fast_policy()
            .with_max_attempts(10)
            .with_initial_delay(Duration::from_secs(60))
            .with_max_delay(Duration::from_secs(60));
        let engine = engine(policy);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let handle = {
            let engine = Arc::new(engine);
            let engine2 = engine.clone();
            tokio::spawn(async move {
                engine2
                    .execute_cancellable(
                        &ActionDescriptor::new("c-1", "create_task", "crm"),
                        || async { Err::<(), _>(FaultPayload::new("boom").with_status(503)) },
                        cancel_rx,
                    )
                    .await
            })
        };

        // Let the first attempt fail and the loop settle into its wait.
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_tx.send(true).unwrap();

        let error = handle.await.unwrap().unwrap_err();
        assert!(matches!(error, EnactorError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_per_target_policy_from_registry() {
        let engine = engine(fast_policy().with_max_attempts(3));
        engine
            .policies()
            .set("flaky", fast_policy().with_max_attempts(1));
        let attempts = AtomicU32::new(0);

        let _ = engine
            .execute(&ActionDescriptor::new("c-1", "ping", "flaky"), || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(FaultPayload::new("boom").with_status(503)) }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
