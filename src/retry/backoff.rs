//! Backoff computation: shape, cap, jitter, rate-limit hint override.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::classify::RateLimitHint;
use super::policy::RetryPolicy;

/// Safety margin added on top of a server-provided retry hint.
pub const RATE_LIMIT_BUFFER: Duration = Duration::from_secs(5);

/// Curve used to grow the delay between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffShape {
    #[default]
    Exponential,
    Linear,
    Fixed,
    Fibonacci,
}

impl BackoffShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exponential => "exponential",
            Self::Linear => "linear",
            Self::Fixed => "fixed",
            Self::Fibonacci => "fibonacci",
        }
    }
}

impl std::fmt::Display for BackoffShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Delay to wait after the `attempt`-th failure.
///
/// A usable rate-limit hint overrides the computed backoff entirely: the
/// server said when its window resets, so we honor that plus a buffer and
/// skip jitter. Otherwise the shape grows the delay from `initial_delay`,
/// capped at `max_delay`, then perturbed by the jitter fraction.
pub fn next_delay(attempt: u32, policy: &RetryPolicy, hint: Option<&RateLimitHint>) -> Duration {
    if let Some(hint) = hint {
        if let Some(wait) = hint.wait_from(Utc::now()) {
            return wait + RATE_LIMIT_BUFFER;
        }
    }

    apply_jitter(base_delay(attempt, policy), policy.jitter_fraction)
}

fn base_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let attempt = attempt.max(1);
    let initial = policy.initial_delay.as_secs_f64();
    let cap = policy.max_delay.as_secs_f64();

    let raw = match policy.backoff_shape {
        BackoffShape::Exponential => {
            let exponent = (attempt - 1).min(63) as i32;
            initial * policy.multiplier.powi(exponent)
        }
        BackoffShape::Linear => initial * attempt as f64,
        BackoffShape::Fixed => initial,
        BackoffShape::Fibonacci => initial * fibonacci(attempt) as f64,
    };

    // min() also absorbs an overflow to infinity from large exponents.
    Duration::from_secs_f64(raw.min(cap))
}

/// Perturb by up to ±`fraction` to spread out synchronized retries.
/// A zero fraction keeps delays deterministic.
fn apply_jitter(delay: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 || delay.is_zero() {
        return delay;
    }
    let offset = rand::thread_rng().gen_range(-fraction..=fraction);
    Duration::from_secs_f64((delay.as_secs_f64() * (1.0 + offset)).max(0.0))
}

/// fib(1) = fib(2) = 1, saturating instead of overflowing.
fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 1..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}
