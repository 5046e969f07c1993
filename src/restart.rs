//! Restart with exponential backoff.
//!
//! The delay for attempt `n` is `initial × multiplier^n`, clamped to `max`.
//! A run that stayed up for at least `reset_after` starts a new incident, so
//! the next delay goes back to `initial`.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::RunError;
use crate::scope::{Scope, StopReason};

/// Retry backoff policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay before the first restart.
    pub initial: Duration,
    /// Growth factor between consecutive restarts.
    pub multiplier: f64,
    /// Upper bound for any single delay.
    pub max: Duration,
    /// Uptime after which the attempt counter resets.
    pub reset_after: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(15),
            reset_after: Duration::from_secs(15),
        }
    }
}

impl Backoff {
    /// Delay before restart number `attempt` (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// How one run of a supervised process ended.
#[derive(Debug)]
pub enum Outcome {
    /// Exited with status 0. Never restarted.
    Clean,
    /// Failed or exited unsuccessfully. Restarted after a delay.
    Abnormal(RunError),
    /// Stopped because its scope finished.
    Stopped(StopReason),
}

/// Calls `run` until it ends cleanly or `scope` finishes.
///
/// Every abnormal outcome is reported to `on_retry` together with the delay
/// about to be waited. The wait ends early when the scope finishes. The
/// returned outcome is never [`Outcome::Abnormal`].
pub async fn with_restarts<F, Fut>(
    policy: &Backoff,
    scope: &Scope,
    mut run: F,
    mut on_retry: impl FnMut(&RunError, Duration),
) -> Outcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Outcome>,
{
    let mut attempt: u32 = 0;
    loop {
        if let Some(reason) = scope.stop_reason() {
            return Outcome::Stopped(reason);
        }

        let started = Instant::now();
        let err = match run().await {
            Outcome::Abnormal(err) => err,
            done => return done,
        };

        if started.elapsed() >= policy.reset_after {
            attempt = 0;
        }
        let delay = policy.delay(attempt);
        attempt = attempt.saturating_add(1);
        on_retry(&err, delay);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            reason = scope.done() => return Outcome::Stopped(reason),
        }
    }
}
