//! Retry policy engine: bounded retries with capped exponential backoff.
//!
//! Every outbound call (scrape, analyze, store) goes through here. Two shapes exist:
//! the default policy treats every failure as transient and surfaces a terminal error
//! on exhaustion; the rate-limit-aware policy only retries `RateLimited` and lets the
//! caller degrade to an empty result when the quota never frees up.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ActionError, PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    /// Any failure is retryable.
    Default,
    /// Only quota rejections are retryable; other failures surface at once.
    RateLimitAware,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub backoff_coefficient: f64,
    /// Adds `random() * jitter_fraction * delay` to each backoff delay.
    pub jitter_fraction: Option<f64>,
    pub mode: RetryMode,
    /// Upper bound on a single attempt; elapsing counts as a failed attempt.
    pub action_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            max_attempts: 3,
            backoff_coefficient: 2.0,
            jitter_fraction: None,
            mode: RetryMode::Default,
            action_timeout: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// 2s base, doubling, full uniform jitter, 3 attempts.
    pub fn rate_limited() -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            jitter_fraction: Some(1.0),
            mode: RetryMode::RateLimitAware,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_intervals(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_interval = initial;
        self.max_interval = max;
        self
    }

    pub fn with_jitter(mut self, fraction: Option<f64>) -> Self {
        self.jitter_fraction = fraction;
        self
    }

    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    /// Same policy with `action_timeout` read as a per-unit budget for an action that
    /// processes `units` things one after another.
    pub fn per_unit_timeout(&self, units: usize) -> Self {
        let units = u32::try_from(units.max(1)).unwrap_or(u32::MAX);
        Self {
            action_timeout: self.action_timeout.saturating_mul(units),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(PipelineError::Config("max_attempts must be >= 1".into()));
        }
        if self.initial_interval.is_zero() || self.max_interval < self.initial_interval {
            return Err(PipelineError::Config(format!(
                "retry intervals must satisfy 0 < initial ({:?}) <= max ({:?})",
                self.initial_interval, self.max_interval
            )));
        }
        if !self.backoff_coefficient.is_finite() || self.backoff_coefficient < 1.0 {
            return Err(PipelineError::Config(
                "backoff_coefficient must be a finite value >= 1.0".into(),
            ));
        }
        if let Some(j) = self.jitter_fraction {
            if !(0.0..=1.0).contains(&j) {
                return Err(PipelineError::Config(
                    "jitter_fraction must be within [0, 1]".into(),
                ));
            }
        }
        if self.action_timeout.is_zero() {
            return Err(PipelineError::Config("action_timeout must be > 0".into()));
        }
        Ok(())
    }

    /// Un-jittered delay before retry number `retry` (1-based).
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exp = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exp);
        let capped = secs.min(self.max_interval.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_interval)
    }

    fn delay_for(&self, retry: u32) -> Duration {
        let base = self.backoff_delay(retry);
        match self.jitter_fraction {
            Some(j) if j > 0.0 => {
                let extra = base.as_secs_f64() * j * rand::random::<f64>();
                let total = (base.as_secs_f64() + extra).min(self.max_interval.as_secs_f64());
                Duration::try_from_secs_f64(total).unwrap_or(base)
            }
            _ => base,
        }
    }
}

/// Result of driving an action through a policy, plus what it took to get there.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    pub attempts: u32,
    /// Backoff delays actually slept, in order.
    pub delays: Vec<Duration>,
    /// True when a rate-limit exhaustion was replaced by the fallback value.
    pub degraded: bool,
}

impl<T> RetryOutcome<T> {
    pub fn into_result(self) -> Result<T> {
        self.result
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

enum Stop {
    Exhausted(ActionError),
    NonRetryable(ActionError),
}

impl Stop {
    fn into_error(self, action: &str, attempts: u32) -> PipelineError {
        let last = match self {
            Stop::Exhausted(e) | Stop::NonRetryable(e) => e,
        };
        PipelineError::TerminalActionFailure {
            action: action.to_string(),
            attempts,
            last,
        }
    }
}

async fn drive<T, F, Fut>(
    action: &str,
    policy: &RetryPolicy,
    mut op: F,
) -> (std::result::Result<T, Stop>, u32, Vec<Duration>)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ActionError>>,
{
    let mut attempts = 0u32;
    let mut delays = Vec::new();

    loop {
        attempts += 1;
        counter!("pipeline_action_attempts_total", "action" => action.to_string()).increment(1);

        let res = match tokio::time::timeout(policy.action_timeout, op()).await {
            Ok(r) => r,
            Err(_) => Err(ActionError::TimedOut(policy.action_timeout)),
        };

        let err = match res {
            Ok(v) => {
                if attempts > 1 {
                    debug!(target: "retry", action, attempts, "action succeeded after retry");
                }
                return (Ok(v), attempts, delays);
            }
            Err(e) => e,
        };

        let retryable = match policy.mode {
            RetryMode::Default => true,
            RetryMode::RateLimitAware => err.is_rate_limited(),
        };
        if !retryable {
            warn!(target: "retry", action, attempts, kind = err.kind(), error = %err, "non-retryable failure");
            return (Err(Stop::NonRetryable(err)), attempts, delays);
        }
        if attempts >= policy.max_attempts {
            warn!(target: "retry", action, attempts, kind = err.kind(), error = %err, "retries exhausted");
            return (Err(Stop::Exhausted(err)), attempts, delays);
        }

        let delay = policy.delay_for(attempts);
        warn!(
            target: "retry",
            action,
            attempt = attempts,
            kind = err.kind(),
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "action failed, backing off"
        );
        counter!("pipeline_action_retries_total", "action" => action.to_string()).increment(1);
        delays.push(delay);
        tokio::time::sleep(delay).await;
    }
}

/// Run `op` under `policy`; any stop is surfaced as `TerminalActionFailure`.
pub async fn execute<T, F, Fut>(action: &str, policy: &RetryPolicy, op: F) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ActionError>>,
{
    let (res, attempts, delays) = drive(action, policy, op).await;
    RetryOutcome {
        result: res.map_err(|stop| stop.into_error(action, attempts)),
        attempts,
        delays,
        degraded: false,
    }
}

/// Like [`execute`], but under the rate-limit-aware policy an exhaustion caused by
/// `RateLimited` yields `fallback()` instead of an error.
pub async fn execute_or_else<T, F, Fut, D>(
    action: &str,
    policy: &RetryPolicy,
    op: F,
    fallback: D,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ActionError>>,
    D: FnOnce() -> T,
{
    let (res, attempts, delays) = drive(action, policy, op).await;
    match res {
        Ok(v) => RetryOutcome {
            result: Ok(v),
            attempts,
            delays,
            degraded: false,
        },
        Err(Stop::Exhausted(e))
            if policy.mode == RetryMode::RateLimitAware && e.is_rate_limited() =>
        {
            warn!(target: "retry", action, attempts, "rate limit never cleared, degrading to empty result");
            RetryOutcome {
                result: Ok(fallback()),
                attempts,
                delays,
                degraded: true,
            }
        }
        Err(stop) => RetryOutcome {
            result: Err(stop.into_error(action, attempts)),
            attempts,
            delays,
            degraded: false,
        },
    }
}

pub async fn execute_or_default<T, F, Fut>(
    action: &str,
    policy: &RetryPolicy,
    op: F,
) -> RetryOutcome<T>
where
    T: Default,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ActionError>>,
{
    execute_or_else(action, policy, op, T::default).await
}
