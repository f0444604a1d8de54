// src/error.rs
//! Error taxonomy shared by the retry engine, the tasks and the runtime.

use std::time::Duration;

/// What a single attempt of an external action reports.
///
/// `Failed` and `TimedOut` are the transient class; `RateLimited` is kept apart so the
/// rate-limit-aware policy can react to quota rejections only.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl ActionError {
    pub fn failed(msg: impl std::fmt::Display) -> Self {
        Self::Failed(anyhow::anyhow!("{msg}"))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    /// Short label used for log fields and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited(_) => "rate_limited",
            Self::TimedOut(_) => "timed_out",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Retries exhausted, or the active policy refuses to retry this failure.
    #[error("{action} failed after {attempts} attempt(s): {last}")]
    TerminalActionFailure {
        action: String,
        attempts: u32,
        #[source]
        last: ActionError,
    },

    /// The durable store is unusable. Fatal to the affected task; the supervisor
    /// restarts it from its journal.
    #[error("scheduler fault: {0:#}")]
    SchedulerFault(anyhow::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn scheduler(err: impl Into<anyhow::Error>) -> Self {
        Self::SchedulerFault(err.into())
    }

    pub fn is_scheduler_fault(&self) -> bool {
        matches!(self, Self::SchedulerFault(_))
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
