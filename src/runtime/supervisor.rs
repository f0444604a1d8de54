// src/runtime/supervisor.rs
use std::future::Future;
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;

use super::TaskId;
use crate::error::Result;

/// Aborts the attempt when the supervisor itself is aborted or dropped.
struct AbortOnDrop(JoinHandle<Result<()>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run a task forever: whenever an attempt ends with an error or a panic, wait
/// `restart_delay` and start a fresh attempt, which re-attaches from the journal.
/// A clean `Ok(())` ends supervision.
pub fn spawn_supervised<F, Fut>(task: TaskId, restart_delay: Duration, mut factory: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut restarts: u64 = 0;
        loop {
            let mut attempt = AbortOnDrop(tokio::spawn(factory()));
            match (&mut attempt.0).await {
                Ok(Ok(())) => {
                    tracing::info!(target: "runtime", task = %task, "task finished");
                    return;
                }
                Ok(Err(e)) if e.is_scheduler_fault() => {
                    tracing::error!(target: "runtime", task = %task, error = %e, restarts, "scheduler fault, restarting task from journal");
                }
                Ok(Err(e)) => {
                    tracing::error!(target: "runtime", task = %task, error = %e, restarts, "task failed, restarting");
                }
                Err(join_err) if join_err.is_cancelled() => {
                    tracing::info!(target: "runtime", task = %task, "task cancelled");
                    return;
                }
                Err(join_err) => {
                    tracing::error!(target: "runtime", task = %task, error = %join_err, restarts, "task panicked, restarting");
                }
            }
            restarts += 1;
            counter!("pipeline_task_restarts_total", "task" => task.to_string()).increment(1);
            tokio::time::sleep(restart_delay).await;
        }
    })
}
