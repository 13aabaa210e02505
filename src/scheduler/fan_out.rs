//! Concurrent per-address work with a join barrier

use super::JobKind;
use crate::error::ReconcilerResult;
use crate::metrics;

use futures::future::join_all;
use std::future::Future;
use tracing::{error, warn};

/// Result of one fanned-out task
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome<T> {
    Completed(T),
    Failed(String),
    Panicked(String),
}

impl<T> TaskOutcome<T> {
    pub fn is_failure(&self) -> bool {
        !matches!(self, TaskOutcome::Completed(_))
    }
}

/// Spawn every task and wait for all of them.
///
/// Each task runs on its own tokio task, so an error or a panic stays with
/// its label and never reaches the siblings or the caller.
pub async fn fan_out<T, F>(job: JobKind, tasks: Vec<(String, F)>) -> Vec<(String, TaskOutcome<T>)>
where
    T: Send + 'static,
    F: Future<Output = ReconcilerResult<T>> + Send + 'static,
{
    let (labels, handles): (Vec<_>, Vec<_>) = tasks
        .into_iter()
        .map(|(label, task)| (label, tokio::spawn(task)))
        .unzip();

    let joined = join_all(handles).await;

    labels
        .into_iter()
        .zip(joined)
        .map(|(label, result)| {
            let outcome = match result {
                Ok(Ok(value)) => TaskOutcome::Completed(value),
                Ok(Err(e)) => {
                    if e.is_retryable() {
                        warn!("{} task {} failed, retrying next tick: {}", job, label, e);
                    } else {
                        error!("{} task {} failed: {}", job, label, e);
                    }
                    metrics::record_task_failure(job.name());
                    TaskOutcome::Failed(e.to_string())
                }
                Err(e) if e.is_panic() => {
                    error!("{} task {} panicked: {}", job, label, e);
                    metrics::record_task_failure(job.name());
                    TaskOutcome::Panicked(e.to_string())
                }
                Err(e) => {
                    warn!("{} task {} was cancelled: {}", job, label, e);
                    metrics::record_task_failure(job.name());
                    TaskOutcome::Failed(e.to_string())
                }
            };
            (label, outcome)
        })
        .collect()
}
