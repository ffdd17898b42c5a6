//! Bounded-concurrency dispatch of one round of tasks

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ResearchConfig, RetryPolicy};
use crate::error::{ResearchError, WorkerError};
use crate::retry::{with_retry, RetryError};
use crate::session::SessionHandle;
use crate::types::{Finding, FocusArea, TaskSpec, TaskStatus};

/// What a round produced
#[derive(Debug, Default)]
pub struct RoundOutcome {
    /// Findings in dispatch order
    pub findings: Vec<Finding>,
    /// Focus areas of tasks that exhausted their retries
    pub failed: Vec<FocusArea>,
}

type TaskResult = (usize, TaskSpec, Result<Finding, RetryError<WorkerError>>);

/// Runs tasks on workers with at most `concurrency_limit` in flight
pub struct Dispatcher {
    concurrency_limit: usize,
    worker_timeout: Duration,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(config: &ResearchConfig) -> Self {
        Self {
            concurrency_limit: config.concurrency_limit.max(1),
            worker_timeout: config.worker_timeout(),
            retry: config.task_retry_policy(),
        }
    }

    /// Spawn every task onto a worker; at most `concurrency_limit` run at once
    #[instrument(skip_all, fields(query_id = %session.id(), tasks = tasks.len()))]
    pub fn dispatch(&self, session: &SessionHandle, tasks: Vec<TaskSpec>) -> InFlightRound {
        let slots = Arc::new(Semaphore::new(self.concurrency_limit));
        let mut set: JoinSet<TaskResult> = JoinSet::new();
        let dispatched = tasks.clone();

        for (index, task) in tasks.into_iter().enumerate() {
            let slots = Arc::clone(&slots);
            let session = session.clone();
            let retry = self.retry.clone();
            let worker_timeout = self.worker_timeout;

            set.spawn(async move {
                let _slot = match slots.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (index, task, Err(RetryError::Cancelled)),
                };
                let result = run_task(&session, &task, &retry, worker_timeout).await;
                (index, task, result)
            });
        }

        debug!(limit = self.concurrency_limit, "Round dispatched");
        InFlightRound {
            session: session.clone(),
            dispatched,
            set,
        }
    }

    /// Dispatch and wait for the whole round
    pub async fn dispatch_round(
        &self,
        session: &SessionHandle,
        tasks: Vec<TaskSpec>,
    ) -> Result<RoundOutcome, ResearchError> {
        self.dispatch(session, tasks).collect().await
    }
}

/// A dispatched round whose workers may still be running
pub struct InFlightRound {
    session: SessionHandle,
    dispatched: Vec<TaskSpec>,
    set: JoinSet<TaskResult>,
}

impl InFlightRound {
    /// Tasks dispatched in this round
    pub fn task_count(&self) -> usize {
        self.dispatched.len()
    }

    /// Wait until every task resolves to a finding or a recorded failure.
    ///
    /// Returns `Cancelled` if the session is cancelled before the round ends;
    /// findings gathered so far are still recorded on the session.
    pub async fn collect(mut self) -> Result<RoundOutcome, ResearchError> {
        let session = &self.session;
        let mut results: Vec<Option<Result<Finding, RetryError<WorkerError>>>> =
            self.dispatched.iter().map(|_| None).collect();
        let cancel = session.cancel_token().clone();

        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.set.abort_all();
                    break;
                }
                joined = self.set.join_next() => joined,
            };

            match joined {
                Some(Ok((index, _, result))) => results[index] = Some(result),
                Some(Err(e)) => error!(error = %e, "Task panicked"),
                None => break,
            }
        }

        let mut outcome = RoundOutcome::default();
        for (task, result) in self.dispatched.iter().zip(results) {
            match result {
                Some(Ok(finding)) => {
                    mark(session, task, TaskStatus::Done);
                    outcome.findings.push(finding);
                }
                Some(Err(RetryError::Cancelled)) => {}
                Some(Err(RetryError::Failed { attempts, error })) => {
                    warn!(task_id = %task.id, attempts, error = %error, "Task failed");
                    fail(session, task, &mut outcome);
                }
                None if cancel.is_cancelled() => {}
                None => fail(session, task, &mut outcome),
            }
        }

        session.record_findings(outcome.findings.iter().cloned());

        if cancel.is_cancelled() {
            info!(findings = outcome.findings.len(), "Round cancelled");
            return Err(ResearchError::Cancelled);
        }

        info!(
            findings = outcome.findings.len(),
            failed = outcome.failed.len(),
            "Round finished"
        );
        Ok(outcome)
    }
}

fn fail(session: &SessionHandle, task: &TaskSpec, outcome: &mut RoundOutcome) {
    mark(session, task, TaskStatus::Failed);
    session.record_gap(task.focus_area.clone());
    outcome.failed.push(task.focus_area.clone());
}

async fn run_task(
    session: &SessionHandle,
    task: &TaskSpec,
    retry: &RetryPolicy,
    worker_timeout: Duration,
) -> Result<Finding, RetryError<WorkerError>> {
    mark(session, task, TaskStatus::InProgress);
    let worker = session.worker();
    let cancel = session.cancel_token();
    let timeout_ms = worker_timeout.as_millis() as u64;
    let label = format!("task {}", task.id);

    let worker = &worker;
    with_retry(
        retry,
        cancel,
        &label,
        |e: &WorkerError| !matches!(e, WorkerError::Cancelled),
        move |attempt| async move {
            debug!(task_id = %task.id, attempt, "Starting worker");
            match tokio::time::timeout(worker_timeout, worker.execute(task, cancel)).await {
                Ok(result) => result,
                Err(_) => Err(WorkerError::Timeout(timeout_ms)),
            }
        },
    )
    .await
}

fn mark(session: &SessionHandle, task: &TaskSpec, status: TaskStatus) {
    if let Err(e) = session.set_task_status(task.id, status) {
        warn!(error = %e, "Could not update task status");
    }
}
