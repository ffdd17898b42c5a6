//! Request-scoped research session

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ResearchConfig;
use crate::error::ResearchError;
use crate::limiter::RateLimiter;
use crate::provider::Collaborators;
use crate::types::{
    Finding, FocusArea, ResearchMode, ResearchQuery, TaskId, TaskOrdinal, TaskSpec, TaskStatus,
};
use crate::worker::Worker;

/// Everything one research request owns: its query, task registry,
/// accumulated findings, recorded gaps and cancellation scope.
pub struct ResearchSession {
    pub query: ResearchQuery,
    pub mode: ResearchMode,
    pub config: Arc<ResearchConfig>,
    collaborators: Collaborators,
    /// Shared with other requests when the orchestrator hands out one limiter
    limiter: RateLimiter,
    cancel: CancellationToken,
    /// Tasks in creation order
    tasks: RwLock<Vec<TaskSpec>>,
    next_task: AtomicU32,
    findings: RwLock<Vec<Finding>>,
    gaps: RwLock<Vec<FocusArea>>,
}

impl ResearchSession {
    pub fn new(
        query: ResearchQuery,
        mode: ResearchMode,
        config: Arc<ResearchConfig>,
        collaborators: Collaborators,
        limiter: RateLimiter,
        cancel: CancellationToken,
    ) -> Self {
        info!(query_id = %query.id, mode = ?mode, "Creating research session");

        Self {
            query,
            mode,
            config,
            collaborators,
            limiter,
            cancel,
            tasks: RwLock::new(Vec::new()),
            next_task: AtomicU32::new(1),
            findings: RwLock::new(Vec::new()),
            gaps: RwLock::new(Vec::new()),
        }
    }

    /// Register a new pending task and return it
    pub fn create_task(
        &self,
        description: impl Into<String>,
        focus_area: FocusArea,
        ordinal: TaskOrdinal,
    ) -> TaskSpec {
        let id = TaskId(self.next_task.fetch_add(1, Ordering::SeqCst));
        let task = TaskSpec::new(id, description, focus_area, ordinal);
        self.tasks.write().push(task.clone());

        debug!(
            task_id = %id,
            round = ordinal.round,
            index = ordinal.index,
            focus = %task.focus_area,
            "Created task"
        );
        task
    }

    pub fn set_task_status(&self, id: TaskId, status: TaskStatus) -> Result<(), ResearchError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(ResearchError::TaskNotFound(id))?;
        task.status = status;
        Ok(())
    }

    pub fn task(&self, id: TaskId) -> Option<TaskSpec> {
        self.tasks.read().iter().find(|t| t.id == id).cloned()
    }

    pub fn tasks(&self) -> Vec<TaskSpec> {
        self.tasks.read().clone()
    }

    pub fn tasks_in_round(&self, round: u8) -> Vec<TaskSpec> {
        self.tasks
            .read()
            .iter()
            .filter(|t| t.round() == round)
            .cloned()
            .collect()
    }

    pub fn record_findings(&self, findings: impl IntoIterator<Item = Finding>) {
        self.findings.write().extend(findings);
    }

    /// All findings so far, in dispatch order across rounds
    pub fn findings(&self) -> Vec<Finding> {
        let mut findings = self.findings.read().clone();
        findings.sort_by_key(|f| f.ordinal);
        findings
    }

    /// Record a focus area left uncovered; duplicates are ignored
    pub fn record_gap(&self, focus_area: FocusArea) {
        let mut gaps = self.gaps.write();
        if !gaps.contains(&focus_area) {
            gaps.push(focus_area);
        }
    }

    pub fn clear_gap(&self, focus_area: &FocusArea) {
        self.gaps.write().retain(|g| g != focus_area);
    }

    pub fn gaps(&self) -> Vec<FocusArea> {
        self.gaps.read().clone()
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Build a worker bound to this session's collaborators and limiter
    pub fn worker(&self) -> Worker {
        Worker::new(
            self.config.worker.clone(),
            &self.collaborators,
            self.limiter.clone(),
            self.query.current_date(),
        )
    }
}

/// Shared handle to a session
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<ResearchSession>,
}

impl SessionHandle {
    pub fn new(session: ResearchSession) -> Self {
        Self {
            inner: Arc::new(session),
        }
    }

    pub fn id(&self) -> uuid::Uuid {
        self.inner.query.id
    }
}

impl std::ops::Deref for SessionHandle {
    type Target = ResearchSession;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
