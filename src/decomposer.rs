//! Query decomposition into first-round tasks

use serde_json::json;
use tracing::{info, instrument, warn};

use crate::error::ResearchError;
use crate::provider::{generate_final, GenerationRequest, Schema, TaskPlan};
use crate::session::ResearchSession;
use crate::types::{FocusArea, ResearchMode, TaskOrdinal, TaskSpec};

/// Turns a query into 1..=`max_tasks` tasks with distinct focus areas
pub struct Decomposer {
    max_tasks: usize,
}

impl Decomposer {
    pub fn new(max_tasks: usize) -> Self {
        Self {
            max_tasks: max_tasks.max(1),
        }
    }

    /// Produce and register the first round of tasks.
    ///
    /// A failed or empty plan degrades to one task covering the whole query.
    #[instrument(skip_all, fields(query_id = %session.query.id))]
    pub async fn decompose(
        &self,
        session: &ResearchSession,
    ) -> Result<Vec<TaskSpec>, ResearchError> {
        let planned = match session.mode {
            ResearchMode::SinglePass => Vec::new(),
            ResearchMode::Orchestrated => self.plan(session).await?,
        };

        let planned = if planned.is_empty() {
            vec![whole_query(&session.query.text)?]
        } else {
            planned
        };

        let tasks: Vec<TaskSpec> = planned
            .into_iter()
            .enumerate()
            .map(|(index, (description, focus))| {
                session.create_task(description, focus, TaskOrdinal::new(1, index))
            })
            .collect();

        info!(tasks = tasks.len(), "Query decomposed");
        Ok(tasks)
    }

    async fn plan(
        &self,
        session: &ResearchSession,
    ) -> Result<Vec<(String, FocusArea)>, ResearchError> {
        let request = GenerationRequest {
            schema: Schema::TaskPlan,
            subject: session.query.text.clone(),
            current_date: session.query.current_date(),
            material: json!({ "max_tasks": self.max_tasks }),
        };

        let cancel = session.cancel_token();
        let generator = session.collaborators().generator.as_ref();
        let plan: Result<TaskPlan, _> = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ResearchError::Cancelled),
            plan = generate_final(generator, request) => plan,
        };

        match plan {
            Ok(plan) => {
                let tasks = distinct_tasks(plan, self.max_tasks);
                if tasks.is_empty() {
                    warn!("Decomposition produced no usable tasks, using whole query");
                }
                Ok(tasks)
            }
            Err(e) => {
                warn!(error = %e, "Decomposition failed, using whole query");
                Ok(Vec::new())
            }
        }
    }
}

/// Clean a plan: fill blank fields from each other, drop duplicates by
/// normalized focus area, keep at most `limit`
pub fn distinct_tasks(plan: TaskPlan, limit: usize) -> Vec<(String, FocusArea)> {
    let mut tasks: Vec<(String, FocusArea)> = Vec::new();

    for planned in plan.tasks {
        let description = planned.description.trim();
        let focus = planned.focus_area.trim();
        let (description, focus) = match (description.is_empty(), focus.is_empty()) {
            (true, true) => continue,
            (true, false) => (focus, focus),
            (false, true) => (description, description),
            (false, false) => (description, focus),
        };

        let focus = FocusArea::new(focus);
        if focus.is_empty() || tasks.iter().any(|(_, f)| *f == focus) {
            continue;
        }
        tasks.push((description.to_string(), focus));
        if tasks.len() == limit {
            break;
        }
    }

    tasks
}

fn whole_query(text: &str) -> Result<(String, FocusArea), ResearchError> {
    let focus = FocusArea::new(text);
    if focus.is_empty() {
        return Err(ResearchError::DecompositionFailure(
            "query has no researchable content".into(),
        ));
    }
    Ok((text.to_string(), focus))
}
