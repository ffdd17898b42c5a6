//! Coverage gap analysis between rounds

use tracing::debug;

use crate::session::ResearchSession;
use crate::types::{Finding, FocusArea, TaskOrdinal, TaskSpec};

/// Decides which requested focus areas still lack coverage
#[derive(Debug, Default)]
pub struct GapAnalyzer;

impl GapAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Requested focus areas no finding covers yet, in requested order
    pub fn uncovered(&self, requested: &[TaskSpec], findings: &[Finding]) -> Vec<FocusArea> {
        requested
            .iter()
            .map(|task| &task.focus_area)
            .filter(|focus| {
                !findings
                    .iter()
                    .any(|f| &f.focus_area == *focus && f.covers_focus())
            })
            .cloned()
            .collect()
    }

    /// Register one follow-up task per gap for `round`.
    ///
    /// Each follow-up inherits the description of the first-round task that
    /// requested its focus area. Workers learn it is a follow-up from the
    /// task's round, so the description stays a clean search query.
    pub fn plan_follow_ups(
        &self,
        session: &ResearchSession,
        requested: &[TaskSpec],
        gaps: &[FocusArea],
        round: u8,
    ) -> Vec<TaskSpec> {
        gaps.iter()
            .enumerate()
            .map(|(index, focus)| {
                let description = requested
                    .iter()
                    .find(|t| &t.focus_area == focus)
                    .map_or(focus.label(), |t| t.description.as_str())
                    .to_string();
                debug!(round, focus = %focus, "Planning follow-up task");
                session.create_task(description, focus.clone(), TaskOrdinal::new(round, index))
            })
            .collect()
    }
}
