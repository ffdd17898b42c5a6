//! The round state machine driving one research request

use std::fmt;

use tracing::{error, info, instrument, warn};

use crate::decomposer::Decomposer;
use crate::dispatcher::Dispatcher;
use crate::error::ResearchError;
use crate::gap::GapAnalyzer;
use crate::report::Report;
use crate::session::SessionHandle;
use crate::synthesizer::Synthesizer;
use crate::types::{ResearchMode, TaskSpec};

/// Where a request is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    Analyzing,
    Dispatching,
    AwaitingResults,
    GapCheck,
    Iterating,
    Synthesizing,
    Done,
    Failed,
}

impl RoundState {
    pub fn name(self) -> &'static str {
        match self {
            RoundState::Analyzing => "ANALYZING",
            RoundState::Dispatching => "DISPATCHING",
            RoundState::AwaitingResults => "AWAITING_RESULTS",
            RoundState::GapCheck => "GAP_CHECK",
            RoundState::Iterating => "ITERATING",
            RoundState::Synthesizing => "SYNTHESIZING",
            RoundState::Done => "DONE",
            RoundState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RoundState::Done | RoundState::Failed)
    }

    /// Whether `next` is a legal successor
    pub fn can_transition_to(self, next: RoundState) -> bool {
        use RoundState::*;

        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Failed)
                | (Analyzing, Dispatching)
                | (Dispatching, AwaitingResults)
                | (AwaitingResults, GapCheck)
                | (GapCheck, Iterating)
                | (GapCheck, Synthesizing)
                | (Iterating, Dispatching)
                | (Synthesizing, Done)
        )
    }
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Runs decomposition, bounded rounds of dispatch and gap checks, then
/// synthesis, for one session
pub struct RoundController {
    session: SessionHandle,
    state: RoundState,
    round: u8,
    decomposer: Decomposer,
    dispatcher: Dispatcher,
    analyzer: GapAnalyzer,
}

impl RoundController {
    pub fn new(session: SessionHandle) -> Self {
        let decomposer = Decomposer::new(session.config.task_limit());
        let dispatcher = Dispatcher::new(&session.config);

        Self {
            session,
            state: RoundState::Analyzing,
            round: 0,
            decomposer,
            dispatcher,
            analyzer: GapAnalyzer::new(),
        }
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    /// Rounds dispatched so far
    pub fn rounds(&self) -> u8 {
        self.round
    }

    /// Rounds this request may run in total
    pub fn max_rounds(&self) -> u8 {
        match self.session.mode {
            ResearchMode::SinglePass => 1,
            ResearchMode::Orchestrated => 1 + self.session.config.follow_up_rounds(),
        }
    }

    pub fn transition(&mut self, next: RoundState) -> Result<(), ResearchError> {
        if !self.state.can_transition_to(next) {
            return Err(ResearchError::InvalidTransition {
                from: self.state.name(),
                to: next.name(),
            });
        }
        info!(from = %self.state, to = %next, round = self.round, "State transition");
        self.state = next;
        Ok(())
    }

    /// Drive the request to a finished report.
    ///
    /// Any error moves the machine to `FAILED`.
    #[instrument(skip_all, fields(query_id = %self.session.id(), mode = ?self.session.mode))]
    pub async fn run(&mut self, synthesizer: &mut Synthesizer) -> Result<Report, ResearchError> {
        match self.drive(synthesizer).await {
            Ok(report) => Ok(report),
            Err(e) => {
                if !self.state.is_terminal() {
                    self.state = RoundState::Failed;
                }
                match e {
                    ResearchError::Cancelled => warn!(round = self.round, "Research cancelled"),
                    _ => error!(round = self.round, error = %e, "Research failed"),
                }
                Err(e)
            }
        }
    }

    async fn drive(&mut self, synthesizer: &mut Synthesizer) -> Result<Report, ResearchError> {
        let session = self.session.clone();
        synthesizer.begin(&session.query.text)?;

        let requested = self.decomposer.decompose(&session).await?;
        let mut pending: Vec<TaskSpec> = requested.clone();
        let max_rounds = self.max_rounds();

        loop {
            self.round += 1;
            self.transition(RoundState::Dispatching)?;
            let in_flight = self.dispatcher.dispatch(&session, std::mem::take(&mut pending));
            info!(round = self.round, tasks = in_flight.task_count(), "Round dispatched");

            self.transition(RoundState::AwaitingResults)?;
            in_flight.collect().await?;

            self.transition(RoundState::GapCheck)?;
            if session.mode == ResearchMode::SinglePass {
                break;
            }

            let gaps = self.analyzer.uncovered(&requested, &session.findings());
            if gaps.is_empty() {
                info!(round = self.round, "All focus areas covered");
                break;
            }
            if self.round >= max_rounds {
                warn!(
                    round = self.round,
                    gaps = gaps.len(),
                    "Round budget exhausted with gaps remaining"
                );
                break;
            }

            self.transition(RoundState::Iterating)?;
            pending = self
                .analyzer
                .plan_follow_ups(&session, &requested, &gaps, self.round + 1);
        }

        self.reconcile_gaps(&requested);

        self.transition(RoundState::Synthesizing)?;
        let report = synthesizer.synthesize(&session).await?;
        self.transition(RoundState::Done)?;

        info!(
            rounds = self.round,
            findings = session.findings().len(),
            gaps = session.gaps().len(),
            "Research complete"
        );
        Ok(report)
    }

    /// Make the session's gaps exactly the requested areas still uncovered
    fn reconcile_gaps(&self, requested: &[TaskSpec]) {
        let uncovered = self.analyzer.uncovered(requested, &self.session.findings());
        for task in requested {
            if uncovered.contains(&task.focus_area) {
                self.session.record_gap(task.focus_area.clone());
            } else {
                self.session.clear_gap(&task.focus_area);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Schema;
    use crate::report::Snapshot;
    use crate::testing::{
        fast_config, test_session, test_session_with_mode, Fakes, FailMode, ScriptedFetch,
        ScriptedGenerator, ScriptedSearch,
    };
    use crate::types::{Confidence, FocusArea, TaskStatus};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn synthesizer() -> (Synthesizer, mpsc::UnboundedReceiver<Snapshot>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Synthesizer::new(tx), rx)
    }

    fn policy_fakes() -> Fakes {
        Fakes::new(
            ScriptedSearch::new(),
            ScriptedFetch::new(),
            ScriptedGenerator::new().with_plan(&[
                ("Research outcomes of policy A", "Policy A outcomes"),
                ("Research outcomes of policy B", "Policy B outcomes"),
            ]),
        )
    }

    #[test]
    fn test_transition_table() {
        use RoundState::*;

        assert!(Analyzing.can_transition_to(Dispatching));
        assert!(GapCheck.can_transition_to(Iterating));
        assert!(GapCheck.can_transition_to(Synthesizing));
        assert!(Iterating.can_transition_to(Dispatching));
        assert!(AwaitingResults.can_transition_to(Failed));

        assert!(!Analyzing.can_transition_to(Synthesizing));
        assert!(!Dispatching.can_transition_to(GapCheck));
        assert!(!Done.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Dispatching));
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let fakes = Fakes::healthy();
        let mut controller = RoundController::new(test_session("q", fast_config(), &fakes));

        let err = controller.transition(RoundState::Synthesizing).unwrap_err();
        assert!(matches!(
            err,
            ResearchError::InvalidTransition {
                from: "ANALYZING",
                to: "SYNTHESIZING"
            }
        ));
        assert_eq!(controller.state(), RoundState::Analyzing);
    }

    #[tokio::test]
    async fn test_scenario_policy_comparison_single_round() {
        let fakes = policy_fakes();
        let query = "Compare outcomes of policy A vs policy B";
        let session = test_session(query, fast_config(), &fakes);
        let mut controller = RoundController::new(session.clone());
        let (mut synthesizer, _rx) = synthesizer();

        let report = controller.run(&mut synthesizer).await.unwrap();

        assert_eq!(controller.state(), RoundState::Done);
        assert_eq!(controller.rounds(), 1);
        let titles: Vec<&str> = report.sections().iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["Policy A outcomes", "Policy B outcomes"]);
        assert!(session
            .findings()
            .iter()
            .all(|f| f.confidence == Confidence::High));
        assert!(session.gaps().is_empty());
        assert!(session.tasks().iter().all(|t| t.status == TaskStatus::Done));

        let date = session.query.current_date();
        let requests = fakes.generator.requests.lock();
        // plan, two findings, summary
        assert_eq!(requests.len(), 4);
        assert!(requests.iter().all(|r| r.current_date == date));
    }

    #[tokio::test]
    async fn test_scenario_all_tool_calls_time_out() {
        let fakes = Fakes::new(
            ScriptedSearch::new().failing(FailMode::Timeout),
            ScriptedFetch::new(),
            ScriptedGenerator::new().with_plan(&[("Look into it", "Only area")]),
        );
        let mut config = fast_config();
        config.max_follow_up_rounds = 0;
        let session = test_session("q", config, &fakes);
        let mut controller = RoundController::new(session.clone());
        let (mut synthesizer, _rx) = synthesizer();

        let report = controller.run(&mut synthesizer).await.unwrap();

        let findings = session.findings();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].confidence, Confidence::Low);
        assert_eq!(findings[0].sources_found, 0);
        assert_eq!(session.gaps(), vec![FocusArea::new("Only area")]);
        assert_eq!(report.sections().last().unwrap().title, "Unresolved Gaps");
    }

    #[tokio::test]
    async fn test_rounds_never_exceed_budget() {
        let fakes = Fakes::new(
            ScriptedSearch::new(),
            ScriptedFetch::new(),
            ScriptedGenerator::new()
                .with_plan(&[("a", "Alpha"), ("b", "Beta")])
                .with_partials(Schema::Finding, vec![json!({"summary": "Nothing found"})]),
        );
        let session = test_session("q", fast_config(), &fakes);
        let mut controller = RoundController::new(session.clone());
        let (mut synthesizer, _rx) = synthesizer();

        controller.run(&mut synthesizer).await.unwrap();

        assert_eq!(controller.rounds(), 3);
        assert_eq!(fakes.generator.request_count(Schema::Finding), 6);
        assert_eq!(session.tasks_in_round(3).len(), 2);
        assert!(session.tasks_in_round(4).is_empty());
        assert_eq!(session.gaps().len(), 2);
    }

    #[tokio::test]
    async fn test_follow_up_round_closes_gap() {
        let fakes = Fakes::new(
            ScriptedSearch::new(),
            ScriptedFetch::new(),
            ScriptedGenerator::new()
                .with_plan(&[("Research Alpha", "Alpha"), ("Research Beta", "Beta")])
                .empty_first_round_finding_for("Research Beta"),
        );
        let session = test_session("q", fast_config(), &fakes);
        let mut controller = RoundController::new(session.clone());
        let (mut synthesizer, _rx) = synthesizer();

        let report = controller.run(&mut synthesizer).await.unwrap();

        assert_eq!(controller.rounds(), 2);
        let follow_ups = session.tasks_in_round(2);
        assert_eq!(follow_ups.len(), 1);
        assert_eq!(follow_ups[0].focus_area, FocusArea::new("Beta"));
        assert_eq!(follow_ups[0].description, "Research Beta");
        assert!(session.gaps().is_empty());

        // The follow-up lands under round one's Beta section
        let titles: Vec<&str> = report.sections().iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["Alpha", "Beta"]);
        assert_eq!(report.sections()[1].subsections[0].title, "Round 2 follow-up");
    }

    #[tokio::test]
    async fn test_single_pass_skips_planning_and_gap_check() {
        let fakes = Fakes::healthy();
        let session = test_session_with_mode(
            "What is a monad?",
            ResearchMode::SinglePass,
            fast_config(),
            &fakes,
        );
        let mut controller = RoundController::new(session.clone());
        let (mut synthesizer, _rx) = synthesizer();

        controller.run(&mut synthesizer).await.unwrap();

        assert_eq!(controller.rounds(), 1);
        assert_eq!(controller.max_rounds(), 1);
        assert_eq!(fakes.generator.request_count(Schema::TaskPlan), 0);
        assert_eq!(session.tasks().len(), 1);
        assert_eq!(session.tasks()[0].description, "What is a monad?");
    }

    #[tokio::test]
    async fn test_title_snapshot_precedes_decomposition() {
        let fakes = Fakes::new(
            ScriptedSearch::new(),
            ScriptedFetch::new(),
            ScriptedGenerator::new().with_plan(&[]),
        );
        let session = test_session("???", fast_config(), &fakes);
        let mut controller = RoundController::new(session);
        let (mut synthesizer, mut rx) = synthesizer();

        let err = controller.run(&mut synthesizer).await.unwrap_err();

        assert!(matches!(err, ResearchError::DecompositionFailure(_)));
        assert_eq!(controller.state(), RoundState::Failed);
        assert_eq!(rx.try_recv().unwrap().text, "# ???");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_synthesis_failure_fails_request() {
        let fakes = Fakes::new(
            ScriptedSearch::new(),
            ScriptedFetch::new(),
            ScriptedGenerator::new().failing(Schema::ExecutiveSummary),
        );
        let session = test_session("q", fast_config(), &fakes);
        let mut controller = RoundController::new(session);
        let (mut synthesizer, _rx) = synthesizer();

        let err = controller.run(&mut synthesizer).await.unwrap_err();
        assert!(matches!(err, ResearchError::SynthesisFailure(_)));
        assert_eq!(controller.state(), RoundState::Failed);
    }
}
