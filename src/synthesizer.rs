//! Report synthesis from accumulated findings
//!
//! The synthesizer is the only writer of the [`Report`]. After every
//! mutation it publishes an immutable [`Snapshot`] so the delta streamer can
//! forward the document while it is still being written.

use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use crate::error::ResearchError;
use crate::provider::{decode, GenerationRequest, Schema, SummaryDraft};
use crate::report::{Report, Section, Snapshot};
use crate::session::ResearchSession;
use crate::types::{Finding, FocusArea};

/// Builds the report front to back and publishes snapshots as it goes
pub struct Synthesizer {
    report: Report,
    sequence: u64,
    snapshots: mpsc::UnboundedSender<Snapshot>,
}

impl Synthesizer {
    pub fn new(snapshots: mpsc::UnboundedSender<Snapshot>) -> Self {
        Self {
            report: Report::new(),
            sequence: 0,
            snapshots,
        }
    }

    pub fn report(&self) -> &Report {
        &self.report
    }

    /// Write and publish the title
    pub fn begin(&mut self, title: &str) -> Result<(), ResearchError> {
        self.report.set_title(title)?;
        self.publish();
        Ok(())
    }

    /// Build the rest of the document from the session's findings and gaps.
    ///
    /// Sections follow task creation order, so identical findings always
    /// produce identical text no matter when each one completed.
    #[instrument(skip_all, fields(query_id = %session.query.id))]
    pub async fn synthesize(&mut self, session: &ResearchSession) -> Result<Report, ResearchError> {
        if self.report.title().is_empty() {
            self.begin(&session.query.text)?;
        }

        let findings = session.findings();
        let gaps = session.gaps();
        info!(findings = findings.len(), gaps = gaps.len(), "Synthesizing report");

        self.stream_summary(session, &findings, &gaps).await?;

        for section in sections(&findings) {
            self.check_cancelled(session)?;
            self.report.push_section(section)?;
            self.publish();
        }

        if !gaps.is_empty() {
            self.report
                .push_section(Section::new("Unresolved Gaps", gaps_body(&gaps)))?;
            self.publish();
        }

        for takeaway in takeaways(&findings) {
            self.check_cancelled(session)?;
            self.report.push_takeaway(&takeaway)?;
            self.publish();
        }

        for source in sources(&findings) {
            self.check_cancelled(session)?;
            self.report.push_source(&source)?;
            self.publish();
        }

        self.check_cancelled(session)?;
        self.report.finalize()?;
        self.publish();

        info!(
            version = self.report.version(),
            sections = self.report.sections().len(),
            "Report finalized"
        );
        Ok(self.report.clone())
    }

    /// Feed each partial summary into the report as it arrives
    async fn stream_summary(
        &mut self,
        session: &ResearchSession,
        findings: &[Finding],
        gaps: &[FocusArea],
    ) -> Result<(), ResearchError> {
        let request = GenerationRequest {
            schema: Schema::ExecutiveSummary,
            subject: session.query.text.clone(),
            current_date: session.query.current_date(),
            material: json!({
                "findings": findings
                    .iter()
                    .map(|f| json!({
                        "focus_area": f.focus_area.label(),
                        "summary": f.summary,
                        "key_insights": f.key_insights,
                        "confidence": f.confidence,
                    }))
                    .collect::<Vec<_>>(),
                "unresolved_gaps": gaps.iter().map(|g| g.label()).collect::<Vec<_>>(),
            }),
        };

        let cancel = session.cancel_token();
        let generator = session.collaborators().generator.as_ref();
        let mut partials = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ResearchError::Cancelled),
            stream = generator.generate(request) => stream.map_err(synthesis_failure)?,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ResearchError::Cancelled),
                next = partials.next() => next,
            };
            let Some(partial) = next else { break };

            let draft: SummaryDraft = decode(partial.map_err(synthesis_failure)?)
                .map_err(synthesis_failure)?;
            if self.report.extend_executive_summary(draft.text.trim())? {
                debug!(len = self.report.executive_summary().len(), "Summary extended");
                self.publish();
            }
        }

        if self.report.executive_summary().is_empty() {
            let fallback = fallback_summary(findings, gaps);
            self.report.extend_executive_summary(&fallback)?;
            self.publish();
        }
        Ok(())
    }

    fn check_cancelled(&self, session: &ResearchSession) -> Result<(), ResearchError> {
        if session.is_cancelled() {
            return Err(ResearchError::Cancelled);
        }
        Ok(())
    }

    fn publish(&mut self) {
        self.sequence += 1;
        if self.snapshots.send(self.report.snapshot(self.sequence)).is_err() {
            debug!(sequence = self.sequence, "Snapshot receiver dropped");
        }
    }
}

fn synthesis_failure(e: crate::error::ToolError) -> ResearchError {
    ResearchError::SynthesisFailure(e.to_string())
}

/// One section per focus area in order of first appearance. Findings from
/// later rounds for the same area become `Round N follow-up` subsections.
fn sections(findings: &[Finding]) -> Vec<Section> {
    let mut grouped: Vec<(&FocusArea, Section)> = Vec::new();
    for finding in findings {
        match grouped.iter_mut().find(|(focus, _)| **focus == finding.focus_area) {
            Some((_, section)) => {
                let title = format!("Round {} follow-up", finding.ordinal.round);
                section.push_subsection(title, section_body(finding));
            }
            None => grouped.push((
                &finding.focus_area,
                Section::new(finding.focus_area.label(), section_body(finding)),
            )),
        }
    }
    grouped.into_iter().map(|(_, section)| section).collect()
}

fn section_body(finding: &Finding) -> String {
    let mut body = finding.summary.clone();
    if body.is_empty() {
        body.push_str("No usable material was found for this area.");
    }
    for insight in &finding.key_insights {
        body.push_str("\n\n- ");
        body.push_str(insight);
    }
    body.push_str(&format!(
        "\n\n_Confidence: {}, {} sources_",
        finding.confidence, finding.sources_found
    ));
    body
}

fn gaps_body(gaps: &[FocusArea]) -> String {
    let mut body =
        String::from("The following areas remained uncovered after the last research round:\n");
    for gap in gaps {
        body.push_str("\n- ");
        body.push_str(gap.label());
    }
    body
}

fn fallback_summary(findings: &[Finding], gaps: &[FocusArea]) -> String {
    let covered = findings.iter().filter(|f| f.covers_focus()).count();
    format!(
        "Research produced {} findings, {} with key insights, and left {} areas uncovered.",
        findings.len(),
        covered,
        gaps.len()
    )
}

/// First insight of each finding, without repeats
fn takeaways(findings: &[Finding]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for insight in findings.iter().filter_map(|f| f.key_insights.first()) {
        if !out.iter().any(|t| t.eq_ignore_ascii_case(insight)) {
            out.push(insight.clone());
        }
    }
    out
}

/// Union of finding sources in section order
fn sources(findings: &[Finding]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for url in findings.iter().flat_map(|f| f.sources.iter()) {
        if !out.contains(url) {
            out.push(url.clone());
        }
    }
    out
}
