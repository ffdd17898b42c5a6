//! The research report and its snapshots
//!
//! A [`Report`] is built strictly front to back: title, executive summary,
//! sections, key takeaways, sources. Each mutation either appends a new
//! element or extends the element currently being written, so the markdown
//! rendering of any version is a prefix of the rendering of every later one.

use serde::{Deserialize, Serialize};

use crate::error::ReportError;

/// One titled block of the report, rendered under `##`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub title: String,
    pub content: String,
    /// Rendered under `###` after the content
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subsections: Vec<Subsection>,
}

impl Section {
    pub fn new(title: impl AsRef<str>, content: impl AsRef<str>) -> Self {
        Self {
            title: single_line(title.as_ref()),
            content: content.as_ref().trim().to_string(),
            subsections: Vec::new(),
        }
    }

    pub fn with_subsection(mut self, title: impl AsRef<str>, content: impl AsRef<str>) -> Self {
        self.push_subsection(title, content);
        self
    }

    pub fn push_subsection(&mut self, title: impl AsRef<str>, content: impl AsRef<str>) {
        self.subsections.push(Subsection {
            title: single_line(title.as_ref()),
            content: content.as_ref().trim().to_string(),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subsection {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Empty,
    Title,
    Summary,
    Sections,
    Takeaways,
    Sources,
    Final,
}

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Stage::Empty => "nothing",
            Stage::Title => "title",
            Stage::Summary => "executive summary",
            Stage::Sections => "sections",
            Stage::Takeaways => "key takeaways",
            Stage::Sources => "sources",
            Stage::Final => "finalization",
        }
    }
}

/// The synthesized document. Only the synthesizer holds it mutably.
#[derive(Debug, Clone)]
pub struct Report {
    title: String,
    executive_summary: String,
    sections: Vec<Section>,
    key_takeaways: Vec<String>,
    sources: Vec<String>,
    version: u64,
    stage: Stage,
}

impl Report {
    pub fn new() -> Self {
        Self {
            title: String::new(),
            executive_summary: String::new(),
            sections: Vec::new(),
            key_takeaways: Vec::new(),
            sources: Vec::new(),
            version: 0,
            stage: Stage::Empty,
        }
    }

    fn advance(&mut self, field: &'static str, target: Stage) -> Result<(), ReportError> {
        if self.stage == Stage::Final {
            return Err(ReportError::Finalized);
        }
        if self.stage > target {
            return Err(ReportError::OutOfOrder {
                field,
                stage: self.stage.name(),
            });
        }
        if target > Stage::Title && self.stage == Stage::Empty {
            return Err(ReportError::OutOfOrder {
                field,
                stage: Stage::Empty.name(),
            });
        }
        self.stage = target;
        self.version += 1;
        Ok(())
    }

    pub fn set_title(&mut self, title: &str) -> Result<(), ReportError> {
        if self.stage >= Stage::Title && self.stage != Stage::Final {
            return Err(ReportError::FieldAlreadySet("title"));
        }
        self.advance("title", Stage::Title)?;
        self.title = single_line(title);
        Ok(())
    }

    /// Replace the summary with `text`, which must extend what is already there.
    /// Returns false when `text` adds nothing.
    pub fn extend_executive_summary(&mut self, text: &str) -> Result<bool, ReportError> {
        if !text.starts_with(self.executive_summary.as_str()) {
            return Err(ReportError::NonMonotonic("executive summary"));
        }
        if text.len() == self.executive_summary.len() {
            return Ok(false);
        }
        self.advance("executive summary", Stage::Summary)?;
        self.executive_summary = text.to_string();
        Ok(true)
    }

    pub fn push_section(&mut self, section: Section) -> Result<(), ReportError> {
        self.advance("section", Stage::Sections)?;
        self.sections.push(section);
        Ok(())
    }

    pub fn push_takeaway(&mut self, takeaway: &str) -> Result<(), ReportError> {
        self.advance("key takeaway", Stage::Takeaways)?;
        self.key_takeaways.push(single_line(takeaway));
        Ok(())
    }

    pub fn push_source(&mut self, source: &str) -> Result<(), ReportError> {
        self.advance("source", Stage::Sources)?;
        self.sources.push(single_line(source));
        Ok(())
    }

    /// Close the document; the rendering gains its trailing newline
    pub fn finalize(&mut self) -> Result<(), ReportError> {
        self.advance("finalization", Stage::Final)
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn executive_summary(&self) -> &str {
        &self.executive_summary
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn key_takeaways(&self) -> &[String] {
        &self.key_takeaways
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Bumped by every mutation
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_finalized(&self) -> bool {
        self.stage == Stage::Final
    }

    /// Markdown rendering.
    ///
    /// Every block after the title opens with its own separator and nothing
    /// trails the last written element, which keeps renderings prefix-stable.
    pub fn render(&self) -> String {
        let mut md = String::new();
        if self.stage == Stage::Empty {
            return md;
        }

        md.push_str("# ");
        md.push_str(&self.title);

        if !self.executive_summary.is_empty() {
            md.push_str("\n\n## Executive Summary\n\n");
            md.push_str(&self.executive_summary);
        }

        for section in &self.sections {
            md.push_str("\n\n## ");
            md.push_str(&section.title);
            if !section.content.is_empty() {
                md.push_str("\n\n");
                md.push_str(&section.content);
            }
            for sub in &section.subsections {
                md.push_str("\n\n### ");
                md.push_str(&sub.title);
                if !sub.content.is_empty() {
                    md.push_str("\n\n");
                    md.push_str(&sub.content);
                }
            }
        }

        if !self.key_takeaways.is_empty() {
            md.push_str("\n\n## Key Takeaways\n");
            for (i, takeaway) in self.key_takeaways.iter().enumerate() {
                md.push_str(&format!("\n{}. {}", i + 1, takeaway));
            }
        }

        if !self.sources.is_empty() {
            md.push_str("\n\n## Sources\n");
            for source in &self.sources {
                md.push_str("\n- ");
                md.push_str(source);
            }
        }

        if self.stage == Stage::Final {
            md.push('\n');
        }

        md
    }

    /// Freeze the current rendering
    pub fn snapshot(&self, sequence: u64) -> Snapshot {
        Snapshot {
            sequence,
            version: self.version,
            text: self.render(),
        }
    }
}

impl Default for Report {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable rendering of a report version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Strictly increasing per request
    pub sequence: u64,
    pub version: u64,
    pub text: String,
}

fn single_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
