//! Core research data model

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ResearchError;

/// Task identifier, unique within one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// The research question for one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchQuery {
    pub id: Uuid,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl ResearchQuery {
    /// Create a query, rejecting blank text
    pub fn new(text: impl Into<String>) -> Result<Self, ResearchError> {
        let text = text.into().trim().to_string();
        if text.is_empty() {
            return Err(ResearchError::InvalidQuery);
        }

        Ok(Self {
            id: Uuid::new_v4(),
            text,
            created_at: Utc::now(),
        })
    }

    /// Date stamp handed to generation requests
    pub fn current_date(&self) -> String {
        self.created_at.format("%Y-%m-%d").to_string()
    }
}

/// Whether a request runs the full multi-round flow or a single pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchMode {
    #[default]
    Orchestrated,
    SinglePass,
}

/// Ingress: one research request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchRequest {
    pub query: String,
    #[serde(default)]
    pub mode: ResearchMode,
    /// Id stamped on every outgoing frame; generated when absent
    #[serde(default)]
    pub message_id: Option<String>,
}

impl ResearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            mode: ResearchMode::default(),
            message_id: None,
        }
    }

    pub fn single_pass(mut self) -> Self {
        self.mode = ResearchMode::SinglePass;
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

/// A research focus, compared by its normalized form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FocusArea {
    label: String,
    normalized: String,
}

impl FocusArea {
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into().trim().to_string();
        let normalized = normalize_focus(&label);
        Self { label, normalized }
    }

    /// Human-readable form, used as a section title
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Lowercased, punctuation-free, single-spaced form
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    pub fn is_empty(&self) -> bool {
        self.normalized.is_empty()
    }
}

impl PartialEq for FocusArea {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for FocusArea {}

impl std::hash::Hash for FocusArea {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

impl fmt::Display for FocusArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

fn normalize_focus(label: &str) -> String {
    label
        .chars()
        .flat_map(|c| {
            let spaced = if c.is_alphanumeric() { c } else { ' ' };
            spaced.to_lowercase()
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Position of a task: round first, then dispatch index within the round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskOrdinal {
    pub round: u8,
    pub index: usize,
}

impl TaskOrdinal {
    pub fn new(round: u8, index: usize) -> Self {
        Self { round, index }
    }
}

/// Task lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Failed,
}

/// A single research subtask
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub description: String,
    pub focus_area: FocusArea,
    pub ordinal: TaskOrdinal,
    pub status: TaskStatus,
}

impl TaskSpec {
    pub fn new(
        id: TaskId,
        description: impl Into<String>,
        focus_area: FocusArea,
        ordinal: TaskOrdinal,
    ) -> Self {
        Self {
            id,
            description: description.into(),
            focus_area,
            ordinal,
            status: TaskStatus::Pending,
        }
    }

    pub fn round(&self) -> u8 {
        self.ordinal.round
    }
}

/// How much a finding can be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        };
        f.write_str(s)
    }
}

/// Result of executing one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub task_id: TaskId,
    pub ordinal: TaskOrdinal,
    pub focus_area: FocusArea,
    pub summary: String,
    pub key_insights: Vec<String>,
    pub sources_found: usize,
    /// URLs the finding drew on, in retrieval order
    pub sources: Vec<String>,
    pub confidence: Confidence,
    pub produced_at: DateTime<Utc>,
}

impl Finding {
    /// Whether this finding covers its focus area
    pub fn covers_focus(&self) -> bool {
        !self.key_insights.is_empty()
    }
}
