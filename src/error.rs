//! Research error types

use thiserror::Error;

use crate::types::TaskId;

/// Failures reported by an external collaborator (search, fetch, generation)
#[derive(Debug, Error)]
pub enum ToolError {
    /// The call did not complete within its timeout
    #[error("Call timed out after {0}ms")]
    Timeout(u64),

    /// The provider asked us to slow down
    #[error("Rate limited by provider")]
    RateLimited,

    /// The provider could not be reached or returned a server error
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// The provider answered with something we cannot use
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Any other provider failure
    #[error("Provider error: {0}")]
    Provider(#[from] anyhow::Error),
}

impl ToolError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ToolError::Timeout(_) | ToolError::RateLimited | ToolError::Unavailable(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ToolError::Timeout(_))
    }
}

/// Failures of a single worker attempt
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Every tool call issued for the task failed
    #[error("All {attempted} tool calls failed: {last}")]
    AllToolCallsFailed { attempted: usize, last: ToolError },

    /// The finding could not be produced from the gathered material
    #[error("Finding generation failed: {0}")]
    Generation(ToolError),

    /// The whole attempt exceeded the worker timeout
    #[error("Worker timed out after {0}ms")]
    Timeout(u64),

    /// The request was cancelled while the worker was running
    #[error("Worker cancelled")]
    Cancelled,
}

/// Violations of the report's append-only construction order
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReportError {
    #[error("{field} cannot be written after {stage} has started")]
    OutOfOrder {
        field: &'static str,
        stage: &'static str,
    },

    #[error("{0} is already set")]
    FieldAlreadySet(&'static str),

    #[error("{0} update does not extend the text already written")]
    NonMonotonic(&'static str),

    #[error("Report is finalized")]
    Finalized,
}

/// Delta stream contract violations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    /// A snapshot is not an append-only extension of the previous one
    #[error(
        "Snapshot {sequence} does not extend the previously streamed {streamed_len} bytes"
    )]
    IntegrityViolation { sequence: u64, streamed_len: usize },

    /// Snapshots arrived out of production order
    #[error("Snapshot {got} arrived after snapshot {previous}")]
    OutOfOrderSnapshot { previous: u64, got: u64 },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Errors that end a research request
#[derive(Debug, Error)]
pub enum ResearchError {
    /// Query text is empty after trimming
    #[error("Query is empty")]
    InvalidQuery,

    /// Not even a single whole-query task could be produced
    #[error("Decomposition failed: {0}")]
    DecompositionFailure(String),

    /// The report could not be built
    #[error("Synthesis failed: {0}")]
    SynthesisFailure(String),

    /// A streamed document would have been corrupted
    #[error("Stream integrity violation: {0}")]
    StreamIntegrityViolation(#[from] StreamError),

    /// The round state machine was driven along an edge it does not have
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Unknown task referenced
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Request timed out after {0}ms")]
    TimedOut(u64),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<ReportError> for ResearchError {
    fn from(err: ReportError) -> Self {
        ResearchError::SynthesisFailure(err.to_string())
    }
}

pub type Result<T, E = ResearchError> = std::result::Result<T, E>;
