//! # Delve
//!
//! Multi-round research orchestration with streamed reports.
//!
//! A query is decomposed into focused tasks, the tasks run on workers in
//! bounded rounds, coverage gaps trigger follow-up rounds, and the findings
//! are synthesized into a markdown report that is streamed to the caller as
//! append-only text deltas while it is being written.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        ORCHESTRATOR (per request)                    │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐               │
//! │  │  Decomposer  │  │ Gap Analyzer │  │ Synthesizer  │──► Snapshots  │
//! │  └──────────────┘  └──────────────┘  └──────────────┘       │       │
//! └────────────────────────────┬────────────────────────────────┼───────┘
//!                              │ rounds (at most 1 + 2)         ▼
//!                      ┌───────┴───────┐               ┌───────────────┐
//!                      │  Dispatcher   │               │ Delta Streamer│
//!                      └───────┬───────┘               └───────┬───────┘
//!          ┌───────────────────┼───────────────────┐           ▼
//!          ▼                   ▼                   ▼        text-delta
//!   ┌─────────────┐     ┌─────────────┐     ┌─────────────┐   frames
//!   │   Worker    │     │   Worker    │     │   Worker    │
//!   └──────┬──────┘     └──────┬──────┘     └──────┬──────┘
//!          └──────── shared rate limiter ──────────┘
//!                   search / fetch / generate
//! ```
//!
//! ## Key Concepts
//!
//! - **Task**: one focused unit of research with a stable dispatch ordinal
//! - **Finding**: what a worker learned for a task, with a confidence grade
//! - **Round**: one dispatch of tasks; follow-up rounds target uncovered areas
//! - **Snapshot**: an immutable rendering of the report, always extending the last
//! - **Collaborators**: search, fetch and structured generation supplied by the caller

pub mod channel;
pub mod config;
pub mod controller;
pub mod decomposer;
pub mod dispatcher;
pub mod error;
pub mod gap;
pub mod limiter;
pub mod orchestrator;
pub mod provider;
pub mod report;
pub mod retry;
pub mod session;
pub mod stream;
pub mod synthesizer;
pub mod types;
pub mod worker;

#[cfg(test)]
mod testing;

pub use channel::ResearchChannel;
pub use config::{ResearchConfig, RetryPolicy, WorkerConfig};
pub use controller::{RoundController, RoundState};
pub use error::{ResearchError, ToolError};
pub use limiter::RateLimiter;
pub use orchestrator::ResearchOrchestrator;
pub use provider::{
    Collaborators, FetchOptions, FetchProvider, GenerationRequest, PartialStream, Schema,
    SearchHit, SearchOptions, SearchProvider, StructuredGenerator,
};
pub use report::{Report, Section, Snapshot, Subsection};
pub use session::{ResearchSession, SessionHandle};
pub use stream::{CancelReason, DeltaChunk, DeltaStreamer, StreamFrame};
pub use types::{
    Confidence, Finding, FocusArea, ResearchMode, ResearchQuery, ResearchRequest, TaskId,
    TaskOrdinal, TaskSpec, TaskStatus,
};
