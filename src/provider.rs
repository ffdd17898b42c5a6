//! External collaborator interfaces
//!
//! Search, fetch and structured generation are supplied by the embedding
//! application. The engine only relies on the contracts below.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToolError;
use crate::types::Confidence;

/// Maximum results a single search may ask for
pub const MAX_SEARCH_COUNT: usize = 20;

/// One search result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Parameters of one search call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchOptions {
    /// At most this many hits, within `1..=MAX_SEARCH_COUNT`
    pub count: usize,
    pub country: String,
    pub search_lang: String,
}

/// Parameters of one fetch call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    pub timeout: Duration,
    pub headers: BTreeMap<String, String>,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Ordered results for `query`, at most `options.count` of them
    async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>, ToolError>;
}

#[async_trait]
pub trait FetchProvider: Send + Sync {
    /// Raw content behind `url`; implementations honor `options.timeout`
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<String, ToolError>;
}

/// Target shape of a generation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schema {
    /// [`TaskPlan`]
    TaskPlan,
    /// [`FindingDraft`]
    Finding,
    /// [`SummaryDraft`]
    ExecutiveSummary,
}

/// Input to the structured generation provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub schema: Schema,
    /// What the output is about: the query or the task description
    pub subject: String,
    pub current_date: String,
    /// Gathered material the output must be grounded on
    pub material: Value,
}

/// Progressively more complete instances of the requested schema.
/// Every item is valid against the schema; the last one is the result.
pub type PartialStream = BoxStream<'static, Result<Value, ToolError>>;

#[async_trait]
pub trait StructuredGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<PartialStream, ToolError>;
}

/// Drain a generation stream and decode its final instance
pub async fn generate_final<T: DeserializeOwned>(
    generator: &dyn StructuredGenerator,
    request: GenerationRequest,
) -> Result<T, ToolError> {
    let schema = request.schema;
    let mut stream = generator.generate(request).await?;
    let mut last = None;
    while let Some(item) = stream.next().await {
        last = Some(item?);
    }

    let value = last.ok_or_else(|| {
        ToolError::InvalidResponse(format!("{schema:?} generation produced no output"))
    })?;
    decode(value)
}

/// Decode one instance into its typed form
pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ToolError> {
    serde_json::from_value(value).map_err(|e| ToolError::InvalidResponse(e.to_string()))
}

/// Decomposition output
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskPlan {
    pub tasks: Vec<PlannedTask>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannedTask {
    pub description: String,
    pub focus_area: String,
}

/// Worker finding before the engine stamps ids and confidence
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FindingDraft {
    pub summary: String,
    pub key_insights: Vec<String>,
    pub confidence: Option<Confidence>,
}

/// Executive summary text, growing across partial instances
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryDraft {
    pub text: String,
}

/// The collaborator set handed to each request
#[derive(Clone)]
pub struct Collaborators {
    pub search: Arc<dyn SearchProvider>,
    pub fetch: Arc<dyn FetchProvider>,
    pub generator: Arc<dyn StructuredGenerator>,
}

impl Collaborators {
    pub fn new(
        search: Arc<dyn SearchProvider>,
        fetch: Arc<dyn FetchProvider>,
        generator: Arc<dyn StructuredGenerator>,
    ) -> Self {
        Self {
            search,
            fetch,
            generator,
        }
    }
}
