//! Worker - executes a single research task

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::WorkerConfig;
use crate::error::{ToolError, WorkerError};
use crate::limiter::RateLimiter;
use crate::provider::{
    generate_final, Collaborators, FetchOptions, FetchProvider, FindingDraft, GenerationRequest,
    Schema, SearchHit, SearchOptions, SearchProvider, StructuredGenerator, MAX_SEARCH_COUNT,
};
use crate::retry::{with_retry, RetryError};
use crate::types::{Confidence, Finding, FocusArea, TaskSpec};

/// Outcome of one tool call after its own retries
enum CallFailure {
    Tool(ToolError),
    Cancelled,
}

/// Tally of tool calls issued for one task
#[derive(Default)]
struct CallLedger {
    attempted: usize,
    succeeded: usize,
    failures: Vec<ToolError>,
}

impl CallLedger {
    fn record<T>(&mut self, result: Result<T, CallFailure>) -> Result<Option<T>, WorkerError> {
        self.attempted += 1;
        match result {
            Ok(value) => {
                self.succeeded += 1;
                Ok(Some(value))
            }
            Err(CallFailure::Tool(err)) => {
                self.failures.push(err);
                Ok(None)
            }
            Err(CallFailure::Cancelled) => Err(WorkerError::Cancelled),
        }
    }

    fn all_failed(&self) -> bool {
        self.attempted > 0 && self.succeeded == 0
    }

    fn only_timeouts(&self) -> bool {
        !self.failures.is_empty() && self.failures.iter().all(ToolError::is_timeout)
    }

    fn success_ratio(&self) -> f64 {
        if self.attempted == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.attempted as f64
    }

    /// Highest confidence the retrieval outcome supports
    fn confidence_ceiling(&self, sources: usize) -> Confidence {
        let ratio = self.success_ratio();
        if ratio >= 1.0 && sources >= 2 {
            Confidence::High
        } else if ratio >= 0.5 && sources >= 1 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }
}

/// Executes one task: searches, fetches the most promising sources,
/// then turns the gathered material into a [`Finding`].
///
/// A worker never creates tasks of its own.
pub struct Worker {
    config: WorkerConfig,
    search: Arc<dyn SearchProvider>,
    fetch: Arc<dyn FetchProvider>,
    generator: Arc<dyn StructuredGenerator>,
    limiter: RateLimiter,
    current_date: String,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        collaborators: &Collaborators,
        limiter: RateLimiter,
        current_date: String,
    ) -> Self {
        Self {
            config,
            search: Arc::clone(&collaborators.search),
            fetch: Arc::clone(&collaborators.fetch),
            generator: Arc::clone(&collaborators.generator),
            limiter,
            current_date,
        }
    }

    /// Run the task to a finding.
    ///
    /// Partial tool failure lowers confidence and trims insights. When every
    /// call fails the task fails, except when all failures were timeouts: then
    /// an empty low-confidence finding is returned.
    #[instrument(skip(self, task, cancel), fields(task_id = %task.id, focus = %task.focus_area))]
    pub async fn execute(
        &self,
        task: &TaskSpec,
        cancel: &CancellationToken,
    ) -> Result<Finding, WorkerError> {
        let fan_out = self.config.effective_fan_out();
        let mut ledger = CallLedger::default();

        // Broad searches first
        let search_options = self.search_options();
        let queries = self.search_queries(task);
        let searches: Vec<_> = queries
            .iter()
            .map(|query| {
                let options = &search_options;
                self.call("search", cancel, move || self.search.search(query, options))
            })
            .collect();
        let search_results: Vec<_> = futures::stream::iter(searches)
            .buffered(fan_out)
            .collect()
            .await;

        let mut hits: Vec<SearchHit> = Vec::new();
        for result in search_results {
            if let Some(found) = ledger.record(result)? {
                for hit in found {
                    if !hits.iter().any(|h| h.url == hit.url) {
                        hits.push(hit);
                    }
                }
            }
        }

        // Then drill into the most promising distinct urls
        let fetch_options = FetchOptions {
            timeout: self.config.call_timeout(),
            headers: self.config.fetch_headers.clone(),
        };
        let targets: Vec<&SearchHit> = hits.iter().take(self.config.max_fetches).collect();
        let fetches: Vec<_> = targets
            .iter()
            .map(|hit| {
                let url = hit.url.as_str();
                let options = &fetch_options;
                self.call("fetch", cancel, move || self.fetch.fetch(url, options))
            })
            .collect();
        let fetch_results: Vec<_> = futures::stream::iter(fetches)
            .buffered(fan_out)
            .collect()
            .await;

        let mut documents = Vec::new();
        for (hit, result) in targets.iter().zip(fetch_results) {
            if let Some(content) = ledger.record(result)? {
                documents.push(json!({ "url": hit.url, "title": hit.title, "content": content }));
            }
        }

        debug!(
            attempted = ledger.attempted,
            succeeded = ledger.succeeded,
            documents = documents.len(),
            "Tool calls finished"
        );

        if ledger.all_failed() {
            if ledger.only_timeouts() {
                warn!(
                    attempted = ledger.attempted,
                    "Every tool call timed out, returning empty finding"
                );
                return Ok(self.empty_finding(task));
            }
            let last = ledger
                .failures
                .pop()
                .unwrap_or_else(|| ToolError::Unavailable("no tool calls issued".into()));
            return Err(WorkerError::AllToolCallsFailed {
                attempted: ledger.attempted,
                last,
            });
        }

        // Fetched documents count as sources; fall back to snippets
        let sources: Vec<String> = if documents.is_empty() {
            targets.iter().map(|h| h.url.clone()).collect()
        } else {
            documents
                .iter()
                .filter_map(|d| d["url"].as_str().map(str::to_string))
                .collect()
        };

        let request = GenerationRequest {
            schema: Schema::Finding,
            subject: task.description.clone(),
            current_date: self.current_date.clone(),
            material: json!({
                "focus_area": task.focus_area.label(),
                "round": task.ordinal.round,
                "follow_up": task.ordinal.round > 1,
                "search_results": hits,
                "documents": documents,
            }),
        };
        let draft: FindingDraft = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
            draft = generate_final(self.generator.as_ref(), request) => {
                draft.map_err(WorkerError::Generation)?
            }
        };

        let ceiling = ledger.confidence_ceiling(sources.len());
        let confidence = draft.confidence.map_or(ceiling, |c| c.min(ceiling));
        let insight_budget = if ledger.failures.is_empty() {
            self.config.max_insights
        } else {
            (self.config.max_insights as f64 * ledger.success_ratio()).ceil() as usize
        };
        let key_insights: Vec<String> = draft
            .key_insights
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .take(insight_budget)
            .collect();

        info!(
            confidence = %confidence,
            insights = key_insights.len(),
            sources = sources.len(),
            "Task finished"
        );

        Ok(Finding {
            task_id: task.id,
            ordinal: task.ordinal,
            focus_area: task.focus_area.clone(),
            summary: draft.summary.trim().to_string(),
            key_insights,
            sources_found: sources.len(),
            sources,
            confidence,
            produced_at: Utc::now(),
        })
    }

    fn search_options(&self) -> SearchOptions {
        SearchOptions {
            count: self.config.results_per_search.clamp(1, MAX_SEARCH_COUNT),
            country: self.config.country.clone(),
            search_lang: self.config.search_lang.clone(),
        }
    }

    /// Description first, then the focus area if it says something different
    pub(crate) fn search_queries(&self, task: &TaskSpec) -> Vec<String> {
        let mut queries = vec![task.description.clone()];
        let focus = task.focus_area.label();
        if !focus.is_empty() && task.focus_area != FocusArea::new(task.description.as_str()) {
            queries.push(focus.to_string());
        }
        queries.truncate(self.config.searches_per_task.max(1));
        queries
    }

    fn empty_finding(&self, task: &TaskSpec) -> Finding {
        Finding {
            task_id: task.id,
            ordinal: task.ordinal,
            focus_area: task.focus_area.clone(),
            summary: format!("No sources could be retrieved for {}.", task.focus_area),
            key_insights: Vec::new(),
            sources_found: 0,
            sources: Vec::new(),
            confidence: Confidence::Low,
            produced_at: Utc::now(),
        }
    }

    /// One tool call under the shared limiter, its own timeout and retries
    async fn call<T, F, Fut>(
        &self,
        kind: &'static str,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, CallFailure>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ToolError>>,
    {
        let timeout = self.config.call_timeout();
        let limiter = &self.limiter;
        let result = with_retry(&self.config.retry, cancel, kind, ToolError::is_transient, |_| {
            let call = op();
            async move {
                let _permit = limiter.acquire().await?;
                match tokio::time::timeout(timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(ToolError::Timeout(timeout.as_millis() as u64)),
                }
            }
        })
        .await;

        match result {
            Ok(value) => Ok(value),
            Err(RetryError::Cancelled) => Err(CallFailure::Cancelled),
            Err(RetryError::Failed { attempts, error }) => {
                warn!(call = kind, attempts, error = %error, "Tool call failed");
                Err(CallFailure::Tool(error))
            }
        }
    }
}
