//! In-memory collaborators for tests

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::config::ResearchConfig;
use crate::error::ToolError;
use crate::limiter::RateLimiter;
use crate::provider::{
    Collaborators, FetchOptions, FetchProvider, GenerationRequest, PartialStream, Schema,
    SearchHit, SearchOptions, SearchProvider, StructuredGenerator,
};
use crate::session::{ResearchSession, SessionHandle};
use crate::types::{ResearchMode, ResearchQuery};

/// How a scripted call fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    Timeout,
    Unavailable,
    Invalid,
}

impl FailMode {
    fn error(self) -> ToolError {
        match self {
            FailMode::Timeout => ToolError::Timeout(1),
            FailMode::Unavailable => ToolError::Unavailable("scripted outage".into()),
            FailMode::Invalid => ToolError::InvalidResponse("scripted garbage".into()),
        }
    }
}

/// Tracks calls in flight and the peak seen
#[derive(Debug, Default)]
pub struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

impl InFlight {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

fn slug(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect()
}

/// Search returning `count` deterministic hits per query
#[derive(Default)]
pub struct ScriptedSearch {
    fail_all: Option<FailMode>,
    hits_per_query: Option<usize>,
    delay: Option<Duration>,
    pub calls: InFlight,
    /// Options of every call, in call order
    pub seen: Mutex<Vec<SearchOptions>>,
}

impl ScriptedSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, mode: FailMode) -> Self {
        self.fail_all = Some(mode);
        self
    }

    pub fn with_hits(mut self, n: usize) -> Self {
        self.hits_per_query = Some(n);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl SearchProvider for ScriptedSearch {
    async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>, ToolError> {
        self.seen.lock().push(options.clone());
        self.calls.enter();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.exit();

        if let Some(mode) = self.fail_all {
            return Err(mode.error());
        }

        let n = self.hits_per_query.unwrap_or(2).min(options.count);
        Ok((0..n)
            .map(|i| SearchHit {
                title: format!("{query} #{i}"),
                url: format!("https://example.com/{}/{i}", slug(query)),
                snippet: format!("About {query}"),
            })
            .collect())
    }
}

/// Fetch echoing the url, with optional failures and a delay
#[derive(Default)]
pub struct ScriptedFetch {
    failures: Vec<(String, FailMode)>,
    delay: Option<Duration>,
    pub calls: InFlight,
    /// Headers of every call, in call order
    pub headers: Mutex<Vec<BTreeMap<String, String>>>,
}

impl ScriptedFetch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every url containing `needle`
    pub fn failing_on(mut self, needle: &str, mode: FailMode) -> Self {
        self.failures.push((needle.to_string(), mode));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl FetchProvider for ScriptedFetch {
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<String, ToolError> {
        self.headers.lock().push(options.headers.clone());
        self.calls.enter();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.exit();

        if let Some((_, mode)) = self.failures.iter().find(|(n, _)| url.contains(n.as_str())) {
            return Err(mode.error());
        }
        Ok(format!("Content of {url}"))
    }
}

/// Generator replaying scripted partial instances per schema.
///
/// Without a script, findings and summaries are derived from the request
/// subject so the output is deterministic.
#[derive(Default)]
pub struct ScriptedGenerator {
    scripts: HashMap<Schema, Vec<Value>>,
    failing: Vec<Schema>,
    finding_delays: Vec<(String, Duration)>,
    empty_findings: Vec<String>,
    pub requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partials(mut self, schema: Schema, partials: Vec<Value>) -> Self {
        self.scripts.insert(schema, partials);
        self
    }

    /// Script a decomposition plan of `(description, focus_area)` pairs
    pub fn with_plan(self, tasks: &[(&str, &str)]) -> Self {
        let tasks: Vec<Value> = tasks
            .iter()
            .map(|(d, f)| json!({"description": d, "focus_area": f}))
            .collect();
        self.with_partials(
            Schema::TaskPlan,
            vec![json!({"tasks": []}), json!({ "tasks": tasks })],
        )
    }

    pub fn failing(mut self, schema: Schema) -> Self {
        self.failing.push(schema);
        self
    }

    /// Delay finding generation for subjects containing `needle`
    pub fn slow_finding_on(mut self, needle: &str, delay: Duration) -> Self {
        self.finding_delays.push((needle.to_string(), delay));
        self
    }

    /// First-round findings for exactly this subject come back without insights
    pub fn empty_first_round_finding_for(mut self, subject: &str) -> Self {
        self.empty_findings.push(subject.to_string());
        self
    }

    pub fn request_count(&self, schema: Schema) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.schema == schema)
            .count()
    }

    fn default_partials(request: &GenerationRequest) -> Vec<Value> {
        match request.schema {
            Schema::TaskPlan => vec![json!({
                "tasks": [{"description": request.subject, "focus_area": request.subject}]
            })],
            Schema::Finding => vec![
                json!({"summary": "Findings"}),
                json!({
                    "summary": format!("Findings for {}", request.subject),
                    "key_insights": [
                        format!("{} insight one", request.subject),
                        format!("{} insight two", request.subject),
                    ],
                    "confidence": "high"
                }),
            ],
            Schema::ExecutiveSummary => vec![
                json!({"text": "Overview"}),
                json!({"text": format!("Overview of {}", request.subject)}),
                json!({"text": format!("Overview of {}.", request.subject)}),
            ],
        }
    }
}

#[async_trait]
impl StructuredGenerator for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<PartialStream, ToolError> {
        let key = request.schema;
        self.requests.lock().push(request.clone());

        if request.schema == Schema::Finding {
            if let Some((_, delay)) = self
                .finding_delays
                .iter()
                .find(|(needle, _)| request.subject.contains(needle.as_str()))
            {
                tokio::time::sleep(*delay).await;
            }
        }

        if self.failing.contains(&key) {
            return Err(ToolError::Unavailable("scripted generator outage".into()));
        }

        if key == Schema::Finding
            && request.material["round"] == 1
            && self.empty_findings.contains(&request.subject)
        {
            let partials = vec![Ok(json!({"summary": "Nothing relevant found"}))];
            return Ok(futures::stream::iter(partials).boxed());
        }

        let partials = self
            .scripts
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Self::default_partials(&request));
        Ok(futures::stream::iter(partials.into_iter().map(Ok)).boxed())
    }
}

/// Bundle of scripted collaborators that keeps typed handles for assertions
pub struct Fakes {
    pub search: Arc<ScriptedSearch>,
    pub fetch: Arc<ScriptedFetch>,
    pub generator: Arc<ScriptedGenerator>,
}

impl Fakes {
    pub fn new(search: ScriptedSearch, fetch: ScriptedFetch, generator: ScriptedGenerator) -> Self {
        Self {
            search: Arc::new(search),
            fetch: Arc::new(fetch),
            generator: Arc::new(generator),
        }
    }

    pub fn healthy() -> Self {
        Self::new(ScriptedSearch::new(), ScriptedFetch::new(), ScriptedGenerator::new())
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            self.search.clone(),
            self.fetch.clone(),
            self.generator.clone(),
        )
    }
}

/// Orchestrated-mode session over the given fakes
pub fn test_session(query: &str, config: ResearchConfig, fakes: &Fakes) -> SessionHandle {
    test_session_with_mode(query, ResearchMode::Orchestrated, config, fakes)
}

pub fn test_session_with_mode(
    query: &str,
    mode: ResearchMode,
    config: ResearchConfig,
    fakes: &Fakes,
) -> SessionHandle {
    let limiter = RateLimiter::new(config.rate_limit);
    SessionHandle::new(ResearchSession::new(
        ResearchQuery::new(query).expect("test query"),
        mode,
        Arc::new(config),
        fakes.collaborators(),
        limiter,
        CancellationToken::new(),
    ))
}

/// Config with millisecond backoffs so retry paths stay fast
pub fn fast_config() -> ResearchConfig {
    let mut config = ResearchConfig::default();
    config.task_backoff.initial_backoff_ms = 1;
    config.task_backoff.max_backoff_ms = 2;
    config.worker.retry.initial_backoff_ms = 1;
    config.worker.retry.max_backoff_ms = 2;
    config.worker.call_timeout_ms = 500;
    config.worker_timeout_ms = 5_000;
    config
}
