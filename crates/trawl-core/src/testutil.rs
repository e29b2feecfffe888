//! Test utilities: mock implementations of all core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::AppError;
use crate::models::{ExtractedPage, ResearchDigest, SearchHit};
use crate::report::{ExtractionEvent, ExtractionReporter};
use crate::traits::{AnalysisProvider, AnswerStore, ContextResolver, PageFetcher, SearchEngine};

// ---------------------------------------------------------------------------
// MockPageFetcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Scripted {
    Page { delay: Duration, chars: usize },
    Status { delay: Duration, status: u16 },
    Hang,
    Panic,
}

/// Mock fetcher scripted per URL. Unscripted URLs fail immediately with a
/// network error.
#[derive(Clone, Default)]
pub struct MockPageFetcher {
    script: Arc<Mutex<HashMap<String, Scripted>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockPageFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn with(self, url: impl Into<String>, scripted: Scripted) -> Self {
        self.script.lock().unwrap().insert(url.into(), scripted);
        self
    }

    /// Respond after `delay` with a page of `chars` characters.
    pub fn page(self, url: impl Into<String>, delay: Duration, chars: usize) -> Self {
        self.with(url, Scripted::Page { delay, chars })
    }

    /// Fail after `delay` with a non-200 status.
    pub fn status(self, url: impl Into<String>, delay: Duration, status: u16) -> Self {
        self.with(url, Scripted::Status { delay, status })
    }

    /// Never respond.
    pub fn hanging(self, url: impl Into<String>) -> Self {
        self.with(url, Scripted::Hang)
    }

    /// Panic inside the fetch.
    pub fn panicking(self, url: impl Into<String>) -> Self {
        self.with(url, Scripted::Panic)
    }

    /// URLs fetched so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl PageFetcher for MockPageFetcher {
    async fn fetch_page(&self, url: &str) -> Result<ExtractedPage, AppError> {
        self.calls.lock().unwrap().push(url.to_string());
        let scripted = self.script.lock().unwrap().get(url).cloned();

        match scripted {
            Some(Scripted::Page { delay, chars }) => {
                tokio::time::sleep(delay).await;
                Ok(ExtractedPage::new(
                    url,
                    format!("Title of {url}"),
                    "x".repeat(chars),
                    delay.as_secs_f64(),
                ))
            }
            Some(Scripted::Status { delay, status }) => {
                tokio::time::sleep(delay).await;
                Err(AppError::Status(status))
            }
            Some(Scripted::Hang) => std::future::pending().await,
            Some(Scripted::Panic) => panic!("mock fetcher panic for {url}"),
            None => Err(AppError::NetworkError(format!("unscripted url {url}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Records the name of every event it receives.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<&'static str>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }
}

impl ExtractionReporter for MockReporter {
    fn report(&self, event: ExtractionEvent<'_>) {
        let name = match event {
            ExtractionEvent::BatchStarted { .. } => "batch_started",
            ExtractionEvent::UrlBlocked { .. } => "url_blocked",
            ExtractionEvent::PageExtracted { .. } => "page_extracted",
            ExtractionEvent::PageFailed { .. } => "page_failed",
            ExtractionEvent::SlowSite { .. } => "slow_site",
            ExtractionEvent::BudgetReached { .. } => "budget_reached",
            ExtractionEvent::HardCapReached { .. } => "hard_cap_reached",
            ExtractionEvent::BatchFinished { .. } => "batch_finished",
        };
        self.events.lock().unwrap().push(name);
    }
}

// ---------------------------------------------------------------------------
// MockSearchEngine
// ---------------------------------------------------------------------------

/// Mock search engine returning fixed hits and recording queries.
#[derive(Clone)]
pub struct MockSearchEngine {
    hits: Arc<Mutex<Vec<SearchHit>>>,
    error: Arc<Mutex<Option<AppError>>>,
    pub queries: Arc<Mutex<Vec<String>>>,
}

impl MockSearchEngine {
    pub fn new(hits: Vec<SearchHit>) -> Self {
        Self {
            hits: Arc::new(Mutex::new(hits)),
            error: Arc::new(Mutex::new(None)),
            queries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_error(error: AppError) -> Self {
        Self {
            hits: Arc::new(Mutex::new(Vec::new())),
            error: Arc::new(Mutex::new(Some(error))),
            queries: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl SearchEngine for MockSearchEngine {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, AppError> {
        self.queries.lock().unwrap().push(query.to_string());
        if let Some(e) = self.error.lock().unwrap().take() {
            return Err(e);
        }
        Ok(self.hits.lock().unwrap().clone())
    }
}

/// Convenience constructor for search hits in tests.
pub fn hit(title: &str, link: &str) -> SearchHit {
    SearchHit {
        title: title.to_string(),
        link: link.to_string(),
        snippet: format!("Snippet for {title}"),
    }
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

/// Recorded analysis call: (query, digest, context).
pub type AnalyzeCall = (String, ResearchDigest, String);

/// Mock analysis provider with a fixed rewrite and a fixed answer.
#[derive(Clone)]
pub struct MockProvider {
    optimized: Arc<Mutex<Result<String, String>>>,
    answer: Arc<Mutex<Result<String, String>>>,
    pub analyze_calls: Arc<Mutex<Vec<AnalyzeCall>>>,
}

impl MockProvider {
    pub fn new(optimized: &str, answer: &str) -> Self {
        Self {
            optimized: Arc::new(Mutex::new(Ok(optimized.to_string()))),
            answer: Arc::new(Mutex::new(Ok(answer.to_string()))),
            analyze_calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// `optimize_query` fails with this message.
    pub fn failing_optimize(self, message: &str) -> Self {
        *self.optimized.lock().unwrap() = Err(message.to_string());
        self
    }

    /// `analyze_results` fails with this message.
    pub fn failing_analyze(self, message: &str) -> Self {
        *self.answer.lock().unwrap() = Err(message.to_string());
        self
    }

    pub fn last_digest(&self) -> Option<ResearchDigest> {
        self.analyze_calls
            .lock()
            .unwrap()
            .last()
            .map(|(_, digest, _)| digest.clone())
    }

    pub fn last_blob(&self) -> Option<String> {
        self.last_digest().map(|digest| digest.rendered)
    }
}

fn provider_error(message: &str) -> AppError {
    AppError::ProviderError {
        message: message.to_string(),
        status_code: 500,
    }
}

impl AnalysisProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn optimize_query(&self, _query: &str, _context: &str) -> Result<String, AppError> {
        self.optimized
            .lock()
            .unwrap()
            .clone()
            .map_err(|m| provider_error(&m))
    }

    async fn analyze_results(
        &self,
        query: &str,
        digest: &ResearchDigest,
        context: &str,
    ) -> Result<String, AppError> {
        self.analyze_calls.lock().unwrap().push((
            query.to_string(),
            digest.clone(),
            context.to_string(),
        ));
        self.answer
            .lock()
            .unwrap()
            .clone()
            .map_err(|m| provider_error(&m))
    }
}

// ---------------------------------------------------------------------------
// MockContextResolver
// ---------------------------------------------------------------------------

/// Answers from context with a fixed reply, or never.
#[derive(Clone)]
pub struct MockContextResolver {
    answer: Option<String>,
}

impl MockContextResolver {
    pub fn answering(answer: &str) -> Self {
        Self {
            answer: Some(answer.to_string()),
        }
    }

    pub fn needs_search() -> Self {
        Self { answer: None }
    }
}

impl ContextResolver for MockContextResolver {
    async fn answer_from_context(
        &self,
        _query: &str,
        _context: &str,
    ) -> Result<Option<String>, AppError> {
        Ok(self.answer.clone())
    }
}

// ---------------------------------------------------------------------------
// MockAnswerStore
// ---------------------------------------------------------------------------

/// Recorded save: (query, context, answer).
pub type SavedAnswer = (String, String, String);

/// In-memory answer store that records saves.
#[derive(Clone, Default)]
pub struct MockAnswerStore {
    cached: Arc<Mutex<Option<String>>>,
    pub saved: Arc<Mutex<Vec<SavedAnswer>>>,
}

impl MockAnswerStore {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every lookup hits with this answer.
    pub fn with_cached(answer: &str) -> Self {
        Self {
            cached: Arc::new(Mutex::new(Some(answer.to_string()))),
            saved: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl AnswerStore for MockAnswerStore {
    async fn lookup(&self, _query: &str, _context: &str) -> Result<Option<String>, AppError> {
        Ok(self.cached.lock().unwrap().clone())
    }

    async fn save(&self, query: &str, context: &str, answer: &str) -> Result<(), AppError> {
        self.saved.lock().unwrap().push((
            query.to_string(),
            context.to_string(),
            answer.to_string(),
        ));
        Ok(())
    }
}
