use std::future::Future;

use crate::error::AppError;
use crate::models::{ExtractedPage, ResearchDigest, SearchHit};

/// Fetches a single URL and returns its cleaned content.
///
/// Implementations apply their own connect/read timeouts; the extractor adds
/// the per-request and batch-level caps on top.
pub trait PageFetcher: Send + Sync + Clone + 'static {
    fn fetch_page(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<ExtractedPage, AppError>> + Send;
}

/// Text pulled out of an HTML document.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanedText {
    pub title: Option<String>,
    pub text: String,
}

/// Converts raw HTML into plain text with paragraph structure preserved.
pub trait Cleaner: Send + Sync + Clone {
    fn clean(&self, html: &str) -> Result<CleanedText, AppError>;
}

/// Keyword search engine returning candidate pages.
pub trait SearchEngine: Send + Sync {
    fn search(&self, query: &str) -> impl Future<Output = Result<Vec<SearchHit>, AppError>> + Send;
}

/// Query optimization and result analysis, typically backed by an LLM.
pub trait AnalysisProvider: Send + Sync {
    /// Short display name used in degraded-service messages.
    fn name(&self) -> &str;

    fn optimize_query(
        &self,
        query: &str,
        context: &str,
    ) -> impl Future<Output = Result<String, AppError>> + Send;

    /// Answer `query` from the search results in `digest`.
    fn analyze_results(
        &self,
        query: &str,
        digest: &ResearchDigest,
        context: &str,
    ) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Answers a query from conversation context alone, if possible.
pub trait ContextResolver: Send + Sync {
    /// Returns `Ok(None)` when a web search is needed.
    fn answer_from_context(
        &self,
        query: &str,
        context: &str,
    ) -> impl Future<Output = Result<Option<String>, AppError>> + Send;
}

/// Never answers from context; every query goes to the web.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysSearch;

impl ContextResolver for AlwaysSearch {
    async fn answer_from_context(
        &self,
        _query: &str,
        _context: &str,
    ) -> Result<Option<String>, AppError> {
        Ok(None)
    }
}

/// Stores final answers so repeated questions skip the pipeline.
pub trait AnswerStore: Send + Sync + Clone + 'static {
    fn lookup(
        &self,
        query: &str,
        context: &str,
    ) -> impl Future<Output = Result<Option<String>, AppError>> + Send;

    fn save(
        &self,
        query: &str,
        context: &str,
        answer: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// A no-op AnswerStore for use when caching is not needed.
#[derive(Debug, Clone)]
pub struct NullStore;

impl AnswerStore for NullStore {
    async fn lookup(&self, _query: &str, _context: &str) -> Result<Option<String>, AppError> {
        Ok(None)
    }

    async fn save(&self, _query: &str, _context: &str, _answer: &str) -> Result<(), AppError> {
        Ok(())
    }
}
