//! Search-augmented answering: context check, query rewrite, web search,
//! budgeted extraction, analysis.
//!
//! Every failure past the cache lookup degrades to a plain-text message;
//! `search_and_respond` always returns a string. Writes that don't affect
//! the answer (cache save, circuit-breaker feedback) run on a
//! [`TaskTracker`] after the answer is ready.

use tokio_util::task::TaskTracker;

use crate::budget::Budget;
use crate::circuit_breaker::DomainCircuitBreaker;
use crate::extractor::ConcurrentExtractor;
use crate::error::AppError;
use crate::models::{
    BatchOutcome, ExtractedPage, ResearchDigest, SearchHit, SourceDocument, estimate_tokens,
};
use crate::report::{ExtractionReporter, TracingExtractionReporter};
use crate::traits::{
    AlwaysSearch, AnalysisProvider, AnswerStore, ContextResolver, NullStore, PageFetcher,
    SearchEngine,
};

/// Prefix for answers produced from conversation context alone.
pub const CONTEXT_ANSWER_TAG: &str = "[from conversation context]";

/// Snippets are cut to this many characters in the prompt.
pub const SNIPPET_MAX_CHARS: usize = 400;

/// Page content trimmed below this many characters is dropped instead.
const MIN_TRIMMED_CONTENT_CHARS: usize = 200;

/// Extra characters a trimmed "Full Content (n of m chars): ..." header
/// costs over the failed-extraction placeholder.
const TRIMMED_HEADER_SLACK: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub budget: Budget,
    /// Upper bound on the estimated prompt sent to `analyze_results`.
    pub max_prompt_tokens: usize,
    /// Fixed allowance for the provider's own system prompt.
    pub system_prompt_tokens: usize,
    /// Report slow sites to the circuit breaker as failures.
    pub count_slow_sites: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            budget: Budget::default(),
            max_prompt_tokens: 12_000,
            system_prompt_tokens: 200,
            count_slow_sites: false,
        }
    }
}

pub struct SearchPipeline<P, S, F, C = AlwaysSearch, A = NullStore, R = TracingExtractionReporter>
where
    P: AnalysisProvider,
    S: SearchEngine,
    F: PageFetcher,
    C: ContextResolver,
    A: AnswerStore,
    R: ExtractionReporter,
{
    provider: P,
    search: S,
    extractor: ConcurrentExtractor<F, R>,
    resolver: C,
    store: A,
    config: PipelineConfig,
    tracker: TaskTracker,
}

impl<P, S, F, R> SearchPipeline<P, S, F, AlwaysSearch, NullStore, R>
where
    P: AnalysisProvider,
    S: SearchEngine,
    F: PageFetcher,
    R: ExtractionReporter,
{
    pub fn new(
        provider: P,
        search: S,
        extractor: ConcurrentExtractor<F, R>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            provider,
            search,
            extractor,
            resolver: AlwaysSearch,
            store: NullStore,
            config,
            tracker: TaskTracker::new(),
        }
    }
}

impl<P, S, F, C, A, R> SearchPipeline<P, S, F, C, A, R>
where
    P: AnalysisProvider,
    S: SearchEngine,
    F: PageFetcher,
    C: ContextResolver,
    A: AnswerStore,
    R: ExtractionReporter,
{
    pub fn with_resolver<C2: ContextResolver>(self, resolver: C2) -> SearchPipeline<P, S, F, C2, A, R> {
        SearchPipeline {
            provider: self.provider,
            search: self.search,
            extractor: self.extractor,
            resolver,
            store: self.store,
            config: self.config,
            tracker: self.tracker,
        }
    }

    pub fn with_store<A2: AnswerStore>(self, store: A2) -> SearchPipeline<P, S, F, C, A2, R> {
        SearchPipeline {
            provider: self.provider,
            search: self.search,
            extractor: self.extractor,
            resolver: self.resolver,
            store,
            config: self.config,
            tracker: self.tracker,
        }
    }

    pub fn breaker(&self) -> &DomainCircuitBreaker {
        self.extractor.breaker()
    }

    /// Answer `query`, searching the web unless the cache or the
    /// conversation context already has the answer.
    pub async fn search_and_respond(&self, query: &str, context: &str) -> String {
        match self.store.lookup(query, context).await {
            Ok(Some(answer)) => {
                tracing::info!("Answer cache hit");
                return answer;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Answer cache lookup failed"),
        }

        if !context.trim().is_empty() {
            match self.resolver.answer_from_context(query, context).await {
                Ok(Some(answer)) => {
                    tracing::info!("Answered from conversation context");
                    return format!("{CONTEXT_ANSWER_TAG} {answer}");
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Context check failed, searching instead"),
            }
        }

        let optimized = self.optimize(query, context).await;

        let hits = match self.search_excluding_blocked(&optimized).await {
            Ok(hits) if hits.is_empty() => {
                return format!("Web search unavailable: no results found for '{optimized}'");
            }
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(error = %e, "Web search failed");
                return format!("Web search unavailable: {e}");
            }
        };

        let urls: Vec<&str> = hits.iter().map(|hit| hit.link.as_str()).collect();
        let outcome = self.extractor.extract(&urls, &self.config.budget).await;
        if outcome.successes.is_empty() {
            tracing::warn!(
                failures = outcome.failures.len(),
                blocked = outcome.blocked.len(),
                "No pages extracted, analysing snippets only"
            );
        }

        let digest = self.assemble_digest(query, context, &hits, &outcome);

        let answer = match self.provider.analyze_results(query, &digest, context).await {
            Ok(answer) => {
                self.save_in_background(query, context, &answer);
                answer
            }
            Err(e) => {
                tracing::error!(provider = self.provider.name(), error = %e, "Analysis failed");
                format!(
                    "Error analyzing search results with {}: {e}",
                    self.provider.name()
                )
            }
        };

        self.report_in_background(outcome);
        answer
    }

    /// Wait for background work and persist the circuit breaker.
    pub async fn shutdown(&self) -> Result<(), AppError> {
        self.tracker.close();
        self.tracker.wait().await;
        self.extractor.breaker().flush().await
    }

    async fn optimize(&self, query: &str, context: &str) -> String {
        match self.provider.optimize_query(query, context).await {
            Ok(optimized) if !optimized.trim().is_empty() => {
                let optimized = optimized.trim().to_string();
                tracing::debug!(%query, %optimized, "Query optimized");
                optimized
            }
            Ok(_) => query.to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "Query optimization failed, using original query");
                query.to_string()
            }
        }
    }

    async fn search_excluding_blocked(&self, query: &str) -> Result<Vec<SearchHit>, AppError> {
        let exclusions = self.extractor.breaker().site_exclusions();
        let full_query = if exclusions.is_empty() {
            query.to_string()
        } else {
            format!("{query} {exclusions}")
        };
        self.search.search(&full_query).await
    }

    /// Render search hits and extracted pages into the analysis prompt,
    /// stopping before the estimated prompt exceeds `max_prompt_tokens`.
    fn assemble_digest(
        &self,
        query: &str,
        context: &str,
        hits: &[SearchHit],
        outcome: &BatchOutcome,
    ) -> ResearchDigest {
        let fixed_tokens =
            estimate_tokens(query) + estimate_tokens(context) + self.config.system_prompt_tokens;
        let budget_chars = self.config.max_prompt_tokens.saturating_sub(fixed_tokens) * 4;
        let mut blob = format!("Current web search results for '{query}':\n\n");
        let mut used_chars = blob.chars().count();
        let mut sources = Vec::new();

        for (i, hit) in hits.iter().enumerate() {
            let remaining = budget_chars.saturating_sub(used_chars);
            let page = outcome.page_for(&hit.link);
            let mut entry = format_entry(i + 1, hit, page, None);
            let mut entry_chars = entry.chars().count();
            let mut content_limit = None;

            if entry_chars > remaining {
                // Try to fit a trimmed copy of the page before giving up.
                let trimmed = page.and_then(|page| {
                    let overhead = format_entry(i + 1, hit, None, None).chars().count()
                        + TRIMMED_HEADER_SLACK;
                    let content_chars = remaining.saturating_sub(overhead);
                    (content_chars >= MIN_TRIMMED_CONTENT_CHARS).then(|| {
                        (
                            format_entry(i + 1, hit, Some(page), Some(content_chars)),
                            content_chars,
                        )
                    })
                });
                match trimmed {
                    Some((trimmed, limit)) if trimmed.chars().count() <= remaining => {
                        entry_chars = trimmed.chars().count();
                        entry = trimmed;
                        content_limit = Some(limit);
                    }
                    _ => {
                        tracing::info!(
                            included = i,
                            skipped = hits.len() - i,
                            "Prompt budget reached, truncating search results"
                        );
                        break;
                    }
                }
            }

            used_chars += entry_chars;
            blob.push_str(&entry);
            sources.push(SourceDocument {
                index: i + 1,
                title: hit.title.clone(),
                url: hit.link.clone(),
                snippet: snippet_of(hit),
                content: page.map(|page| match content_limit {
                    Some(max) => page.content.chars().take(max).collect(),
                    None => page.content.clone(),
                }),
            });
        }

        ResearchDigest {
            rendered: blob,
            sources,
        }
    }

    fn save_in_background(&self, query: &str, context: &str, answer: &str) {
        let store = self.store.clone();
        let query = query.to_string();
        let context = context.to_string();
        let answer = answer.to_string();
        self.tracker.spawn(async move {
            if let Err(e) = store.save(&query, &context, &answer).await {
                tracing::warn!(error = %e, "Failed to cache answer");
            }
        });
    }

    fn report_in_background(&self, outcome: BatchOutcome) {
        let breaker = self.extractor.breaker().clone();
        let count_slow_sites = self.config.count_slow_sites;
        self.tracker.spawn(async move {
            breaker.report_outcome(&outcome, count_slow_sites).await;
        });
    }
}

/// One numbered search result. `max_content_chars` trims the page text.
fn format_entry(
    index: usize,
    hit: &SearchHit,
    page: Option<&ExtractedPage>,
    max_content_chars: Option<usize>,
) -> String {
    let snippet = snippet_of(hit);
    let content = match page {
        Some(page) => match max_content_chars {
            Some(max) if max < page.content_length => {
                let text: String = page.content.chars().take(max).collect();
                format!("Full Content ({max} of {} chars): {text}...", page.content_length)
            }
            _ => format!("Full Content ({} chars): {}", page.content_length, page.content),
        },
        None => "Full Content: (extraction failed)".to_string(),
    };

    format!(
        "{index}. **{}**\n   Snippet: {snippet}\n   {content}\n   Source: <{}>\n\n",
        hit.title, hit.link
    )
}

fn snippet_of(hit: &SearchHit) -> String {
    hit.snippet.chars().take(SNIPPET_MAX_CHARS).collect()
}
