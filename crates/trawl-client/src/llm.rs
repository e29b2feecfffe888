use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use trawl_core::budget::MAX_SUMMARY_TOKENS_PER_PAGE;
use trawl_core::error::AppError;
use trawl_core::models::{ResearchDigest, SourceDocument};
use trawl_core::traits::{AnalysisProvider, ContextResolver};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub(crate) const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(60);

/// Reply the context resolver uses to ask for a web search.
pub const NEEDS_SEARCH: &str = "NEEDS_SEARCH";

const OPTIMIZE_PROMPT: &str = "You are a search query optimizer. Transform the user's question into an effective web search query.

Rules:
1. Keep it concise (2-6 words is ideal)
2. Include key terms that will find current information
3. Add the year if the question is about recent events
4. Remove filler words
5. Use quotation marks for exact phrases if needed

Output only the optimized search query, nothing else.";

const ANALYZE_PROMPT: &str = "You are a research assistant. Answer the user's query using the provided web content.

Guidelines:
- Base the answer on the web content; cite the source URL for specific claims
- Prefer the most recent information when sources disagree
- If the content does not answer the query, say so plainly
- Use markdown, and keep the answer concise but complete";

const SUMMARIZE_PROMPT: &str = "You are a skilled summarizer. Given the following webpage content, write a clear and detailed summary that captures:

- The main topic and purpose of the content
- Key facts, data and figures
- Names, dates, places and other specific references
- Conclusions, opinions or recommendations stated

Use short bullet points or paragraphs, and match the tone of the original. Do not add anything that is not in the text.";

const SYNTHESIZE_PROMPT: &str = "You are a research assistant. Below are summaries of several webpages related to the user's question.

Answer the question using only the summaries:
- Focus on the information most relevant to the question
- Cite the source URL for specific claims
- Avoid repeating the same point from different sources
- Use markdown, and keep the answer concise (300-400 words at most)";

const CONTEXT_PROMPT: &str = "You answer questions using only the conversation context provided. If the context fully answers the question, reply with the answer. If it does not, or the question needs current information from the web, reply with exactly NEEDS_SEARCH and nothing else.";

const ANSWER_MAX_TOKENS: u32 = 1024;

/// How `analyze_results` turns search results into an answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AnalysisMode {
    /// One completion over the full rendered results.
    SingleStage,
    /// Summarize every extracted page concurrently, then answer from the
    /// summaries.
    #[default]
    TwoStage,
}

/// A single-turn chat completion API.
pub(crate) trait ChatBackend: Send + Sync {
    fn complete(
        &self,
        system: &str,
        user: String,
        max_tokens: u32,
        temperature: f32,
    ) -> impl Future<Output = Result<String, AppError>> + Send;
}

// ---- Shared provider behaviour ----

/// Never fails: any provider error falls back to the original query.
pub(crate) async fn optimize_query<B: ChatBackend>(backend: &B, query: &str, context: &str) -> String {
    let mut user = format!("Optimize this search query: {query}");
    if !context.trim().is_empty() {
        user = format!("Conversation context:\n{context}\n\n{user}");
    }

    match backend.complete(OPTIMIZE_PROMPT, user, 100, 0.1).await {
        Ok(reply) => {
            let optimized = reply.trim_matches(|c| c == '"' || c == '\'').trim();
            if optimized.is_empty() {
                query.to_string()
            } else {
                optimized.to_string()
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Query optimization failed, using original query");
            query.to_string()
        }
    }
}

pub(crate) async fn analyze_results<B: ChatBackend>(
    backend: &B,
    mode: AnalysisMode,
    query: &str,
    digest: &ResearchDigest,
    context: &str,
) -> Result<String, AppError> {
    if mode == AnalysisMode::TwoStage && digest.pages().next().is_some() {
        return analyze_two_stage(backend, query, digest, context).await;
    }

    let mut user = format!("User query: {query}\n\n");
    if !context.trim().is_empty() {
        user.push_str(&format!("Conversation context:\n{context}\n\n"));
    }
    user.push_str(&format!("Web content:\n{}", digest.rendered));

    backend
        .complete(ANALYZE_PROMPT, user, ANSWER_MAX_TOKENS, 0.2)
        .await
}

async fn analyze_two_stage<B: ChatBackend>(
    backend: &B,
    query: &str,
    digest: &ResearchDigest,
    context: &str,
) -> Result<String, AppError> {
    let summaries = join_all(digest.pages().map(|page| summarize_page(backend, page))).await;
    let mut summaries = summaries.into_iter();

    let mut sections = Vec::with_capacity(digest.sources.len());
    let mut summarized = 0;
    let mut first_error = None;

    for source in &digest.sources {
        if source.content.is_none() {
            sections.push(format!(
                "**{}** ({}):\nSnippet only: {}",
                source.title, source.url, source.snippet
            ));
            continue;
        }
        match summaries.next() {
            Some(Ok(summary)) => {
                summarized += 1;
                sections.push(format!("**{}** ({}):\n{summary}", source.title, source.url));
            }
            Some(Err(e)) => {
                tracing::warn!(url = %source.url, error = %e, "Page summary failed");
                first_error.get_or_insert(e);
            }
            None => {}
        }
    }

    if summarized == 0
        && let Some(e) = first_error
    {
        return Err(e);
    }
    tracing::debug!(summarized, sources = digest.sources.len(), "Pages summarized");

    let mut user = format!("User question: {query}\n\n");
    if !context.trim().is_empty() {
        user.push_str(&format!("Previous context:\n{context}\n\n"));
    }
    user.push_str(&format!("Webpage summaries:\n{}", sections.join("\n\n")));

    backend
        .complete(SYNTHESIZE_PROMPT, user, ANSWER_MAX_TOKENS, 0.2)
        .await
}

async fn summarize_page<B: ChatBackend>(
    backend: &B,
    page: &SourceDocument,
) -> Result<String, AppError> {
    let content = page.content.as_deref().unwrap_or_default();
    let user = format!(
        "Search snippet: {}\n\nWebpage content:\n\"\"\"\n{content}\n\"\"\"\n\nSummary:",
        page.snippet
    );
    backend
        .complete(
            SUMMARIZE_PROMPT,
            user,
            MAX_SUMMARY_TOKENS_PER_PAGE as u32,
            0.0,
        )
        .await
}

pub(crate) async fn answer_from_context<B: ChatBackend>(
    backend: &B,
    query: &str,
    context: &str,
) -> Result<Option<String>, AppError> {
    let user = format!("Conversation context:\n{context}\n\nQuestion: {query}");
    let reply = backend.complete(CONTEXT_PROMPT, user, 400, 0.0).await?;

    if reply.contains(NEEDS_SEARCH) {
        Ok(None)
    } else {
        Ok(Some(reply))
    }
}

pub(crate) fn http_client(timeout: Duration) -> Result<Client, AppError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::HttpError(e.to_string()))
}

pub(crate) fn send_error(e: reqwest::Error, timeout_secs: f64) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout_secs)
    } else if e.is_connect() {
        AppError::NetworkError(format!("Connection failed: {e}"))
    } else {
        AppError::HttpError(e.to_string())
    }
}

/// Map a non-2xx provider response to an error, preferring the API's own
/// `error.message`.
pub(crate) async fn status_error(response: Response) -> AppError {
    let status_code = response.status().as_u16();
    if status_code == 429 {
        return AppError::RateLimitExceeded;
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiError>(&body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| format!("HTTP {status_code}: {body}"));

    AppError::ProviderError {
        message,
        status_code,
    }
}

pub(crate) fn empty_reply() -> AppError {
    AppError::ProviderError {
        message: "Empty response from LLM".into(),
        status_code: 200,
    }
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// OpenAI-compatible chat client used for query optimization, result
/// analysis and context-only answers.
///
/// Works with any OpenAI-compatible API, including:
/// - OpenAI directly (`https://api.openai.com/v1`)
/// - Gemini via compatibility layer (`https://generativelanguage.googleapis.com/v1beta/openai`)
/// - Groq (`https://api.groq.com/openai/v1`)
#[derive(Clone)]
pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: f64,
    mode: AnalysisMode,
}

impl OpenAiProvider {
    pub fn new(api_key: &str, model: &str) -> Result<Self, AppError> {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, model: &str, base_url: &str) -> Result<Self, AppError> {
        Ok(Self {
            client: http_client(DEFAULT_LLM_TIMEOUT)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout_secs: DEFAULT_LLM_TIMEOUT.as_secs_f64(),
            mode: AnalysisMode::default(),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, AppError> {
        self.client = http_client(timeout)?;
        self.timeout_secs = timeout.as_secs_f64();
        Ok(self)
    }

    pub fn with_mode(mut self, mode: AnalysisMode) -> Self {
        self.mode = mode;
        self
    }
}

impl ChatBackend for OpenAiProvider {
    async fn complete(
        &self,
        system: &str,
        user: String,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, AppError> {
        let url = format!("{}/chat/completions", self.base_url);

        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: system.to_string(),
                },
                Message {
                    role: "user",
                    content: user,
                },
            ],
            max_tokens,
            temperature,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| send_error(e, self.timeout_secs))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to parse LLM response: {e}")))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(empty_reply)
    }
}

// ---- OpenAI API types ----

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

impl AnalysisProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.model
    }

    async fn optimize_query(&self, query: &str, context: &str) -> Result<String, AppError> {
        Ok(optimize_query(self, query, context).await)
    }

    async fn analyze_results(
        &self,
        query: &str,
        digest: &ResearchDigest,
        context: &str,
    ) -> Result<String, AppError> {
        analyze_results(self, self.mode, query, digest, context).await
    }
}

impl ContextResolver for OpenAiProvider {
    async fn answer_from_context(
        &self,
        query: &str,
        context: &str,
    ) -> Result<Option<String>, AppError> {
        answer_from_context(self, query, context).await
    }
}
