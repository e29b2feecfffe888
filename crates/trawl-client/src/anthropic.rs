use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use trawl_core::error::AppError;
use trawl_core::models::ResearchDigest;
use trawl_core::traits::{AnalysisProvider, ContextResolver};

use crate::llm::{
    self, AnalysisMode, ChatBackend, DEFAULT_LLM_TIMEOUT, empty_reply, http_client, send_error,
    status_error,
};

pub const DEFAULT_ANTHROPIC_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API client. Same behaviour as
/// [`OpenAiProvider`](crate::llm::OpenAiProvider), different wire format.
#[derive(Clone)]
pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: f64,
    mode: AnalysisMode,
}

impl AnthropicProvider {
    pub fn new(api_key: &str, model: &str) -> Result<Self, AppError> {
        Self::with_base_url(api_key, model, DEFAULT_ANTHROPIC_URL)
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

impl ChatBackend for AnthropicProvider {
    async fn complete(
        &self,
        system: &str,
        user: String,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, AppError> {
        let url = format!("{}/v1/messages", self.base_url);

        let request = MessagesRequest {
            model: &self.model,
            system,
            messages: vec![UserMessage {
                role: "user",
                content: user,
            }],
            max_tokens,
            temperature,
        };

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| send_error(e, self.timeout_secs))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to parse LLM response: {e}")))?;

        let text = body
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");
        let text = text.trim();

        if text.is_empty() {
            Err(empty_reply())
        } else {
            Ok(text.to_string())
        }
    }
}

// ---- Messages API types ----

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    system: &'a str,
    messages: Vec<UserMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct UserMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

impl AnalysisProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.model
    }

    async fn optimize_query(&self, query: &str, context: &str) -> Result<String, AppError> {
        Ok(llm::optimize_query(self, query, context).await)
    }

    async fn analyze_results(
        &self,
        query: &str,
        digest: &ResearchDigest,
        context: &str,
    ) -> Result<String, AppError> {
        llm::analyze_results(self, self.mode, query, digest, context).await
    }
}

impl ContextResolver for AnthropicProvider {
    async fn answer_from_context(
        &self,
        query: &str,
        context: &str,
    ) -> Result<Option<String>, AppError> {
        llm::answer_from_context(self, query, context).await
    }
}
