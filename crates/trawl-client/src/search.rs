use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use trawl_core::error::AppError;
use trawl_core::models::SearchHit;
use trawl_core::traits::SearchEngine;
use url::Url;

pub const DEFAULT_SEARCH_ENDPOINT: &str = "https://www.googleapis.com/customsearch/v1";

/// Results requested per query (the API maximum).
const RESULTS_PER_QUERY: u8 = 10;
const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);
const MISSING_SNIPPET: &str = "No description available";

/// Google Custom Search JSON API client.
#[derive(Clone)]
pub struct GoogleSearchClient {
    client: Client,
    api_key: String,
    engine_id: String,
    endpoint: String,
}

impl GoogleSearchClient {
    pub fn new(api_key: impl Into<String>, engine_id: impl Into<String>) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(SEARCH_TIMEOUT)
            .build()
            .map_err(|e| AppError::SearchError(e.to_string()))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            engine_id: engine_id.into(),
            endpoint: DEFAULT_SEARCH_ENDPOINT.to_string(),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn request_url(&self, query: &str) -> Result<Url, AppError> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| AppError::ConfigError(format!("Invalid search endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("key", &self.api_key)
            .append_pair("cx", &self.engine_id)
            .append_pair("q", query)
            .append_pair("num", &RESULTS_PER_QUERY.to_string());
        Ok(url)
    }
}

impl SearchEngine for GoogleSearchClient {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, AppError> {
        let url = self.request_url(query)?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::SearchError(format!("request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::RateLimitExceeded);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(AppError::SearchError(format!(
                "HTTP {}: {message}",
                status.as_u16()
            )));
        }

        let results: SearchResponse = response
            .json()
            .await
            .map_err(|e| AppError::SearchError(format!("invalid response: {e}")))?;

        let hits: Vec<SearchHit> = results
            .items
            .into_iter()
            .filter(|item| !item.link.is_empty())
            .map(|item| SearchHit {
                title: item.title,
                link: item.link,
                snippet: item
                    .snippet
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| MISSING_SNIPPET.to_string()),
            })
            .collect();

        tracing::debug!(%query, results = hits.len(), "Search completed");
        Ok(hits)
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Deserialize)]
struct SearchItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: String,
    snippet: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}
