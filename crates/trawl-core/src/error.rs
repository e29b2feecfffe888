use thiserror::Error;

/// Application-wide error types for trawl.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed (fetching a page).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// The server answered with something other than `200 OK`.
    #[error("HTTP {0}")]
    Status(u16),

    /// The response was not an HTML document.
    #[error("Not HTML content: {0}")]
    NotHtml(String),

    /// Less than the minimum amount of text survived cleaning.
    #[error("Content too short ({0} chars) after cleaning")]
    ContentTooShort(usize),

    /// HTML parsing or text extraction failed.
    #[error("Cleaner error: {0}")]
    CleanerError(String),

    /// The URL is recognised but cannot be handled by this fetcher.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Request timed out.
    #[error("Request timed out after {0:.1} seconds")]
    Timeout(f64),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The search engine call failed (quota, bad credentials, network).
    #[error("Search failed: {0}")]
    SearchError(String),

    /// The analysis/optimization provider call failed.
    #[error("Provider error (HTTP {status_code}): {message}")]
    ProviderError { message: String, status_code: u16 },

    /// Reading or writing durable state failed.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error says something about the health of the
    /// remote site, as opposed to our own configuration or a content mismatch
    /// that a retry would reproduce identically.
    pub fn is_site_failure(&self) -> bool {
        matches!(
            self,
            AppError::HttpError(_)
                | AppError::Status(_)
                | AppError::NotHtml(_)
                | AppError::ContentTooShort(_)
                | AppError::Timeout(_)
                | AppError::RateLimitExceeded
                | AppError::NetworkError(_)
        )
    }
}
