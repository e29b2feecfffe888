use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Maximum number of characters kept from a cleaned page.
pub const MAX_CONTENT_CHARS: usize = 50_000;

/// Pages with less cleaned text than this are discarded.
pub const MIN_CONTENT_CHARS: usize = 100;

/// A URL scheduled for fetching, plus the circuit-breaker key of its domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTarget {
    pub url: String,
    pub domain: String,
}

impl FetchTarget {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let domain = domain_key(&url);
        Self { url, domain }
    }
}

/// Derive the circuit-breaker key for a URL: the lowercased host, with the
/// port appended only when it is not the scheme default.
///
/// Never fails: unparseable input falls back to the lowercased raw string.
pub fn domain_key(url: &str) -> String {
    match Url::parse(url.trim()) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => match parsed.port() {
                Some(port) => format!("{}:{port}", host.to_lowercase()),
                None => host.to_lowercase(),
            },
            None => url.trim().to_lowercase(),
        },
        Err(_) => url.trim().to_lowercase(),
    }
}

/// Normalize an administrator-supplied domain. Accepts either a bare host
/// (`Example.com`) or a full URL (`https://example.com/page`).
pub fn normalize_domain(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        domain_key(trimmed)
    } else {
        trimmed.to_lowercase()
    }
}

/// A successfully fetched and cleaned page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedPage {
    pub url: String,
    pub title: String,
    /// Plain text, stripped of navigation and boilerplate.
    pub content: String,
    /// Length of `content` in characters.
    pub content_length: usize,
    /// Wall-clock time from request start to cleaned text.
    pub response_time_secs: f64,
}

impl ExtractedPage {
    pub fn new(
        url: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
        response_time_secs: f64,
    ) -> Self {
        let content = content.into();
        let content_length = content.chars().count();
        Self {
            url: url.into(),
            title: title.into(),
            content,
            content_length,
            response_time_secs,
        }
    }
}

/// Why a URL in a batch produced no page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The site misbehaved: network error, bad status, non-HTML, empty page,
    /// or the per-request timeout.
    Fetch,
    /// The URL was rejected for a reason unrelated to site health.
    Rejected,
    /// Still pending when the batch hit its hard wall-clock cap.
    TimedOut,
    /// Still pending when the batch had already gathered enough content.
    Cancelled,
}

impl FailureKind {
    /// Whether this failure should be reported to the domain circuit breaker.
    pub fn counts_against_domain(&self) -> bool {
        matches!(self, FailureKind::Fetch | FailureKind::TimedOut)
    }
}

/// A URL that produced no page, with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedUrl {
    pub url: String,
    /// Circuit-breaker key of `url`.
    pub domain: String,
    pub reason: String,
    pub kind: FailureKind,
}

impl FailedUrl {
    pub fn new(target: &FetchTarget, reason: impl Into<String>, kind: FailureKind) -> Self {
        Self {
            url: target.url.clone(),
            domain: target.domain.clone(),
            reason: reason.into(),
            kind,
        }
    }
}

/// A URL that was still pending at the slow mark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowSite {
    pub url: String,
    pub domain: String,
    pub elapsed_secs: f64,
}

/// Everything one extraction batch produced.
///
/// Every URL that passed the circuit breaker appears exactly once across
/// `successes` and `failures`. URLs rejected by the breaker are listed in
/// `blocked` and were never fetched. A URL may additionally appear in
/// `slow_sites`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub successes: Vec<ExtractedPage>,
    pub failures: Vec<FailedUrl>,
    pub slow_sites: Vec<SlowSite>,
    pub blocked: Vec<FailedUrl>,
    pub elapsed_secs: f64,
    /// Estimated summary tokens gathered by the successes.
    pub estimated_tokens: usize,
}

impl BatchOutcome {
    pub fn page_for(&self, url: &str) -> Option<&ExtractedPage> {
        self.successes.iter().find(|p| p.url == url)
    }

    pub fn failure_for(&self, url: &str) -> Option<&FailedUrl> {
        self.failures
            .iter()
            .chain(self.blocked.iter())
            .find(|f| f.url == url)
    }

    /// Number of URLs that went through the fetch stage.
    pub fn accounted(&self) -> usize {
        self.successes.len() + self.failures.len()
    }
}

/// One result returned by the search engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub link: String,
    pub snippet: String,
}

/// One search result as handed to the analysis provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    /// 1-based position in the rendered prompt.
    pub index: usize,
    pub title: String,
    pub url: String,
    pub snippet: String,
    /// Extracted page text, trimmed to the prompt budget. `None` when
    /// extraction failed.
    pub content: Option<String>,
}

/// What the analysis provider sees for one query: the rendered prompt body
/// and the sources it was built from, in the same order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResearchDigest {
    pub rendered: String,
    pub sources: Vec<SourceDocument>,
}

impl ResearchDigest {
    /// Sources with extracted page text.
    pub fn pages(&self) -> impl Iterator<Item = &SourceDocument> {
        self.sources.iter().filter(|source| source.content.is_some())
    }
}

/// A domain that is failing but has not reached the block threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporaryFailure {
    pub failure_count: u32,
    pub first_failure_at: DateTime<Utc>,
    pub last_failure_at: DateTime<Utc>,
    pub last_failure_reason: String,
}

/// A domain that is skipped outright.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedDomain {
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
    pub failure_count_at_block: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_reason: Option<String>,
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Rough token estimate for a piece of text (4 chars per token).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_hash_consistency() {
        let h1 = compute_hash("hello world");
        let h2 = compute_hash("hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, compute_hash("hello"));
    }

    #[test]
    fn test_domain_key() {
        assert_eq!(domain_key("https://Example.COM/path?q=1"), "example.com");
        assert_eq!(domain_key("http://bad.example/x"), "bad.example");
        assert_eq!(domain_key("http://example.com:8080/page"), "example.com:8080");
        assert_eq!(domain_key("https://example.com:443/"), "example.com");
    }

    #[test]
    fn test_domain_key_falls_back_to_raw_string() {
        assert_eq!(domain_key("Not A URL"), "not a url");
        assert_eq!(domain_key("mailto:Someone"), "mailto:someone");
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("Example.com"), "example.com");
        assert_eq!(normalize_domain("https://example.com/"), "example.com");
        assert_eq!(normalize_domain(" bad.example/ "), "bad.example");
    }

    #[test]
    fn test_failure_kind_accounting() {
        assert!(FailureKind::Fetch.counts_against_domain());
        assert!(FailureKind::TimedOut.counts_against_domain());
        assert!(!FailureKind::Cancelled.counts_against_domain());
        assert!(!FailureKind::Rejected.counts_against_domain());
    }

    #[test]
    fn test_extracted_page_counts_chars() {
        let page = ExtractedPage::new("https://a.example", "A", "héllo", 0.5);
        assert_eq!(page.content_length, 5);
    }
}
