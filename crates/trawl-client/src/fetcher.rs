use std::net::IpAddr;
use std::time::Instant;

use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use trawl_core::budget::FetchTimeouts;
use trawl_core::error::AppError;
use trawl_core::models::{ExtractedPage, MAX_CONTENT_CHARS, MIN_CONTENT_CHARS};
use trawl_core::traits::{Cleaner, PageFetcher};
use url::Url;

use crate::forum::{ForumPost, RedditClient, is_reddit_url};

/// Sent with every page request; some sites refuse obvious bots.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Page fetcher using reqwest and an HTML [`Cleaner`].
///
/// GETs a URL with a browser User-Agent and layered timeouts, accepts only
/// `200 OK` HTML responses, and returns the cleaned text. Reddit URLs are
/// routed to the [`RedditClient`] instead of being scraped.
///
/// SSRF protection is on by default: requests to private/reserved
/// IP ranges are blocked. Use [`allow_private_urls`](Self::allow_private_urls)
/// to disable this (e.g., for CLI usage where the user controls the machine).
#[derive(Clone)]
pub struct HttpPageFetcher<C: Cleaner> {
    client: Client,
    cleaner: C,
    forum: RedditClient,
    timeouts: FetchTimeouts,
    ssrf_protection: bool,
}

impl<C: Cleaner + 'static> HttpPageFetcher<C> {
    pub fn new(cleaner: C) -> Result<Self, AppError> {
        Self::with_timeouts(cleaner, FetchTimeouts::default())
    }

    pub fn with_timeouts(cleaner: C, timeouts: FetchTimeouts) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .connect_timeout(timeouts.connect)
            .read_timeout(timeouts.read)
            .timeout(timeouts.total)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            cleaner,
            forum: RedditClient::new(timeouts)?,
            timeouts,
            ssrf_protection: true,
        })
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    ///
    /// Only use this for CLI usage where the user controls the machine.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    /// Replace the default (anonymous) Reddit client.
    pub fn with_forum(mut self, forum: RedditClient) -> Self {
        self.forum = forum;
        self
    }

    async fn fetch_html(&self, url: &str) -> Result<(Option<String>, String), AppError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeouts.total.as_secs_f64())
            } else if e.is_connect() {
                AppError::NetworkError(format!("Connection failed: {e}"))
            } else {
                AppError::HttpError(e.to_string())
            }
        })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(AppError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        if !is_html(&content_type) {
            return Err(AppError::NotHtml(if content_type.is_empty() {
                "missing content type".to_string()
            } else {
                content_type
            }));
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeouts.total.as_secs_f64())
            } else {
                AppError::HttpError(format!("Failed to read response body: {e}"))
            }
        })?;

        let cleaned = self.cleaner.clean(&body)?;
        Ok((cleaned.title, cleaned.text))
    }
}

impl<C: Cleaner + 'static> PageFetcher for HttpPageFetcher<C> {
    async fn fetch_page(&self, url: &str) -> Result<ExtractedPage, AppError> {
        let started = Instant::now();

        if self.ssrf_protection {
            validate_url(url).await?;
        }

        let (title, text) = if is_reddit_url(url) {
            let ForumPost { title, text } = self.forum.fetch_post(url).await?;
            (Some(title), text)
        } else {
            self.fetch_html(url).await?
        };

        let length = text.chars().count();
        if length < MIN_CONTENT_CHARS {
            return Err(AppError::ContentTooShort(length));
        }

        let content = truncate_content(text, MAX_CONTENT_CHARS);
        let title = title.unwrap_or_else(|| fallback_title(url));

        tracing::debug!(
            %url,
            content_length = length,
            elapsed_ms = started.elapsed().as_millis(),
            "Fetched page"
        );

        Ok(ExtractedPage::new(
            url,
            title,
            content,
            started.elapsed().as_secs_f64(),
        ))
    }
}

fn is_html(content_type: &str) -> bool {
    content_type.contains("text/html") || content_type.contains("application/xhtml+xml")
}

/// Cut `text` to `max_chars` characters, marking the cut with `...`.
fn truncate_content(text: String, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => {
            let mut truncated = text[..byte_index].to_string();
            truncated.push_str("...");
            truncated
        }
        None => text,
    }
}

fn fallback_title(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Validate a URL to prevent server-side request forgery (SSRF).
///
/// 1. Only allow `http` and `https` schemes.
/// 2. Resolve the hostname via DNS.
/// 3. Reject if any resolved IP is private/reserved.
///
/// Rejections are `NotSupported` so they never count against the domain;
/// DNS failures are network errors and do.
async fn validate_url(url: &str) -> Result<(), AppError> {
    let parsed =
        Url::parse(url).map_err(|e| AppError::NotSupported(format!("Invalid URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::NotSupported(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::NotSupported("URL has no host".to_string()))?;

    // IPv6 literals come back bracketed from host_str.
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(AppError::NotSupported(format!(
                "SSRF blocked: {host} resolves to private/reserved IP"
            )));
        }
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AppError::NetworkError(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(AppError::NetworkError(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }

    if let Some(private) = addrs.iter().find(|a| is_private_ip(a.ip())) {
        return Err(AppError::NotSupported(format!(
            "SSRF blocked: {host} resolves to private/reserved IP {}",
            private.ip()
        )));
    }

    Ok(())
}

/// Check if an IP address is in a private/reserved/link-local range.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local() // includes cloud metadata 169.254.169.254
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // 100.64.0.0/10
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xFFC0) == 0xFE80 // fe80::/10
                || (v6.segments()[0] & 0xFE00) == 0xFC00 // fc00::/7
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| is_private_ip(IpAddr::V4(v4)))
        }
    }
}
