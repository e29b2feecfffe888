//! Reddit post retrieval through the JSON API instead of HTML scraping.
//!
//! With client credentials the client authenticates against the OAuth
//! endpoint (application-only grant) and reads from `oauth.reddit.com`;
//! without them it falls back to the public `.json` view of the post.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use trawl_core::budget::FetchTimeouts;
use trawl_core::error::AppError;
use url::Url;

pub const DEFAULT_PUBLIC_BASE: &str = "https://www.reddit.com";
pub const DEFAULT_OAUTH_BASE: &str = "https://oauth.reddit.com";
pub const DEFAULT_TOKEN_URL: &str = "https://www.reddit.com/api/v1/access_token";
pub const DEFAULT_FORUM_USER_AGENT: &str = "trawl/0.1 (web research fetcher)";

/// Comments included in the rendered post.
const MAX_COMMENTS: usize = 5;
/// Top-level listing entries inspected when looking for comments.
const MAX_COMMENTS_SCANNED: usize = 10;
const COMMENT_MAX_CHARS: usize = 300;
/// Refresh the token this long before Reddit says it expires.
const TOKEN_EXPIRY_SLACK: Duration = Duration::from_secs(60);

/// Title and rendered text of a forum thread.
#[derive(Debug, Clone, PartialEq)]
pub struct ForumPost {
    pub title: String,
    pub text: String,
}

#[derive(Clone)]
struct Credentials {
    client_id: String,
    client_secret: String,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Reddit API client used for reddit.com post URLs.
#[derive(Clone)]
pub struct RedditClient {
    client: Client,
    credentials: Option<Credentials>,
    user_agent: String,
    public_base: String,
    oauth_base: String,
    token_url: String,
    timeout_secs: f64,
    token: Arc<Mutex<Option<CachedToken>>>,
}

impl RedditClient {
    /// Anonymous client reading the public JSON endpoint.
    pub fn new(timeouts: FetchTimeouts) -> Result<Self, AppError> {
        let client = Client::builder()
            .connect_timeout(timeouts.connect)
            .read_timeout(timeouts.read)
            .timeout(timeouts.total)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            credentials: None,
            user_agent: DEFAULT_FORUM_USER_AGENT.to_string(),
            public_base: DEFAULT_PUBLIC_BASE.to_string(),
            oauth_base: DEFAULT_OAUTH_BASE.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            timeout_secs: timeouts.total.as_secs_f64(),
            token: Arc::new(Mutex::new(None)),
        })
    }

    /// Authenticate with an application-only OAuth grant.
    pub fn with_credentials(
        mut self,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        });
        self
    }

    /// Reddit rejects requests without a descriptive User-Agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Point the client at different hosts (used by tests).
    pub fn with_endpoints(
        mut self,
        public_base: impl Into<String>,
        oauth_base: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        self.public_base = public_base.into().trim_end_matches('/').to_string();
        self.oauth_base = oauth_base.into().trim_end_matches('/').to_string();
        self.token_url = token_url.into();
        self
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Fetch a post and its top comments as plain text.
    pub async fn fetch_post(&self, url: &str) -> Result<ForumPost, AppError> {
        let path = post_path(url)
            .ok_or_else(|| AppError::NotSupported(format!("not a Reddit post URL: {url}")))?;

        let request = match &self.credentials {
            Some(credentials) => {
                let token = self.access_token(credentials).await?;
                let endpoint = self.listing_url(&self.oauth_base, &path)?;
                self.client.get(endpoint).bearer_auth(token)
            }
            None => {
                let endpoint = self.listing_url(&self.public_base, &format!("{path}.json"))?;
                self.client.get(endpoint)
            }
        };

        let response = self.send(request).await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::TOO_MANY_REQUESTS => return Err(AppError::RateLimitExceeded),
            StatusCode::UNAUTHORIZED if self.credentials.is_some() => {
                // Token revoked or expired early; the next call fetches a new one.
                *self.token.lock().await = None;
                return Err(AppError::Status(401));
            }
            status => return Err(AppError::Status(status.as_u16())),
        }

        let listings: Vec<Listing> = response
            .json()
            .await
            .map_err(|e| AppError::HttpError(format!("Invalid Reddit response: {e}")))?;

        render_thread(&listings)
            .ok_or_else(|| AppError::HttpError(format!("Reddit returned no post for {url}")))
    }

    fn listing_url(&self, base: &str, path: &str) -> Result<Url, AppError> {
        let mut url = Url::parse(&format!("{base}{path}"))
            .map_err(|e| AppError::ConfigError(format!("Invalid Reddit endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("raw_json", "1")
            .append_pair("limit", &MAX_COMMENTS_SCANNED.to_string());
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, AppError> {
        request
            .header(USER_AGENT, &self.user_agent)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.timeout_secs)
                } else if e.is_connect() {
                    AppError::NetworkError(format!("Connection failed: {e}"))
                } else {
                    AppError::HttpError(e.to_string())
                }
            })
    }

    async fn access_token(&self, credentials: &Credentials) -> Result<String, AppError> {
        // Held across the token request: concurrent fetches wait for a single
        // refresh instead of each requesting a token.
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && token.expires_at > Instant::now()
        {
            return Ok(token.value.clone());
        }

        let request = self
            .client
            .post(&self.token_url)
            .basic_auth(&credentials.client_id, Some(&credentials.client_secret))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body("grant_type=client_credentials");

        let response = self.send(request).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::HttpError(format!(
                "Reddit token request failed with HTTP {}",
                status.as_u16()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AppError::HttpError(format!("Invalid Reddit token response: {e}")))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_SLACK);
        tracing::debug!(expires_in = token.expires_in, "Obtained Reddit access token");
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }
}

/// True for any reddit.com host.
pub fn is_reddit_url(url: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .is_some_and(|host| host == "reddit.com" || host.ends_with(".reddit.com"))
}

/// `/r/<sub>/comments/<id>` for a post URL, `None` for anything else.
fn post_path(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        ["r", subreddit, "comments", id, ..] => Some(format!("/r/{subreddit}/comments/{id}")),
        _ => None,
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<Thing>,
}

#[derive(Deserialize)]
struct Thing {
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct PostData {
    title: String,
    author: String,
    subreddit: String,
    score: i64,
    num_comments: u64,
    selftext: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CommentData {
    author: String,
    body: String,
    score: i64,
}

fn render_thread(listings: &[Listing]) -> Option<ForumPost> {
    let post_thing = listings.first()?.data.children.first()?;
    let post: PostData = serde_json::from_value(post_thing.data.clone()).ok()?;

    let mut text = format!(
        "{}\nPosted by u/{} in r/{} | {} points | {} comments",
        post.title, post.author, post.subreddit, post.score, post.num_comments
    );

    let selftext = post.selftext.trim();
    if !selftext.is_empty() {
        text.push_str("\n\n");
        text.push_str(selftext);
    }

    let comments: Vec<CommentData> = listings
        .get(1)
        .map(|listing| {
            listing
                .data
                .children
                .iter()
                .take(MAX_COMMENTS_SCANNED)
                .filter(|thing| thing.kind == "t1")
                .filter_map(|thing| serde_json::from_value::<CommentData>(thing.data.clone()).ok())
                .filter(|c| {
                    let body = c.body.trim();
                    !body.is_empty() && body != "[removed]" && body != "[deleted]"
                })
                .take(MAX_COMMENTS)
                .collect()
        })
        .unwrap_or_default();

    if !comments.is_empty() {
        text.push_str("\n\nTop comments:");
        for comment in comments {
            text.push_str(&format!(
                "\n- u/{} ({} points): {}",
                comment.author,
                comment.score,
                truncate_comment(comment.body.trim())
            ));
        }
    }

    Some(ForumPost {
        title: post.title,
        text,
    })
}

fn truncate_comment(body: &str) -> String {
    match body.char_indices().nth(COMMENT_MAX_CHARS) {
        Some((byte_index, _)) => format!("{}...", &body[..byte_index]),
        None => body.to_string(),
    }
}
