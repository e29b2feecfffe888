use serde_json::json;
use trawl_client::{HtmlTextCleaner, HttpPageFetcher};
use trawl_core::budget::FetchTimeouts;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const ARTICLE_TEXT: &str =
    "A circuit breaker stops calling a dependency after repeated failures.";

/// HTML page whose article body is long enough to survive cleaning.
pub fn article(title: &str) -> String {
    format!(
        "<html><head><title>{title}</title></head><body>
            <nav>Home | About | Contact</nav>
            <article>
                <h1>{title}</h1>
                <p>{ARTICLE_TEXT}</p>
                <p>Once the domain is blocked, requests are skipped until an operator lifts the block.</p>
            </article>
            <footer>Copyright notice and other furniture</footer>
        </body></html>"
    )
}

/// Mount the standard page set:
///
/// - `/pages/good` and `/pages/other`: HTML articles
/// - `/pages/missing`: 404
/// - `/pages/data.json`: JSON
pub async fn mount_pages(server: &MockServer) {
    for (route, title) in [("/pages/good", "Circuit Breakers"), ("/pages/other", "Backoff")] {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(article(title), "text/html; charset=utf-8"),
            )
            .mount(server)
            .await;
    }

    Mock::given(method("GET"))
        .and(path("/pages/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/pages/data.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"not": "html"})))
        .mount(server)
        .await;
}

/// Fetcher that may talk to the local mock server.
pub fn local_fetcher(timeouts: FetchTimeouts) -> HttpPageFetcher<HtmlTextCleaner> {
    HttpPageFetcher::with_timeouts(HtmlTextCleaner::new().unwrap(), timeouts)
        .unwrap()
        .allow_private_urls()
}

/// Chat completion response with the given reply.
pub fn chat_reply(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{"message": {"role": "assistant", "content": content}}]
    }))
}
