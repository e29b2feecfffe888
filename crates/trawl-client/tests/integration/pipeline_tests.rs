use trawl_client::{AnalysisMode, AnthropicProvider, GoogleSearchClient, OpenAiProvider};
use trawl_core::models::domain_key;
use trawl_core::{
    AnalysisProvider, CircuitBreakerConfig, ConcurrentExtractor, DomainCircuitBreaker,
    DomainStatus, MemoryAnswerCache, PipelineConfig, SearchPipeline,
};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{ARTICLE_TEXT, chat_reply, local_fetcher, mount_pages};

const ANSWER: &str = "Circuit breakers stop retrying a failing dependency.";

async fn mount_search(server: &MockServer, query: &str) {
    let base = server.uri();
    Mock::given(method("GET"))
        .and(path("/customsearch/v1"))
        .and(query_param("q", query))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {"title": "Circuit Breakers", "link": format!("{base}/pages/good"), "snippet": "How breakers work"},
                {"title": "Gone", "link": format!("{base}/pages/missing"), "snippet": "Deleted page"},
                {"title": "Backoff", "link": format!("{base}/pages/other"), "snippet": "Retry strategies"}
            ]
        })))
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_llm(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_string_contains("Optimize this search query"))
        .respond_with(chat_reply("circuit breaker pattern"))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_string_contains("Web content:"))
        .respond_with(chat_reply(ANSWER))
        .mount(server)
        .await;
}

type LocalPipeline<P> = SearchPipeline<
    P,
    GoogleSearchClient,
    trawl_client::HttpPageFetcher<trawl_client::HtmlTextCleaner>,
>;

fn pipeline(server: &MockServer, breaker: DomainCircuitBreaker) -> LocalPipeline<OpenAiProvider> {
    let provider =
        OpenAiProvider::with_base_url("sk-test", "test-model", &format!("{}/v1", server.uri()))
            .unwrap()
            .with_mode(AnalysisMode::SingleStage);
    pipeline_with(server, breaker, provider)
}

fn pipeline_with<P: AnalysisProvider>(
    server: &MockServer,
    breaker: DomainCircuitBreaker,
    provider: P,
) -> LocalPipeline<P> {
    let config = PipelineConfig::default();
    let search = GoogleSearchClient::new("key", "cx")
        .unwrap()
        .with_endpoint(format!("{}/customsearch/v1", server.uri()));
    let extractor = ConcurrentExtractor::new(local_fetcher(config.budget.timeouts), breaker);
    SearchPipeline::new(provider, search, extractor, config)
}

#[tokio::test]
async fn test_search_and_respond_end_to_end() {
    let server = MockServer::start().await;
    mount_pages(&server).await;
    mount_search(&server, "circuit breaker pattern").await;
    mount_llm(&server).await;

    let breaker = DomainCircuitBreaker::in_memory(CircuitBreakerConfig::default());
    let pipeline = pipeline(&server, breaker.clone());

    let answer = pipeline
        .search_and_respond("what is a circuit breaker?", "")
        .await;
    assert_eq!(answer, ANSWER);
    pipeline.shutdown().await.unwrap();

    // The analysis prompt carried the extracted article and the failed entry.
    let requests = server.received_requests().await.unwrap();
    let analysis = requests
        .iter()
        .map(|r| String::from_utf8_lossy(&r.body).into_owned())
        .find(|body| body.contains("Web content:"))
        .expect("analysis request sent");
    assert!(analysis.contains(ARTICLE_TEXT));
    assert!(analysis.contains("(extraction failed)"));

    // The 404 counted once against the shared domain.
    assert_eq!(
        breaker.status(&domain_key(&server.uri())),
        DomainStatus::Failing { failure_count: 1 }
    );
}

#[tokio::test]
async fn test_blocked_domains_are_excluded_from_search() {
    let server = MockServer::start().await;
    mount_search(&server, "circuit breaker pattern -site:127.0.0.1").await;
    mount_llm(&server).await;
    Mock::given(method("GET"))
        .and(path("/pages/good"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let breaker = DomainCircuitBreaker::in_memory(CircuitBreakerConfig::default());
    breaker.block_domain(&server.uri(), "manual").await;
    let pipeline = pipeline(&server, breaker);

    let answer = pipeline.search_and_respond("circuit breakers", "").await;
    assert_eq!(answer, ANSWER);
    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cached_answer_skips_everything() {
    let server = MockServer::start().await;
    mount_pages(&server).await;
    mount_search(&server, "circuit breaker pattern").await;
    mount_llm(&server).await;

    let breaker = DomainCircuitBreaker::in_memory(CircuitBreakerConfig::default());
    let cache = MemoryAnswerCache::new(100, Duration::from_secs(60));
    let pipeline = pipeline(&server, breaker).with_store(cache);

    let first = pipeline.search_and_respond("what is a circuit breaker?", "").await;
    // Wait for the background save before asking again.
    pipeline.shutdown().await.unwrap();
    let second = pipeline.search_and_respond("What is a circuit breaker?  ", "").await;

    assert_eq!(first, ANSWER);
    assert_eq!(second, ANSWER);
}

/// Request bodies sent to `route`, in arrival order.
async fn bodies_for(server: &MockServer, route: &str) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == route)
        .map(|r| String::from_utf8_lossy(&r.body).into_owned())
        .collect()
}

#[tokio::test]
async fn test_two_stage_summarizes_each_extracted_page() {
    let server = MockServer::start().await;
    mount_pages(&server).await;
    mount_search(&server, "circuit breaker pattern").await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_string_contains("Optimize this search query"))
        .respond_with(chat_reply("circuit breaker pattern"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_string_contains("Summary:"))
        .respond_with(chat_reply("Breakers trip after repeated failures."))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_string_contains("Webpage summaries:"))
        .respond_with(chat_reply(ANSWER))
        .expect(1)
        .mount(&server)
        .await;

    let provider =
        OpenAiProvider::with_base_url("sk-test", "test-model", &format!("{}/v1", server.uri()))
            .unwrap();
    let breaker = DomainCircuitBreaker::in_memory(CircuitBreakerConfig::default());
    let pipeline = pipeline_with(&server, breaker, provider);

    let answer = pipeline
        .search_and_respond("what is a circuit breaker?", "")
        .await;
    assert_eq!(answer, ANSWER);
    pipeline.shutdown().await.unwrap();

    let bodies = bodies_for(&server, "/v1/chat/completions").await;
    let summaries: Vec<&String> = bodies.iter().filter(|b| b.contains("Summary:")).collect();
    assert_eq!(summaries.len(), 2);
    assert!(summaries.iter().all(|b| b.contains(ARTICLE_TEXT)));
    let synthesis = bodies
        .iter()
        .find(|b| b.contains("Webpage summaries:"))
        .expect("synthesis request sent");
    assert!(synthesis.contains("Snippet only: Deleted page"));
    assert!(!synthesis.contains(ARTICLE_TEXT));
}

#[tokio::test]
async fn test_anthropic_provider_drives_the_pipeline() {
    let server = MockServer::start().await;
    mount_pages(&server).await;
    mount_search(&server, "circuit breaker pattern").await;
    let message = |text: &str| {
        ResponseTemplate::new(200).set_body_json(json!({
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": text}]
        }))
    };
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_string_contains("Optimize this search query"))
        .respond_with(message("circuit breaker pattern"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_string_contains("Web content:"))
        .respond_with(message(ANSWER))
        .expect(1)
        .mount(&server)
        .await;

    let provider = AnthropicProvider::with_base_url("ant-key", "claude-test", &server.uri())
        .unwrap()
        .with_mode(AnalysisMode::SingleStage);
    let breaker = DomainCircuitBreaker::in_memory(CircuitBreakerConfig::default());
    let pipeline = pipeline_with(&server, breaker, provider);

    let answer = pipeline
        .search_and_respond("what is a circuit breaker?", "")
        .await;
    assert_eq!(answer, ANSWER);
    pipeline.shutdown().await.unwrap();
}
