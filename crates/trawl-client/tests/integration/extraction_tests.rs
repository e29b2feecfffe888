use std::time::{Duration, Instant};

use trawl_core::models::domain_key;
use trawl_core::{
    Budget, CircuitBreakerConfig, ConcurrentExtractor, DomainCircuitBreaker, DomainStatus,
    FailureKind,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{ARTICLE_TEXT, local_fetcher, mount_pages};

#[tokio::test]
async fn test_batch_over_http_respects_hard_cap() {
    let server = MockServer::start().await;
    mount_pages(&server).await;
    Mock::given(method("GET"))
        .and(path("/pages/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(crate::common::article("Slow"), "text/html")
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let budget = Budget::default()
        .with_hard_cap(Duration::from_secs(2))
        .with_slow_mark(Duration::from_secs(1));
    budget.validate().unwrap();

    let breaker = DomainCircuitBreaker::in_memory(CircuitBreakerConfig::default());
    let extractor = ConcurrentExtractor::new(local_fetcher(budget.timeouts), breaker.clone());

    let base = server.uri();
    let urls = [
        format!("{base}/pages/good"),
        format!("{base}/pages/missing"),
        format!("{base}/pages/data.json"),
        format!("{base}/pages/slow"),
    ];

    let started = Instant::now();
    let outcome = extractor.extract(&urls, &budget).await;
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_secs(4), "batch took {elapsed:?}");
    assert_eq!(outcome.accounted(), urls.len());

    let page = outcome.page_for(&urls[0]).expect("good page extracted");
    assert_eq!(page.title, "Circuit Breakers");
    assert!(page.content.contains(ARTICLE_TEXT));
    assert!(!page.content.contains("Home | About"));

    let missing = outcome.failure_for(&urls[1]).expect("404 recorded");
    assert_eq!(missing.reason, "HTTP 404");
    assert_eq!(missing.kind, FailureKind::Fetch);

    let json = outcome.failure_for(&urls[2]).expect("json recorded");
    assert!(json.reason.starts_with("Not HTML content"));

    let slow = outcome.failure_for(&urls[3]).expect("slow page cut off");
    assert!(matches!(slow.kind, FailureKind::Fetch | FailureKind::TimedOut));
    assert!(outcome.slow_sites.iter().any(|s| s.url == urls[3]));

    // Every failure shares the mock server's domain, so three reach the threshold.
    breaker.report_outcome(&outcome, false).await;
    let domain = domain_key(&base);
    assert!(matches!(breaker.status(&domain), DomainStatus::Blocked { .. }));
    assert!(!breaker.is_allowed(&urls[0]));
}

#[tokio::test]
async fn test_blocked_domain_is_not_requested() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let breaker = DomainCircuitBreaker::in_memory(CircuitBreakerConfig::default());
    breaker.block_domain(&server.uri(), "manual block").await;

    let budget = Budget::default();
    let extractor = ConcurrentExtractor::new(local_fetcher(budget.timeouts), breaker);

    let url = format!("{}/pages/good", server.uri());
    let outcome = extractor.extract(&[url.as_str()], &budget).await;

    assert!(outcome.successes.is_empty());
    assert!(outcome.failures.is_empty());
    assert_eq!(outcome.blocked.len(), 1);
    assert_eq!(outcome.blocked[0].reason, "blocked: manual block");
}
