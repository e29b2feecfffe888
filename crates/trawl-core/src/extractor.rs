//! Budget-bounded scatter-gather over a batch of URLs.
//!
//! One task per allowed URL, collected in completion order. The batch ends
//! when every task is done, when the estimated summary tokens reach the
//! target, or when the hard cap fires, whichever comes first. Pending tasks
//! are aborted and awaited before `extract` returns, so nothing outlives the
//! batch.

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::budget::{Budget, Deadline, estimate_summary_tokens};
use crate::circuit_breaker::DomainCircuitBreaker;
use crate::error::AppError;
use crate::models::{BatchOutcome, ExtractedPage, FailedUrl, FailureKind, FetchTarget, SlowSite};
use crate::report::{ExtractionEvent, ExtractionReporter, TracingExtractionReporter};
use crate::traits::PageFetcher;

/// Why the wait loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    AllDone,
    BudgetReached,
    HardCap,
}

/// Fetches many pages concurrently under a [`Budget`].
pub struct ConcurrentExtractor<F: PageFetcher, R: ExtractionReporter = TracingExtractionReporter> {
    fetcher: F,
    breaker: DomainCircuitBreaker,
    reporter: R,
}

impl<F: PageFetcher> ConcurrentExtractor<F, TracingExtractionReporter> {
    pub fn new(fetcher: F, breaker: DomainCircuitBreaker) -> Self {
        Self {
            fetcher,
            breaker,
            reporter: TracingExtractionReporter,
        }
    }
}

impl<F: PageFetcher, R: ExtractionReporter> ConcurrentExtractor<F, R> {
    pub fn with_reporter<R2: ExtractionReporter>(self, reporter: R2) -> ConcurrentExtractor<F, R2> {
        ConcurrentExtractor {
            fetcher: self.fetcher,
            breaker: self.breaker,
            reporter,
        }
    }

    pub fn breaker(&self) -> &DomainCircuitBreaker {
        &self.breaker
    }

    /// Fetch as many of `urls` as the budget allows.
    ///
    /// Never fails: every allowed URL ends up in exactly one of
    /// `successes` or `failures`, and URLs rejected by the circuit breaker
    /// are listed in `blocked` without a network call. The breaker is only
    /// read here; feeding the outcome back is up to the caller.
    pub async fn extract<S: AsRef<str>>(&self, urls: &[S], budget: &Budget) -> BatchOutcome {
        let batch_id = Uuid::new_v4();
        let deadline = Deadline::start(budget);
        let mut outcome = BatchOutcome::default();

        let targets = urls
            .iter()
            .map(|url| FetchTarget::new(url.as_ref()))
            .collect();
        let (allowed, blocked) = self.breaker.filter_targets(targets);
        for (target, reason) in blocked {
            self.reporter.report(ExtractionEvent::UrlBlocked {
                batch_id,
                url: &target.url,
                reason: &reason,
            });
            outcome
                .blocked
                .push(FailedUrl::new(&target, reason, FailureKind::Rejected));
        }

        self.reporter.report(ExtractionEvent::BatchStarted {
            batch_id,
            requested: urls.len(),
            allowed: allowed.len(),
        });

        if !allowed.is_empty() {
            self.run_batch(batch_id, &allowed, budget, &deadline, &mut outcome)
                .await;
        }

        outcome.elapsed_secs = deadline.elapsed().as_secs_f64();
        self.reporter.report(ExtractionEvent::BatchFinished {
            batch_id,
            successes: outcome.successes.len(),
            failures: outcome.failures.len(),
            slow: outcome.slow_sites.len(),
            elapsed_ms: deadline.elapsed().as_millis(),
        });

        outcome
    }

    async fn run_batch(
        &self,
        batch_id: Uuid,
        allowed: &[FetchTarget],
        budget: &Budget,
        deadline: &Deadline,
        outcome: &mut BatchOutcome,
    ) {
        let mut tasks: JoinSet<(usize, Result<ExtractedPage, AppError>)> = JoinSet::new();
        let mut pending: BTreeSet<usize> = BTreeSet::new();

        for (index, target) in allowed.iter().enumerate() {
            let fetcher = self.fetcher.clone();
            let url = target.url.clone();
            let timeout = deadline.request_timeout(budget.timeouts.total);
            pending.insert(index);

            tasks.spawn(async move {
                let fetch = AssertUnwindSafe(fetcher.fetch_page(&url)).catch_unwind();
                let result = match tokio::time::timeout(timeout, fetch).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err(AppError::Generic("fetch task panicked".into())),
                    Err(_) => Err(AppError::Timeout(timeout.as_secs_f64())),
                };
                (index, result)
            });
        }

        let slow_mark = tokio::time::sleep_until(deadline.slow_mark());
        let hard_cap = tokio::time::sleep_until(deadline.hard_cap());
        tokio::pin!(slow_mark, hard_cap);
        let mut slow_recorded = false;
        let mut stop = StopReason::AllDone;

        while !pending.is_empty() {
            tokio::select! {
                biased;

                joined = tasks.join_next() => match joined {
                    Some(Ok((index, result))) => {
                        pending.remove(&index);
                        self.record_result(batch_id, &allowed[index], result, outcome);
                        if outcome.estimated_tokens >= budget.target_tokens {
                            stop = StopReason::BudgetReached;
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        // Panics are caught inside the task, so this is an
                        // abort we did not ask for.
                        tracing::error!(%batch_id, error = %e, "Fetch task ended without a result");
                    }
                    None => break,
                },
                () = &mut slow_mark, if !slow_recorded => {
                    slow_recorded = true;
                    let elapsed = deadline.elapsed();
                    for &index in &pending {
                        let target = &allowed[index];
                        self.reporter.report(ExtractionEvent::SlowSite {
                            batch_id,
                            url: &target.url,
                            domain: &target.domain,
                            elapsed_ms: elapsed.as_millis(),
                        });
                        outcome.slow_sites.push(SlowSite {
                            url: target.url.clone(),
                            domain: target.domain.clone(),
                            elapsed_secs: elapsed.as_secs_f64(),
                        });
                    }
                }
                () = &mut hard_cap => {
                    stop = StopReason::HardCap;
                    break;
                }
            }
        }

        if pending.is_empty() {
            return;
        }

        match stop {
            StopReason::BudgetReached => self.reporter.report(ExtractionEvent::BudgetReached {
                batch_id,
                estimated_tokens: outcome.estimated_tokens,
                pending: pending.len(),
            }),
            StopReason::HardCap => self.reporter.report(ExtractionEvent::HardCapReached {
                batch_id,
                pending: pending.len(),
            }),
            StopReason::AllDone => {}
        }

        // Tasks that completed between the last poll and the abort still
        // hand back their result.
        tasks.abort_all();
        while let Some(joined) = tasks.join_next().await {
            if let Ok((index, result)) = joined
                && pending.remove(&index)
            {
                self.record_result(batch_id, &allowed[index], result, outcome);
            }
        }

        let (kind, reason) = match stop {
            StopReason::HardCap => (
                FailureKind::TimedOut,
                format!(
                    "cancelled at hard cap after {:.1}s",
                    deadline.elapsed().as_secs_f64()
                ),
            ),
            _ => (
                FailureKind::Cancelled,
                "cancelled: token budget reached".to_string(),
            ),
        };
        for index in pending {
            let target = &allowed[index];
            self.reporter.report(ExtractionEvent::PageFailed {
                batch_id,
                url: &target.url,
                domain: &target.domain,
                error: &reason,
                kind,
            });
            outcome
                .failures
                .push(FailedUrl::new(target, reason.clone(), kind));
        }
    }

    fn record_result(
        &self,
        batch_id: Uuid,
        target: &FetchTarget,
        result: Result<ExtractedPage, AppError>,
        outcome: &mut BatchOutcome,
    ) {
        match result {
            Ok(page) => {
                outcome.estimated_tokens += estimate_summary_tokens(page.content_length);
                self.reporter.report(ExtractionEvent::PageExtracted {
                    batch_id,
                    url: &target.url,
                    content_length: page.content_length,
                    elapsed_ms: (page.response_time_secs * 1000.0) as u128,
                    tokens_so_far: outcome.estimated_tokens,
                });
                outcome.successes.push(page);
            }
            Err(e) => {
                let kind = if e.is_site_failure() {
                    FailureKind::Fetch
                } else {
                    FailureKind::Rejected
                };
                let reason = e.to_string();
                self.reporter.report(ExtractionEvent::PageFailed {
                    batch_id,
                    url: &target.url,
                    domain: &target.domain,
                    error: &reason,
                    kind,
                });
                outcome.failures.push(FailedUrl::new(target, reason, kind));
            }
        }
    }
}
