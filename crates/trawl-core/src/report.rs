use uuid::Uuid;

use crate::models::FailureKind;

/// Events emitted by the extractor for monitoring/logging.
#[derive(Debug, Clone)]
pub enum ExtractionEvent<'a> {
    BatchStarted {
        batch_id: Uuid,
        requested: usize,
        allowed: usize,
    },
    UrlBlocked {
        batch_id: Uuid,
        url: &'a str,
        reason: &'a str,
    },
    PageExtracted {
        batch_id: Uuid,
        url: &'a str,
        content_length: usize,
        elapsed_ms: u128,
        tokens_so_far: usize,
    },
    PageFailed {
        batch_id: Uuid,
        url: &'a str,
        domain: &'a str,
        error: &'a str,
        kind: FailureKind,
    },
    SlowSite {
        batch_id: Uuid,
        url: &'a str,
        domain: &'a str,
        elapsed_ms: u128,
    },
    BudgetReached {
        batch_id: Uuid,
        estimated_tokens: usize,
        pending: usize,
    },
    HardCapReached {
        batch_id: Uuid,
        pending: usize,
    },
    BatchFinished {
        batch_id: Uuid,
        successes: usize,
        failures: usize,
        slow: usize,
        elapsed_ms: u128,
    },
}

/// Trait for receiving extraction events (decoupled logging).
pub trait ExtractionReporter: Send + Sync {
    fn report(&self, event: ExtractionEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl ExtractionReporter for SilentReporter {}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingExtractionReporter;

impl ExtractionReporter for TracingExtractionReporter {
    fn report(&self, event: ExtractionEvent<'_>) {
        match event {
            ExtractionEvent::BatchStarted {
                batch_id,
                requested,
                allowed,
            } => {
                tracing::info!(%batch_id, requested, allowed, "Extraction batch started");
            }
            ExtractionEvent::UrlBlocked {
                batch_id,
                url,
                reason,
            } => {
                tracing::debug!(%batch_id, %url, %reason, "Skipping blocked URL");
            }
            ExtractionEvent::PageExtracted {
                batch_id,
                url,
                content_length,
                elapsed_ms,
                tokens_so_far,
            } => {
                tracing::debug!(
                    %batch_id,
                    %url,
                    content_length,
                    elapsed_ms,
                    tokens_so_far,
                    "Page extracted"
                );
            }
            ExtractionEvent::PageFailed {
                batch_id,
                url,
                domain,
                error,
                kind,
            } => {
                tracing::debug!(%batch_id, %url, %domain, %error, ?kind, "Page failed");
            }
            ExtractionEvent::SlowSite {
                batch_id,
                url,
                domain,
                elapsed_ms,
            } => {
                tracing::info!(
                    %batch_id,
                    %url,
                    %domain,
                    elapsed_ms,
                    "Site still pending at slow mark"
                );
            }
            ExtractionEvent::BudgetReached {
                batch_id,
                estimated_tokens,
                pending,
            } => {
                tracing::info!(%batch_id, estimated_tokens, pending, "Token budget reached");
            }
            ExtractionEvent::HardCapReached { batch_id, pending } => {
                tracing::warn!(%batch_id, pending, "Hard cap reached, cancelling pending fetches");
            }
            ExtractionEvent::BatchFinished {
                batch_id,
                successes,
                failures,
                slow,
                elapsed_ms,
            } => {
                tracing::info!(
                    %batch_id,
                    successes,
                    failures,
                    slow,
                    elapsed_ms,
                    "Extraction batch finished"
                );
            }
        }
    }
}

impl<R: ExtractionReporter + ?Sized> ExtractionReporter for std::sync::Arc<R> {
    fn report(&self, event: ExtractionEvent<'_>) {
        (**self).report(event);
    }
}
