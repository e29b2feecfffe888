//! Token and wall-clock budgets for an extraction batch.
//!
//! A [`Budget`] says how much content is "enough" and how long a batch may
//! run. A [`Deadline`] is the running clock for one batch; it is created once
//! and passed to everything that needs to know how much time is left.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::AppError;

/// Per-page cap on estimated summary tokens.
pub const MAX_SUMMARY_TOKENS_PER_PAGE: usize = 300;

/// Layered HTTP timeouts for a single fetch.
///
/// Must satisfy `connect <= read <= total`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FetchTimeouts {
    pub connect: Duration,
    pub read: Duration,
    pub total: Duration,
}

impl Default for FetchTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(2),
            read: Duration::from_secs(6),
            total: Duration::from_secs(8),
        }
    }
}

/// How much to gather and how long to wait for it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Budget {
    /// Stop once this many estimated summary tokens have been gathered.
    pub target_tokens: usize,
    /// Cancel everything still pending after this long.
    pub hard_cap: Duration,
    /// Record pending URLs as slow after this long (without cancelling them).
    pub slow_mark: Duration,
    pub timeouts: FetchTimeouts,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            target_tokens: 3000,
            hard_cap: Duration::from_secs(8),
            slow_mark: Duration::from_secs(6),
            timeouts: FetchTimeouts::default(),
        }
    }
}

impl Budget {
    pub fn with_target_tokens(mut self, target_tokens: usize) -> Self {
        self.target_tokens = target_tokens;
        self
    }

    /// Set the hard cap. The per-request timeout follows it so that the
    /// layering stays intact.
    pub fn with_hard_cap(mut self, hard_cap: Duration) -> Self {
        self.hard_cap = hard_cap;
        self.timeouts.total = hard_cap;
        if self.timeouts.read > hard_cap {
            self.timeouts.read = hard_cap;
        }
        if self.timeouts.connect > self.timeouts.read {
            self.timeouts.connect = self.timeouts.read;
        }
        if self.slow_mark > hard_cap {
            self.slow_mark = hard_cap;
        }
        self
    }

    pub fn with_slow_mark(mut self, slow_mark: Duration) -> Self {
        self.slow_mark = slow_mark;
        self
    }

    pub fn with_timeouts(mut self, timeouts: FetchTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Check that every outer timeout is at least as long as the inner one.
    pub fn validate(&self) -> Result<(), AppError> {
        let t = &self.timeouts;
        if self.hard_cap.is_zero() {
            return Err(AppError::ConfigError("hard cap must be positive".into()));
        }
        if t.connect > t.read {
            return Err(AppError::ConfigError(format!(
                "connect timeout ({:?}) exceeds read timeout ({:?})",
                t.connect, t.read
            )));
        }
        if t.read > t.total {
            return Err(AppError::ConfigError(format!(
                "read timeout ({:?}) exceeds per-request timeout ({:?})",
                t.read, t.total
            )));
        }
        if t.total > self.hard_cap {
            return Err(AppError::ConfigError(format!(
                "per-request timeout ({:?}) exceeds hard cap ({:?})",
                t.total, self.hard_cap
            )));
        }
        if self.slow_mark > self.hard_cap {
            return Err(AppError::ConfigError(format!(
                "slow mark ({:?}) exceeds hard cap ({:?})",
                self.slow_mark, self.hard_cap
            )));
        }
        Ok(())
    }
}

/// Estimated tokens a summary of `content_chars` characters would cost.
///
/// Raw tokens are `chars / 4`; a summary is about a third of that, capped per
/// page. This is a heuristic and only meant for early-exit decisions.
pub fn estimate_summary_tokens(content_chars: usize) -> usize {
    (content_chars / 4 / 3).min(MAX_SUMMARY_TOKENS_PER_PAGE)
}

/// The running clock for one batch.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    slow_mark: Instant,
    hard_cap: Instant,
}

impl Deadline {
    pub fn start(budget: &Budget) -> Self {
        let started = Instant::now();
        Self {
            started,
            slow_mark: started + budget.slow_mark,
            hard_cap: started + budget.hard_cap,
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn slow_mark(&self) -> Instant {
        self.slow_mark
    }

    pub fn hard_cap(&self) -> Instant {
        self.hard_cap
    }

    /// Time left before the hard cap, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.hard_cap.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.hard_cap
    }

    /// Timeout for a request starting now: the per-request limit, clipped
    /// to whatever is left of the batch.
    pub fn request_timeout(&self, per_request: Duration) -> Duration {
        per_request.min(self.remaining())
    }
}
