//! Per-domain circuit breaker with durable state.
//!
//! Protects extraction batches from sites that keep failing. Unlike a
//! classic breaker there is no half-open trial state: once a domain is blocked it
//! stays blocked until an administrator unblocks or whitelists it.
//!
//! # Domain States
//!
//! ```text
//! UNSEEN --[failure]--> FAILING (count < N) --[Nth failure]--> BLOCKED
//!                                                                 |
//! UNSEEN <--------------[unblock / whitelist]---------------------+
//! ```
//!
//! Whitelisted domains never leave `UNSEEN`/`FAILING`, no matter how often
//! they fail. Every mutation rewrites the state file atomically
//! (temp file + rename); a failed write is logged and the breaker keeps
//! serving from memory.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::AppError;
use crate::models::{
    BatchOutcome, BlockedDomain, FetchTarget, TemporaryFailure, domain_key, normalize_domain,
};

/// At most this many `-site:` exclusions are appended to a search query.
pub const MAX_SITE_EXCLUSIONS: usize = 25;

/// Tunable policy, persisted alongside the domain records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of failures before a domain is blocked.
    pub max_failures_before_block: u32,

    /// When false, `record_failure` is a no-op.
    pub auto_block_enabled: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures_before_block: 3,
            auto_block_enabled: true,
        }
    }
}

/// The full persisted document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerState {
    pub blocked_domains: BTreeMap<String, BlockedDomain>,
    pub temporary_failures: BTreeMap<String, TemporaryFailure>,
    pub whitelist: BTreeSet<String>,
    pub config: CircuitBreakerConfig,
}

impl CircuitBreakerState {
    /// Reason a URL's domain is skipped, or `None` if it may be fetched.
    fn skip_reason(&self, domain: &str) -> Option<String> {
        if self.whitelist.contains(domain) {
            return None;
        }
        self.blocked_domains
            .get(domain)
            .map(|record| format!("blocked: {}", record.reason))
    }
}

/// Where a single domain currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainStatus {
    Unseen,
    Failing { failure_count: u32 },
    Blocked { reason: String },
    Whitelisted,
}

/// What `record_failure` did with a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureVerdict {
    /// The domain is whitelisted; nothing recorded.
    Whitelisted,
    /// Auto-blocking is disabled; nothing recorded.
    AutoBlockDisabled,
    /// The domain was already blocked; nothing recorded.
    AlreadyBlocked,
    /// The failure was counted but the threshold is not reached yet.
    Counted { failure_count: u32, threshold: u32 },
    /// This failure reached the threshold and the domain is now blocked.
    Blocked { failure_count: u32 },
}

/// Counters for monitoring and the `domains stats` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerStats {
    pub blocked_domains: usize,
    pub temporary_failures: usize,
    pub whitelisted_domains: usize,
    pub auto_block_enabled: bool,
    pub max_failures_before_block: u32,
}

/// Thread-safe, persistent registry of domains to skip.
///
/// Cheap to clone; all clones share the same state and the same file.
#[derive(Clone)]
pub struct DomainCircuitBreaker {
    path: Option<PathBuf>,
    state: Arc<Mutex<CircuitBreakerState>>,
    /// Serialises read-modify-persist cycles so the file always reflects the
    /// mutations in the order they were applied.
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl DomainCircuitBreaker {
    /// Load state from `path`.
    ///
    /// Never fails: a missing file starts fresh, and an unreadable or
    /// corrupted one is logged and replaced by empty state on the next write.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<CircuitBreakerState>(&raw) {
                Ok(state) => {
                    tracing::info!(
                        path = %path.display(),
                        blocked = state.blocked_domains.len(),
                        whitelisted = state.whitelist.len(),
                        "Loaded domain circuit breaker state"
                    );
                    state
                }
                Err(e) => {
                    tracing::error!(
                        path = %path.display(),
                        error = %e,
                        "Corrupted circuit breaker state, starting fresh"
                    );
                    CircuitBreakerState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No circuit breaker state file, starting fresh");
                CircuitBreakerState::default()
            }
            Err(e) => {
                tracing::error!(
                    path = %path.display(),
                    error = %e,
                    "Failed to read circuit breaker state, starting fresh"
                );
                CircuitBreakerState::default()
            }
        };

        Self::from_parts(Some(path), state)
    }

    /// A breaker that never touches the filesystem.
    pub fn in_memory(config: CircuitBreakerConfig) -> Self {
        let state = CircuitBreakerState {
            config,
            ..Default::default()
        };
        Self::from_parts(None, state)
    }

    fn from_parts(path: Option<PathBuf>, state: CircuitBreakerState) -> Self {
        Self {
            path,
            state: Arc::new(Mutex::new(state)),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Acquires the state mutex, recovering from poison if necessary.
    fn lock_state(&self) -> std::sync::MutexGuard<'_, CircuitBreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned circuit breaker mutex");
            poisoned.into_inner()
        })
    }

    // ---- Reads ----

    pub fn is_allowed(&self, url: &str) -> bool {
        self.lock_state().skip_reason(&domain_key(url)).is_none()
    }

    /// Partition URLs into `(allowed, blocked)`; blocked entries carry a
    /// `"blocked: <reason>"` string.
    pub fn filter_urls<S: AsRef<str>>(&self, urls: &[S]) -> (Vec<String>, Vec<(String, String)>) {
        let targets = urls.iter().map(|url| FetchTarget::new(url.as_ref())).collect();
        let (allowed, blocked) = self.filter_targets(targets);
        (
            allowed.into_iter().map(|target| target.url).collect(),
            blocked
                .into_iter()
                .map(|(target, reason)| (target.url, reason))
                .collect(),
        )
    }

    /// Like [`filter_urls`](Self::filter_urls), keeping each target's
    /// domain key.
    pub fn filter_targets(
        &self,
        targets: Vec<FetchTarget>,
    ) -> (Vec<FetchTarget>, Vec<(FetchTarget, String)>) {
        let state = self.lock_state();
        let mut allowed = Vec::new();
        let mut blocked = Vec::new();

        for target in targets {
            match state.skip_reason(&target.domain) {
                Some(reason) => blocked.push((target, reason)),
                None => allowed.push(target),
            }
        }

        (allowed, blocked)
    }

    pub fn status(&self, domain: &str) -> DomainStatus {
        let domain = normalize_domain(domain);
        let state = self.lock_state();
        if state.whitelist.contains(&domain) {
            DomainStatus::Whitelisted
        } else if let Some(record) = state.blocked_domains.get(&domain) {
            DomainStatus::Blocked {
                reason: record.reason.clone(),
            }
        } else if let Some(record) = state.temporary_failures.get(&domain) {
            DomainStatus::Failing {
                failure_count: record.failure_count,
            }
        } else {
            DomainStatus::Unseen
        }
    }

    /// Blocked domains with their reasons, sorted by domain.
    pub fn blocked_domains(&self) -> Vec<(String, String)> {
        self.lock_state()
            .blocked_domains
            .iter()
            .map(|(domain, record)| (domain.clone(), record.reason.clone()))
            .collect()
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.lock_state();
        CircuitBreakerStats {
            blocked_domains: state.blocked_domains.len(),
            temporary_failures: state.temporary_failures.len(),
            whitelisted_domains: state.whitelist.len(),
            auto_block_enabled: state.config.auto_block_enabled,
            max_failures_before_block: state.config.max_failures_before_block,
        }
    }

    /// A copy of the full state, for inspection.
    pub fn snapshot(&self) -> CircuitBreakerState {
        self.lock_state().clone()
    }

    /// `-site:` exclusions for the most recently blocked domains, ready to
    /// append to a search query. Empty when nothing is blocked.
    pub fn site_exclusions(&self) -> String {
        let state = self.lock_state();
        let mut recent: Vec<(&String, &BlockedDomain)> = state
            .blocked_domains
            .iter()
            .filter(|(domain, _)| !state.whitelist.contains(*domain))
            .filter(|(domain, _)| !domain.contains(char::is_whitespace) && !domain.contains('/'))
            .collect();
        recent.sort_by(|a, b| b.1.blocked_at.cmp(&a.1.blocked_at));

        recent
            .into_iter()
            .take(MAX_SITE_EXCLUSIONS)
            .map(|(domain, _)| {
                let host = domain.split(':').next().unwrap_or(domain);
                format!("-site:{host}")
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    // ---- Writes ----

    /// Record a failure for the URL's domain, blocking it once the count
    /// reaches the configured threshold.
    pub async fn record_failure(&self, url: &str, error_message: &str) -> FailureVerdict {
        self.record_domain_failure(domain_key(url), error_message)
            .await
    }

    async fn record_domain_failure(&self, domain: String, error_message: &str) -> FailureVerdict {
        let error_message = error_message.to_string();

        self.mutate(move |state| {
            if state.whitelist.contains(&domain) {
                return (FailureVerdict::Whitelisted, false);
            }
            if !state.config.auto_block_enabled {
                return (FailureVerdict::AutoBlockDisabled, false);
            }
            if state.blocked_domains.contains_key(&domain) {
                return (FailureVerdict::AlreadyBlocked, false);
            }

            let now = Utc::now();
            let record = state
                .temporary_failures
                .entry(domain.clone())
                .or_insert_with(|| TemporaryFailure {
                    failure_count: 0,
                    first_failure_at: now,
                    last_failure_at: now,
                    last_failure_reason: String::new(),
                });
            record.failure_count += 1;
            record.last_failure_at = now;
            record.last_failure_reason = error_message.clone();

            let failure_count = record.failure_count;
            let threshold = state.config.max_failures_before_block.max(1);

            if failure_count >= threshold {
                state.temporary_failures.remove(&domain);
                state.blocked_domains.insert(
                    domain.clone(),
                    BlockedDomain {
                        reason: format!("auto-blocked after {failure_count} failures"),
                        blocked_at: now,
                        failure_count_at_block: failure_count,
                        last_failure_reason: Some(error_message),
                    },
                );
                tracing::warn!(
                    %domain,
                    failures = failure_count,
                    "Domain auto-blocked after {} failures",
                    failure_count
                );
                (FailureVerdict::Blocked { failure_count }, true)
            } else {
                tracing::debug!(
                    %domain,
                    failures = failure_count,
                    threshold,
                    error = %error_message,
                    "Domain failure recorded"
                );
                (
                    FailureVerdict::Counted {
                        failure_count,
                        threshold,
                    },
                    true,
                )
            }
        })
        .await
    }

    /// Note that a URL was slow. Informational only: slowness alone never
    /// blocks a domain.
    pub fn record_slow_site(&self, url: &str, response_time_secs: f64) {
        self.log_slow_site(&domain_key(url), url, response_time_secs);
    }

    fn log_slow_site(&self, domain: &str, url: &str, response_time_secs: f64) {
        tracing::info!(
            %domain,
            %url,
            response_time_secs,
            "Slow site"
        );
    }

    /// Feed a finished batch back into the breaker.
    ///
    /// Only failures that say something about site health are counted;
    /// cancellations after the token budget was met and blocked URLs are not.
    /// With `count_slow_sites`, a URL that was slow and never failed also
    /// counts as one failure.
    pub async fn report_outcome(&self, outcome: &BatchOutcome, count_slow_sites: bool) {
        for failure in &outcome.failures {
            if failure.kind.counts_against_domain() {
                self.record_domain_failure(failure.domain.clone(), &failure.reason)
                    .await;
            }
        }

        for slow in &outcome.slow_sites {
            self.log_slow_site(&slow.domain, &slow.url, slow.elapsed_secs);
            let already_counted = outcome.failures.iter().any(|f| f.url == slow.url);
            if count_slow_sites && !already_counted {
                self.record_domain_failure(
                    slow.domain.clone(),
                    &format!("slow: {:.1}s", slow.elapsed_secs),
                )
                .await;
            }
        }
    }

    /// Block a domain by hand.
    pub async fn block_domain(&self, domain: &str, reason: &str) {
        let domain = normalize_domain(domain);
        let reason = reason.to_string();
        self.mutate(move |state| {
            let failure_count = state
                .temporary_failures
                .remove(&domain)
                .map(|r| r.failure_count)
                .unwrap_or(0);
            state.blocked_domains.insert(
                domain.clone(),
                BlockedDomain {
                    reason: reason.clone(),
                    blocked_at: Utc::now(),
                    failure_count_at_block: failure_count,
                    last_failure_reason: None,
                },
            );
            tracing::info!(%domain, %reason, "Blocked domain");
            ((), true)
        })
        .await;
    }

    /// Remove a block. Returns false if the domain was not blocked.
    pub async fn unblock_domain(&self, domain: &str) -> bool {
        let domain = normalize_domain(domain);
        self.mutate(move |state| {
            let removed = state.blocked_domains.remove(&domain).is_some();
            if removed {
                tracing::info!(%domain, "Unblocked domain");
            }
            (removed, removed)
        })
        .await
    }

    /// Exempt a domain from blocking. Any existing block is lifted.
    pub async fn add_to_whitelist(&self, domain: &str) {
        let domain = normalize_domain(domain);
        self.mutate(move |state| {
            state.blocked_domains.remove(&domain);
            state.whitelist.insert(domain.clone());
            tracing::info!(%domain, "Added to whitelist");
            ((), true)
        })
        .await;
    }

    /// Returns false if the domain was not whitelisted.
    pub async fn remove_from_whitelist(&self, domain: &str) -> bool {
        let domain = normalize_domain(domain);
        self.mutate(move |state| {
            let removed = state.whitelist.remove(&domain);
            if removed {
                tracing::info!(%domain, "Removed from whitelist");
            }
            (removed, removed)
        })
        .await
    }

    pub async fn set_auto_block(&self, enabled: bool) {
        self.mutate(move |state| {
            state.config.auto_block_enabled = enabled;
            ((), true)
        })
        .await;
    }

    pub async fn set_max_failures(&self, max_failures: u32) -> Result<(), AppError> {
        if max_failures == 0 {
            return Err(AppError::ConfigError(
                "max_failures_before_block must be at least 1".into(),
            ));
        }
        self.mutate(move |state| {
            state.config.max_failures_before_block = max_failures;
            ((), true)
        })
        .await;
        Ok(())
    }

    /// Write the current state to disk, surfacing any error. Call on shutdown.
    pub async fn flush(&self) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        let bytes = serde_json::to_vec_pretty(&*self.lock_state())?;
        self.persist(&bytes).await
    }

    /// Apply `f` under the write lock and persist if it reports a change.
    async fn mutate<T>(&self, f: impl FnOnce(&mut CircuitBreakerState) -> (T, bool)) -> T {
        let _guard = self.write_lock.lock().await;

        let (result, bytes) = {
            let mut state = self.lock_state();
            let (result, changed) = f(&mut state);
            let bytes = if changed && self.path.is_some() {
                match serde_json::to_vec_pretty(&*state) {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialize circuit breaker state");
                        None
                    }
                }
            } else {
                None
            };
            (result, bytes)
        };

        if let Some(bytes) = bytes
            && let Err(e) = self.persist(&bytes).await
        {
            tracing::error!(error = %e, "Failed to persist circuit breaker state, continuing in memory");
        }

        result
    }

    /// Atomically replace the state file: write a sibling temp file, sync
    /// it, then rename over the original.
    async fn persist(&self, bytes: &[u8]) -> Result<(), AppError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AppError::PersistenceError(format!("create {}: {e}", parent.display()))
            })?;
        }

        let tmp = temp_path(path);
        let write = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            Ok::<_, std::io::Error>(())
        };
        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(AppError::PersistenceError(format!(
                "write {}: {e}",
                tmp.display()
            )));
        }

        tokio::fs::rename(&tmp, path).await.map_err(|e| {
            AppError::PersistenceError(format!("rename to {}: {e}", path.display()))
        })
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "state.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}
