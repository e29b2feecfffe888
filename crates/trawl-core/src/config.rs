use std::path::PathBuf;
use std::time::Duration;

use crate::budget::Budget;
use crate::error::AppError;
use crate::pipeline::PipelineConfig;

pub const DEFAULT_STATE_FILE: &str = "data/blocked_domains.json";

/// Runtime configuration for the pipeline and its stores.
#[derive(Debug, Clone)]
pub struct TrawlConfig {
    /// Where the domain circuit breaker keeps its state.
    pub state_file: PathBuf,
    pub pipeline: PipelineConfig,
    pub cache_capacity: u64,
    pub cache_ttl: Duration,
}

impl Default for TrawlConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            pipeline: PipelineConfig::default(),
            cache_capacity: 1_000,
            cache_ttl: Duration::from_secs(3600),
        }
    }
}

impl TrawlConfig {
    /// Read configuration from environment variables.
    ///
    /// - `TRAWL_STATE_FILE` (defaults to `data/blocked_domains.json`)
    /// - `TRAWL_TARGET_TOKENS` (defaults to 3000)
    /// - `TRAWL_HARD_CAP_SECS` (defaults to 8)
    /// - `TRAWL_SLOW_MARK_SECS` (defaults to 6, clamped to the hard cap)
    /// - `TRAWL_MAX_PROMPT_TOKENS` (defaults to 12000)
    /// - `TRAWL_CACHE_CAPACITY` (defaults to 1000)
    /// - `TRAWL_CACHE_TTL_SECS` (defaults to 3600)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`TrawlConfig::from_env`], reading values through `get`.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let defaults = Self::default();

        let state_file = get("TRAWL_STATE_FILE")
            .filter(|raw| !raw.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.state_file);

        let mut budget = Budget::default();
        if let Some(raw) = get("TRAWL_TARGET_TOKENS") {
            budget = budget.with_target_tokens(parse_positive("TRAWL_TARGET_TOKENS", &raw)? as usize);
        }
        if let Some(raw) = get("TRAWL_HARD_CAP_SECS") {
            budget = budget.with_hard_cap(parse_secs("TRAWL_HARD_CAP_SECS", &raw)?);
        }
        if let Some(raw) = get("TRAWL_SLOW_MARK_SECS") {
            budget = budget.with_slow_mark(parse_secs("TRAWL_SLOW_MARK_SECS", &raw)?);
        }
        budget.validate()?;

        let max_prompt_tokens = match get("TRAWL_MAX_PROMPT_TOKENS") {
            None => defaults.pipeline.max_prompt_tokens,
            Some(raw) => parse_positive("TRAWL_MAX_PROMPT_TOKENS", &raw)? as usize,
        };

        let cache_capacity = match get("TRAWL_CACHE_CAPACITY") {
            None => defaults.cache_capacity,
            Some(raw) => parse_positive("TRAWL_CACHE_CAPACITY", &raw)?,
        };

        let cache_ttl = match get("TRAWL_CACHE_TTL_SECS") {
            None => defaults.cache_ttl,
            Some(raw) => parse_secs("TRAWL_CACHE_TTL_SECS", &raw)?,
        };

        Ok(Self {
            state_file,
            pipeline: PipelineConfig {
                budget,
                max_prompt_tokens,
                ..defaults.pipeline
            },
            cache_capacity,
            cache_ttl,
        })
    }
}

fn parse_positive(key: &str, raw: &str) -> Result<u64, AppError> {
    let parsed: u64 = raw.trim().parse().map_err(|_| {
        AppError::ConfigError(format!("Invalid {key} '{raw}': must be a positive integer"))
    })?;
    if parsed == 0 {
        return Err(AppError::ConfigError(format!("{key} must be at least 1")));
    }
    Ok(parsed)
}

fn parse_secs(key: &str, raw: &str) -> Result<Duration, AppError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| {
            AppError::ConfigError(format!(
                "Invalid {key} '{raw}': must be a positive number of seconds"
            ))
        })
}
