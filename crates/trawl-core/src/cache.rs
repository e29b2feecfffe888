//! In-process answer cache.

use std::time::Duration;

use moka::future::Cache;

use crate::error::AppError;
use crate::models::compute_hash;
use crate::traits::AnswerStore;

/// [`AnswerStore`] backed by a bounded, time-limited moka cache.
///
/// Keys are SHA-256 hashes of the whitespace- and case-normalized query and
/// context, so trivially different phrasings of the same request share an
/// entry.
#[derive(Clone)]
pub struct MemoryAnswerCache {
    entries: Cache<String, String>,
}

impl MemoryAnswerCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn cache_key(query: &str, context: &str) -> String {
        compute_hash(&format!("{}\n--\n{}", normalize(query), normalize(context)))
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl AnswerStore for MemoryAnswerCache {
    async fn lookup(&self, query: &str, context: &str) -> Result<Option<String>, AppError> {
        Ok(self.entries.get(&Self::cache_key(query, context)).await)
    }

    async fn save(&self, query: &str, context: &str, answer: &str) -> Result<(), AppError> {
        self.entries
            .insert(Self::cache_key(query, context), answer.to_string())
            .await;
        Ok(())
    }
}
