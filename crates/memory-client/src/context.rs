//! Context reads with degraded-mode fallback.
//!
//! A context read never fails. When the memory service cannot be asked
//! (breaker refuses) or does not answer (error, timeout), the last-known
//! entry from the persisted cache is served instead, and failing that a
//! fixed notice. Either way the result is flagged `degraded`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tt_domain::config::{CacheConfig, MemoryConfig};
use tt_domain::trace::TraceEvent;
use tt_store::ContextCache;

use crate::breaker::CircuitBreaker;
use crate::provider::MemoryProvider;

/// Returned in place of context when nothing is cached for the query.
pub const UNAVAILABLE_NOTICE: &str =
    "[memory context unavailable: the memory service is unreachable and nothing is cached for this query]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSource {
    Live,
    CacheFresh,
    CacheStale,
    Unavailable,
}

impl ContextSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::CacheFresh => "cache_fresh",
            Self::CacheStale => "cache_stale",
            Self::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextResult {
    pub text: String,
    /// True whenever the text did not come from a successful live call.
    pub degraded: bool,
    pub source: ContextSource,
}

pub struct ContextService {
    provider: Arc<dyn MemoryProvider>,
    breaker: Arc<CircuitBreaker>,
    cache: ContextCache,
    ttl: Duration,
    timeout: Duration,
}

impl ContextService {
    pub fn new(
        provider: Arc<dyn MemoryProvider>,
        breaker: Arc<CircuitBreaker>,
        cache: ContextCache,
        ttl: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            breaker,
            cache,
            ttl,
            timeout,
        }
    }

    pub fn from_config(
        provider: Arc<dyn MemoryProvider>,
        breaker: Arc<CircuitBreaker>,
        cache: ContextCache,
        memory: &MemoryConfig,
        cache_cfg: &CacheConfig,
    ) -> Self {
        Self::new(provider, breaker, cache, cache_cfg.ttl(), memory.context_timeout())
    }

    pub fn cache(&self) -> &ContextCache {
        &self.cache
    }

    pub async fn fetch_context(&self, query: &str) -> ContextResult {
        let result = match self.breaker.try_acquire() {
            Some(attempt) => {
                match tokio::time::timeout(self.timeout, self.provider.fetch_context(query)).await
                {
                    Ok(Ok(text)) => {
                        attempt.success();
                        if let Err(e) = self.cache.put(query, &text) {
                            tracing::warn!(error = %e, "context cache write failed");
                        }
                        ContextResult {
                            text,
                            degraded: false,
                            source: ContextSource::Live,
                        }
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "context fetch failed, serving fallback");
                        attempt.settle_error(&e);
                        self.fallback(query)
                    }
                    Err(_) => {
                        tracing::warn!(
                            timeout_ms = self.timeout.as_millis() as u64,
                            "context fetch timed out, serving fallback"
                        );
                        attempt.failure();
                        self.fallback(query)
                    }
                }
            }
            None => {
                tracing::debug!(breaker = %self.breaker.name(), "breaker refused context fetch");
                self.fallback(query)
            }
        };

        TraceEvent::ContextServed {
            source: result.source.as_str().into(),
            degraded: result.degraded,
            chars: result.text.chars().count(),
        }
        .emit();
        result
    }

    /// Cached entry (fresh or stale), else the unavailable notice.
    /// Cache errors count as a miss.
    fn fallback(&self, query: &str) -> ContextResult {
        let entry = match self.cache.lookup(query) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "context cache read failed");
                None
            }
        };
        match entry {
            Some(entry) => {
                let source = if entry.is_fresh(self.ttl, chrono::Utc::now()) {
                    ContextSource::CacheFresh
                } else {
                    ContextSource::CacheStale
                };
                ContextResult {
                    text: entry.context,
                    degraded: true,
                    source,
                }
            }
            None => ContextResult {
                text: UNAVAILABLE_NOTICE.to_string(),
                degraded: true,
                source: ContextSource::Unavailable,
            },
        }
    }
}
