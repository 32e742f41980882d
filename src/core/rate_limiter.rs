//! Fixed-window rate limiting per API key.
//!
//! Each key gets one counter per 60-second bucket (`now_ms / window_ms`).
//! The counter is incremented and given its expiry in a single atomic cache
//! operation. When the cache is unreachable the limiter fails open.

use crate::core::cache::{CacheError, CacheStore};
use crate::core::cache_keys;
use crate::core::metrics::get_metrics;
use crate::core::models::ApiKeyId;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Start of the next bucket, epoch milliseconds.
    pub reset_at_ms: i64,
}

impl RateLimitDecision {
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(HeaderName::from_static(HEADER_LIMIT), HeaderValue::from(self.limit));
        headers.insert(
            HeaderName::from_static(HEADER_REMAINING),
            HeaderValue::from(self.remaining),
        );
        headers.insert(
            HeaderName::from_static(HEADER_RESET),
            HeaderValue::from(self.reset_at_ms),
        );
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    cache: Arc<dyn CacheStore>,
    window: Duration,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self {
            cache,
            window: cache_keys::RATE_LIMIT_WINDOW,
        }
    }

    fn window_ms(&self) -> i64 {
        (self.window.as_millis() as i64).max(1)
    }

    fn bucket(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp_millis().div_euclid(self.window_ms())
    }

    /// Count one request against `api_key_id`.
    pub async fn check(&self, api_key_id: ApiKeyId, limit: u32) -> RateLimitDecision {
        self.check_at(api_key_id, limit, Utc::now()).await
    }

    pub async fn check_at(
        &self,
        api_key_id: ApiKeyId,
        limit: u32,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let window_ms = self.window_ms();
        let bucket = self.bucket(now);
        let reset_at_ms = (bucket + 1) * window_ms;
        let key = cache_keys::rate_limit(api_key_id, bucket);

        match self.cache.incr_with_expiry(&key, self.window).await {
            Ok(count) => {
                let count = count.max(0) as u64;
                let allowed = count <= u64::from(limit);
                let remaining = u64::from(limit).saturating_sub(count) as u32;

                if !allowed {
                    tracing::warn!(
                        api_key_id = api_key_id,
                        limit = limit,
                        count = count,
                        reset_at_ms = reset_at_ms,
                        "Rate limit exceeded"
                    );
                }

                RateLimitDecision {
                    allowed,
                    limit,
                    remaining,
                    reset_at_ms,
                }
            }
            Err(e) => {
                tracing::error!(
                    api_key_id = api_key_id,
                    error = %e,
                    "Rate limit counter unavailable, allowing request"
                );
                get_metrics()
                    .fail_open
                    .with_label_values(&["rate_limiter"])
                    .inc();

                RateLimitDecision {
                    allowed: true,
                    limit,
                    remaining: limit,
                    reset_at_ms: now.timestamp_millis() + window_ms,
                }
            }
        }
    }

    /// Clear the current window's counter for a key.
    pub async fn reset(&self, api_key_id: ApiKeyId) -> Result<(), CacheError> {
        let key = cache_keys::rate_limit(api_key_id, self.bucket(Utc::now()));
        self.cache.del(&key).await?;
        tracing::info!(api_key_id = api_key_id, "Rate limit window reset");
        Ok(())
    }
}
