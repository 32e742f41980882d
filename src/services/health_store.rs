//! Per-provider health tracking in the shared cache.
//!
//! Reads never fail: a missing record or an unreachable cache yields the
//! optimistic defaults. Writes are best-effort and refresh the record's TTL,
//! so a provider with no traffic for five minutes starts over as healthy.

use crate::core::cache::{self, CacheStore};
use crate::core::cache_keys;
use crate::core::metrics::get_metrics;
use crate::core::models::{HealthRecord, ProviderId};
use crate::core::request_logger::{HealthTransition, HealthTransitionRecord, LogEvent, LogSink};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct HealthStore {
    cache: Arc<dyn CacheStore>,
    ttl: Duration,
    log_sink: Option<LogSink>,
}

impl HealthStore {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self {
            cache,
            ttl: cache_keys::HEALTH_TTL,
            log_sink: None,
        }
    }

    /// Report healthy/unhealthy transitions to `sink`.
    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub async fn get(&self, provider_id: ProviderId) -> HealthRecord {
        let key = cache_keys::health(provider_id);
        match cache::get_json::<HealthRecord>(self.cache.as_ref(), &key).await {
            Ok(Some(record)) => record.normalized(),
            Ok(None) => HealthRecord::optimistic(Utc::now()),
            Err(e) => {
                tracing::warn!(
                    provider_id = provider_id,
                    error = %e,
                    "Health lookup failed, assuming healthy"
                );
                get_metrics()
                    .fail_open
                    .with_label_values(&["health_store"])
                    .inc();
                HealthRecord::optimistic(Utc::now())
            }
        }
    }

    /// Fold one upstream attempt into the provider's record.
    pub async fn record(&self, provider_id: ProviderId, success: bool, latency_ms: f64) {
        let previous = self.get(provider_id).await;
        let updated = previous.apply(success, latency_ms, Utc::now());

        let key = cache_keys::health(provider_id);
        if let Err(e) = cache::set_json(self.cache.as_ref(), &key, &updated, self.ttl).await {
            tracing::error!(
                provider_id = provider_id,
                error = %e,
                "Failed to store provider health"
            );
            return;
        }

        get_metrics()
            .provider_health
            .with_label_values(&[&provider_id.to_string()])
            .set(if updated.healthy { 1.0 } else { 0.0 });

        tracing::debug!(
            provider_id = provider_id,
            success = success,
            latency_ms = latency_ms,
            consecutive_failures = updated.consecutive_failures,
            success_rate = updated.success_rate,
            avg_response_time_ms = updated.avg_response_time_ms,
            "Provider health updated"
        );

        let transition = match (previous.healthy, updated.healthy) {
            (true, false) => {
                tracing::warn!(
                    provider_id = provider_id,
                    consecutive_failures = updated.consecutive_failures,
                    "Provider marked as unhealthy"
                );
                Some(HealthTransition::BecameUnhealthy)
            }
            (false, true) => {
                tracing::info!(provider_id = provider_id, "Provider recovered");
                Some(HealthTransition::Recovered)
            }
            _ => None,
        };

        if let (Some(transition), Some(sink)) = (transition, &self.log_sink) {
            sink.emit(LogEvent::HealthTransition(HealthTransitionRecord {
                provider_id,
                transition,
                consecutive_failures: updated.consecutive_failures,
                timestamp: updated.last_checked_at,
            }));
        }
    }
}
