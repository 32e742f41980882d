//! Per-request orchestration.
//!
//! `authenticate -> resolve group -> authorize -> rate limit -> select -> forward`.
//! Each request ends in exactly one terminal state, and every terminal state
//! emits one [`LogEvent::Request`] and one request metric sample.

use crate::api::auth::KeyAuthenticator;
use crate::api::upstream::{ForwardedResponse, InboundRequest, RequestForwarder};
use crate::core::cache::CacheStore;
use crate::core::error::{AppError, Result};
use crate::core::metrics::get_metrics;
use crate::core::models::{ApiKeyId, Group, GroupId, GroupProvider};
use crate::core::rate_limiter::{RateLimitDecision, RateLimiter};
use crate::core::request_logger::{LogEvent, LogSink, RequestLogRecord};
use crate::core::store::ConfigStore;
use crate::services::group_resolver::GroupResolver;
use crate::services::health_store::HealthStore;
use crate::services::provider_selector::{Candidate, ProviderSelector, SelectionError};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;

pub const HEADER_PROVIDER: &str = "x-proxy-provider";
pub const HEADER_PROVIDER_ID: &str = "x-proxy-provider-id";
pub const HEADER_RESPONSE_TIME: &str = "x-proxy-response-time";
pub const HEADER_TOTAL_TIME: &str = "x-proxy-total-time";

/// Metric label used before a group or provider is known.
const UNRESOLVED_LABEL: &str = "none";

impl From<SelectionError> for AppError {
    fn from(err: SelectionError) -> Self {
        match err {
            SelectionError::NoProviderAvailable(slug) => AppError::NoProviderAvailable(slug),
        }
    }
}

/// An inbound proxied request, already buffered.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub group_slug: String,
    pub method: Method,
    /// Path forwarded upstream, with the inbound query string.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_addr: String,
    pub request_id: String,
}

/// A provider response plus the gateway metadata returned with it.
#[derive(Debug)]
pub struct ProxiedResponse {
    pub upstream: ForwardedResponse,
    pub provider: GroupProvider,
    pub rate_limit: RateLimitDecision,
    pub total_ms: u64,
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(HeaderName::from_static(name), value);
        }
        Err(_) => tracing::debug!(header = name, "Skipping header with invalid value"),
    }
}

impl IntoResponse for ProxiedResponse {
    fn into_response(self) -> Response {
        let ForwardedResponse {
            status,
            mut headers,
            body,
            elapsed_ms,
        } = self.upstream;

        self.rate_limit.apply_headers(&mut headers);
        insert_header(&mut headers, HEADER_PROVIDER, self.provider.name());
        insert_header(&mut headers, HEADER_PROVIDER_ID, &self.provider.id().to_string());
        insert_header(&mut headers, HEADER_RESPONSE_TIME, &elapsed_ms.to_string());
        insert_header(&mut headers, HEADER_TOTAL_TIME, &self.total_ms.to_string());

        (status, headers, body).into_response()
    }
}

/// What a request learned on its way to a terminal state.
#[derive(Default)]
struct Progress {
    api_key_id: Option<ApiKeyId>,
    group: Option<(GroupId, String)>,
    provider: Option<GroupProvider>,
    rate_limit: Option<RateLimitDecision>,
    upstream_latency_ms: Option<u64>,
}

/// The gateway orchestrator.
#[derive(Clone)]
pub struct Gateway {
    authenticator: KeyAuthenticator,
    groups: GroupResolver,
    rate_limiter: RateLimiter,
    selector: ProviderSelector,
    forwarder: RequestForwarder,
    health: HealthStore,
    shared_cache: Arc<dyn CacheStore>,
    log_sink: LogSink,
}

impl Gateway {
    /// Wire the gateway components.
    ///
    /// `shared_cache` holds cross-replica state (health, rate windows, key
    /// lookups). `local_cache` holds group snapshots, which include decrypted
    /// provider credentials and therefore never leave the process.
    pub fn new(
        store: Arc<dyn ConfigStore>,
        shared_cache: Arc<dyn CacheStore>,
        local_cache: Arc<dyn CacheStore>,
        http_client: reqwest::Client,
        log_sink: LogSink,
    ) -> Self {
        let health = HealthStore::new(shared_cache.clone()).with_log_sink(log_sink.clone());
        Self {
            authenticator: KeyAuthenticator::new(store.clone(), shared_cache.clone()),
            groups: GroupResolver::new(store, local_cache),
            rate_limiter: RateLimiter::new(shared_cache.clone()),
            selector: ProviderSelector::new(health.clone()),
            forwarder: RequestForwarder::new(http_client, health.clone()),
            health,
            shared_cache,
            log_sink,
        }
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn health_store(&self) -> &HealthStore {
        &self.health
    }

    pub async fn cache_reachable(&self) -> bool {
        match self.shared_cache.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Shared cache ping failed");
                false
            }
        }
    }

    /// Current health and weight of every enabled provider in a group.
    pub async fn group_health(&self, slug: &str) -> Result<(Group, Vec<Candidate>)> {
        let group = self
            .groups
            .group_by_slug(slug)
            .await?
            .ok_or_else(|| AppError::GroupNotFound(slug.to_string()))?;
        let providers = self.groups.providers_for_group(&group).await?;
        let candidates = self.selector.candidates(&providers).await;
        Ok((group, candidates))
    }

    /// Run one request to its terminal state.
    pub async fn handle(&self, request: GatewayRequest) -> Response {
        let start = Instant::now();
        let mut progress = Progress::default();

        let slug = request.group_slug.clone();
        let method = request.method.to_string();
        let path = request.path_and_query.clone();
        let client_addr = request.client_addr.clone();
        let request_id = request.request_id.clone();
        let user_agent = request
            .headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let result = self.run(request, &mut progress).await;
        let total_ms = start.elapsed().as_millis() as u64;

        let (response, status, success, error_message) = match result {
            Ok(mut proxied) => {
                proxied.total_ms = total_ms;
                let status = proxied.upstream.status.as_u16();
                (proxied.into_response(), status, status < 400, None)
            }
            Err(err) => {
                let status = err.status().as_u16();
                let message = err.to_string();
                match &err {
                    AppError::Unauthenticated(_) | AppError::Forbidden { .. } => {
                        tracing::warn!(group = %slug, status = status, error = %message, "Request rejected")
                    }
                    AppError::GroupNotFound(_) | AppError::GroupDisabled(_) | AppError::RateLimited(_) => {
                        tracing::info!(group = %slug, status = status, error = %message, "Request rejected")
                    }
                    _ => tracing::error!(group = %slug, status = status, error = %message, "Request failed"),
                }
                let mut response = err.into_response();
                if let Some(decision) = &progress.rate_limit {
                    decision.apply_headers(response.headers_mut());
                }
                (response, status, false, Some(message))
            }
        };

        let group_label = progress
            .group
            .as_ref()
            .map(|(_, slug)| slug.as_str())
            .unwrap_or(UNRESOLVED_LABEL);
        let provider_label = progress
            .provider
            .as_ref()
            .map(|p| p.name())
            .unwrap_or(UNRESOLVED_LABEL);
        let metrics = get_metrics();
        metrics
            .request_count
            .with_label_values(&[group_label, provider_label, &status.to_string()])
            .inc();
        metrics
            .request_duration
            .with_label_values(&[group_label])
            .observe(total_ms as f64 / 1000.0);

        tracing::info!(
            group = %slug,
            provider = %provider_label,
            method = %method,
            path = %path,
            status = status,
            total_ms = total_ms,
            "Request completed"
        );

        self.log_sink.emit(LogEvent::Request(RequestLogRecord {
            request_id,
            group_slug: slug,
            group_id: progress.group.as_ref().map(|(id, _)| *id),
            provider_id: progress.provider.as_ref().map(|p| p.id()),
            provider_name: progress.provider.as_ref().map(|p| p.name().to_string()),
            api_key_id: progress.api_key_id,
            method,
            path,
            status_code: status,
            upstream_latency_ms: progress.upstream_latency_ms,
            total_duration_ms: total_ms,
            success,
            error_message,
            client_addr,
            user_agent,
            timestamp: Utc::now(),
        }));

        response
    }

    async fn run(&self, request: GatewayRequest, progress: &mut Progress) -> Result<ProxiedResponse> {
        let key = self.authenticator.authenticate(&request.headers).await?;
        progress.api_key_id = Some(key.id);

        let group = self
            .groups
            .group_by_slug(&request.group_slug)
            .await?
            .ok_or_else(|| AppError::GroupNotFound(request.group_slug.clone()))?;
        progress.group = Some((group.id, group.slug.clone()));

        if !key.can_access(group.id) {
            return Err(AppError::Forbidden {
                group: group.slug.clone(),
            });
        }
        if !group.enabled {
            return Err(AppError::GroupDisabled(group.slug.clone()));
        }

        let decision = self.rate_limiter.check(key.id, key.rate_limit).await;
        progress.rate_limit = Some(decision);
        if !decision.allowed {
            return Err(AppError::RateLimited(decision));
        }

        let providers = self.groups.providers_for_group(&group).await?;
        let selection = self.selector.select(&group, &providers).await?;
        progress.provider = Some(selection.provider.clone());

        let inbound = InboundRequest {
            method: request.method,
            path_and_query: request.path_and_query,
            headers: request.headers,
            body: request.body,
        };
        let upstream = self
            .forwarder
            .forward(&selection.provider, inbound)
            .await
            .map_err(|e| {
                progress.upstream_latency_ms = Some(e.elapsed_ms());
                e
            })?;
        progress.upstream_latency_ms = Some(upstream.elapsed_ms);

        Ok(ProxiedResponse {
            upstream,
            provider: selection.provider,
            rate_limit: decision,
            total_ms: 0,
        })
    }
}
