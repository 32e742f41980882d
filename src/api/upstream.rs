//! Upstream request execution.
//!
//! Every attempt, successful or not, is reported to the [`HealthStore`]
//! before the result is returned, so health feedback is never skipped.

use crate::core::error::AppError;
use crate::core::metrics::get_metrics;
use crate::core::models::GroupProvider;
use crate::services::health_store::HealthStore;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Inbound headers never passed to a provider. Gateway credentials are
/// replaced by the provider's own.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "content-length",
    "authorization",
    "x-api-key",
];

/// Upstream headers not copied back to the caller.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "content-length",
];

/// The parts of an inbound request that are forwarded.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    /// Upstream path including the query string, always starting with `/`.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A fully buffered upstream response.
#[derive(Debug, Clone)]
pub struct ForwardedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub elapsed_ms: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForwardError {
    #[error("Upstream provider '{provider}' timed out after {timeout_ms} ms")]
    Timeout {
        provider: String,
        timeout_ms: u64,
        elapsed_ms: u64,
    },

    #[error("Upstream provider '{provider}' unreachable: {message}")]
    Unreachable {
        provider: String,
        message: String,
        elapsed_ms: u64,
    },
}

impl ForwardError {
    pub fn elapsed_ms(&self) -> u64 {
        match self {
            ForwardError::Timeout { elapsed_ms, .. } | ForwardError::Unreachable { elapsed_ms, .. } => {
                *elapsed_ms
            }
        }
    }
}

impl From<ForwardError> for AppError {
    fn from(err: ForwardError) -> Self {
        match err {
            ForwardError::Timeout {
                provider,
                timeout_ms,
                ..
            } => AppError::UpstreamTimeout {
                provider,
                timeout_ms,
            },
            ForwardError::Unreachable {
                provider, message, ..
            } => AppError::UpstreamUnreachable { provider, message },
        }
    }
}

/// Provider base URL with one trailing slash removed, followed by `path_and_query`.
pub fn build_target_url(base_url: &str, path_and_query: &str) -> String {
    let base = base_url.strip_suffix('/').unwrap_or(base_url);
    if path_and_query.starts_with('/') {
        format!("{}{}", base, path_and_query)
    } else {
        format!("{}/{}", base, path_and_query)
    }
}

/// Copy inbound headers minus hop-by-hop and gateway credentials, then inject
/// the provider credential as a bearer token.
pub fn build_upstream_headers(inbound: &HeaderMap, credential: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 1);
    for (name, value) in inbound {
        if !STRIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    if let Some(credential) = credential.filter(|c| !c.is_empty()) {
        match HeaderValue::from_str(&format!("Bearer {}", credential)) {
            Ok(mut value) => {
                value.set_sensitive(true);
                headers.insert(header::AUTHORIZATION, value);
            }
            Err(_) => tracing::warn!("Provider credential is not a valid header value, sending without it"),
        }
    }
    headers
}

fn filter_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if !STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

/// Client-facing description of a transport error. Avoids leaking internal
/// URLs and addresses from the underlying error.
fn describe_transport_error(error: &reqwest::Error) -> &'static str {
    if error.is_connect() {
        "Failed to connect to upstream provider"
    } else if error.is_body() || error.is_decode() {
        "Failed to read upstream response"
    } else {
        "Upstream request failed"
    }
}

/// Sends requests to providers under each provider's deadline.
#[derive(Clone)]
pub struct RequestForwarder {
    client: reqwest::Client,
    health: HealthStore,
}

impl RequestForwarder {
    pub fn new(client: reqwest::Client, health: HealthStore) -> Self {
        Self { client, health }
    }

    pub async fn forward(
        &self,
        provider: &GroupProvider,
        request: InboundRequest,
    ) -> Result<ForwardedResponse, ForwardError> {
        let url = build_target_url(&provider.provider.base_url, &request.path_and_query);
        let headers = build_upstream_headers(&request.headers, provider.provider.credential.as_deref());
        let timeout_ms = provider.provider.timeout_ms;

        let start = Instant::now();
        let send = async {
            let response = self
                .client
                .request(request.method, &url)
                .headers(headers)
                .body(request.body)
                .send()
                .await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, headers, body))
        };
        let outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), send).await;
        let elapsed = start.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;
        let latency_ms = elapsed.as_secs_f64() * 1000.0;

        get_metrics()
            .upstream_latency
            .with_label_values(&[provider.name()])
            .observe(elapsed.as_secs_f64());

        match outcome {
            Ok(Ok((status, headers, body))) => {
                let success = status.as_u16() < 400;
                self.health.record(provider.id(), success, latency_ms).await;

                tracing::debug!(
                    provider = %provider.name(),
                    url = %url,
                    status = status.as_u16(),
                    elapsed_ms = elapsed_ms,
                    "Upstream responded"
                );

                Ok(ForwardedResponse {
                    status,
                    headers: filter_response_headers(&headers),
                    body,
                    elapsed_ms,
                })
            }
            Ok(Err(error)) => {
                self.health.record(provider.id(), false, latency_ms).await;

                tracing::error!(
                    provider = %provider.name(),
                    url = %url,
                    error = %error,
                    is_timeout = error.is_timeout(),
                    is_connect = error.is_connect(),
                    elapsed_ms = elapsed_ms,
                    "Upstream request failed"
                );

                if error.is_timeout() {
                    return Err(ForwardError::Timeout {
                        provider: provider.name().to_string(),
                        timeout_ms,
                        elapsed_ms,
                    });
                }
                Err(ForwardError::Unreachable {
                    provider: provider.name().to_string(),
                    message: describe_transport_error(&error).to_string(),
                    elapsed_ms,
                })
            }
            Err(_) => {
                self.health.record(provider.id(), false, latency_ms).await;

                tracing::error!(
                    provider = %provider.name(),
                    url = %url,
                    timeout_ms = timeout_ms,
                    "Upstream request timed out"
                );

                Err(ForwardError::Timeout {
                    provider: provider.name().to_string(),
                    timeout_ms,
                    elapsed_ms,
                })
            }
        }
    }
}
