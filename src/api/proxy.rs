//! The proxied route: `ANY {prefix}/:group[/*path]`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, Method, Uri},
    response::Response,
    Extension,
};
use bytes::Bytes;

use crate::api::handlers::AppState;
use crate::core::logging::get_request_id;
use crate::core::middleware::{client_addr, RequestId};
use crate::services::GatewayRequest;

/// Upstream path for the wildcard capture, plus the inbound query string.
pub fn upstream_path(path: Option<&str>, query: Option<&str>) -> String {
    let path = path.unwrap_or("").trim_start_matches('/');
    match query {
        Some(q) if !q.is_empty() => format!("/{}?{}", path, q),
        _ => format!("/{}", path),
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    Path(params): Path<HashMap<String, String>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request_id: Option<Extension<RequestId>>,
    body: Bytes,
) -> Response {
    let group_slug = params.get("group").cloned().unwrap_or_default();
    let path_and_query = upstream_path(params.get("path").map(String::as_str), uri.query());
    let client_addr = client_addr(&headers, connect_info.map(|ConnectInfo(addr)| addr));
    let request_id = request_id
        .map(|Extension(RequestId(id))| id)
        .unwrap_or_else(get_request_id);

    tracing::debug!(
        group = %group_slug,
        method = %method,
        path = %path_and_query,
        client = %client_addr,
        body_bytes = body.len(),
        "Proxy request received"
    );

    state
        .gateway
        .handle(GatewayRequest {
            group_slug,
            method,
            path_and_query,
            headers,
            body,
            client_addr,
            request_id,
        })
        .await
}
