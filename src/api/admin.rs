//! Operator endpoints under `/admin/v1`.
//!
//! Mounted only when an admin key is configured; every route sits behind
//! [`admin_auth_middleware`](crate::core::middleware::admin_auth_middleware).

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

use crate::api::handlers::AppState;
use crate::core::error::{AppError, Result};
use crate::core::models::{ApiKeyId, HealthRecord, ProviderId, SelectionStrategy};

#[derive(Debug, Serialize)]
pub struct ProviderHealthStatus {
    pub provider_id: ProviderId,
    pub name: String,
    /// Group-scoped priority
    pub priority: u32,
    pub weight: f64,
    pub health: HealthRecord,
}

#[derive(Debug, Serialize)]
pub struct GroupHealthResponse {
    pub group: String,
    pub strategy: SelectionStrategy,
    pub enabled: bool,
    pub providers: Vec<ProviderHealthStatus>,
    pub healthy_providers: usize,
    pub unhealthy_providers: usize,
}

#[derive(Debug, Serialize)]
pub struct RateLimitResetResponse {
    pub api_key_id: ApiKeyId,
    pub reset: bool,
}

pub fn admin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/groups/:group/health", get(group_health))
        .route("/rate-limits/:api_key_id", delete(reset_rate_limit))
        .with_state(state)
}

/// Health and current weight of each enabled provider in a group.
pub async fn group_health(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Result<Json<GroupHealthResponse>> {
    let (group, candidates) = state.gateway.group_health(&slug).await?;

    let providers: Vec<ProviderHealthStatus> = candidates
        .into_iter()
        .map(|c| ProviderHealthStatus {
            provider_id: c.provider.id(),
            name: c.provider.name().to_string(),
            priority: c.provider.priority,
            weight: c.weight,
            health: c.health,
        })
        .collect();
    let healthy_providers = providers.iter().filter(|p| p.health.healthy).count();

    Ok(Json(GroupHealthResponse {
        group: group.slug,
        strategy: group.strategy,
        enabled: group.enabled,
        unhealthy_providers: providers.len() - healthy_providers,
        healthy_providers,
        providers,
    }))
}

/// Clear the current rate-limit window of one API key.
pub async fn reset_rate_limit(
    State(state): State<Arc<AppState>>,
    Path(api_key_id): Path<ApiKeyId>,
) -> Result<(StatusCode, Json<RateLimitResetResponse>)> {
    state
        .gateway
        .rate_limiter()
        .reset(api_key_id)
        .await
        .map_err(|e| AppError::DependencyUnavailable(e.to_string()))?;

    Ok((
        StatusCode::OK,
        Json(RateLimitResetResponse {
            api_key_id,
            reset: true,
        }),
    ))
}
