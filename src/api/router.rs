//! Route table and middleware stack.

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{any, get},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::api::admin::admin_router;
use crate::api::handlers::{health_handler, metrics_handler, AppState};
use crate::api::proxy::proxy_handler;
use crate::core::config::AppConfig;
use crate::core::middleware::{admin_auth_middleware, request_id_middleware};

/// Build router with all endpoints.
pub fn build_router(state: Arc<AppState>, config: &AppConfig) -> Router {
    let prefix = config.proxy_prefix.as_str();

    let proxy_routes = Router::new()
        .route(&format!("{}/:group", prefix), any(proxy_handler))
        .route(&format!("{}/:group/*path", prefix), any(proxy_handler))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .with_state(state.clone());

    let mut app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state.clone())
        .merge(proxy_routes);

    match config.admin_key.as_deref() {
        Some(admin_key) => {
            let admin_key: Arc<str> = Arc::from(admin_key);
            let admin_routes = admin_router(state)
                .layer(middleware::from_fn_with_state(admin_key, admin_auth_middleware));
            app = app.nest("/admin/v1", admin_routes);
        }
        None => tracing::info!("ADMIN_KEY not set, admin API disabled"),
    }

    app.layer(middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
