//! HTTP layer: key authentication, upstream forwarding and the axum routes.

pub mod admin;
pub mod auth;
pub mod handlers;
pub mod proxy;
pub mod router;
pub mod upstream;

// Re-export commonly used types
pub use admin::admin_router;
pub use auth::{extract_api_key, hash_key, KeyAuthenticator};
pub use handlers::{health_handler, metrics_handler, AppState};
pub use proxy::proxy_handler;
pub use router::build_router;
pub use upstream::{ForwardError, ForwardedResponse, InboundRequest, RequestForwarder};
