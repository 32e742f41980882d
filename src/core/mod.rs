//! Core building blocks shared by the services and the HTTP layer.
//!
//! - Configuration, errors, metrics and logging
//! - The shared cache and its key layout
//! - The configuration store and credential vault
//! - Rate limiting and the log sink

pub mod cache;
pub mod cache_keys;
pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod rate_limiter;
pub mod redis_cache;
pub mod request_logger;
pub mod store;

// Re-export commonly used types
pub use cache::{CacheError, CacheStore, MemoryCache};
pub use config::AppConfig;
pub use crypto::{CredentialVault, CryptoError};
pub use database::{Database, DatabaseConfig};
pub use error::{AppError, AuthFailure, Result};
pub use logging::init_tracing;
pub use metrics::{get_metrics, init_metrics, Metrics};
pub use middleware::{request_id_middleware, RequestId};
pub use rate_limiter::{RateLimitDecision, RateLimiter};
pub use redis_cache::RedisCache;
pub use request_logger::{LogBackend, LogEvent, LogSink, TracingLogBackend};
pub use store::{ConfigStore, StaticConfigStore, StoreError};
