//! API Relay Gateway - one endpoint in front of many interchangeable upstream providers
//!
//! Callers address a *group* of providers by slug; the gateway authenticates the
//! caller's key, enforces its per-minute rate limit, picks a provider and relays
//! the request:
//!
//! - **Health Tracking**: consecutive failures plus EMA success rate and latency per provider
//! - **Provider Selection**: weighted-random or priority-failover, per group
//! - **Rate Limiting**: fixed 60-second windows per API key, fail-open on cache outage
//! - **Metrics & Monitoring**: Prometheus metrics for observability
//! - **Request Logging**: bounded, non-blocking log sink
//!
//! # Architecture
//!
//! The codebase is organized into three main layers:
//!
//! - [`core`]: Core functionality (config, cache, crypto, database, errors, metrics, logging)
//! - [`services`]: Routing logic (health store, weights, selection, gateway orchestrator)
//! - [`api`]: HTTP handlers, key authentication and upstream forwarding
//!
//! # Configuration
//!
//! Required environment variables:
//! - `DB_URL`: PostgreSQL database connection URL
//! - `ENCRYPTION_KEY`: master secret used to decrypt provider credentials
//!
//! Optional environment variables:
//! - `REDIS_URL`: shared cache (default: in-process cache, not shared across replicas)
//! - `HOST`: Server bind address (default: 0.0.0.0)
//! - `PORT`: Server port (default: 18000)
//! - `PROXY_PREFIX`: route prefix (default: /api/proxy)
//! - `ADMIN_KEY`: enables the `/admin/v1` API
//! - `VERIFY_SSL`: Verify SSL certificates for upstream (default: true)

pub mod api;
pub mod core;
pub mod services;

// Re-export commonly used types for convenience
pub use api::{build_router, AppState};
pub use core::{AppConfig, AppError, Database, DatabaseConfig, Result};
pub use services::Gateway;
