//! API Relay Gateway - Main entry point
//!
//! Wires the configuration store, shared cache, log sink and HTTP client into
//! the gateway and serves it until Ctrl-C.

use anyhow::{Context, Result};
use api_relay_gateway::{
    api::{build_router, AppState},
    core::{
        init_metrics, init_tracing, AppConfig, CacheStore, CredentialVault, Database,
        DatabaseConfig, LogSink, MemoryCache, RedisCache, TracingLogBackend,
    },
    services::Gateway,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// How long shutdown waits for queued log events.
const LOG_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    // Load .env file if present (before reading any environment variables)
    dotenvy::dotenv().ok();

    // Detect optimal worker threads from environment or cgroup
    let worker_threads = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or_else(|| detect_cpu_limit().unwrap_or(1));

    println!("Tokio runtime: using {} worker threads", worker_threads);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    init_tracing();
    init_metrics();

    let config = AppConfig::from_env()?;

    let vault = CredentialVault::new(config.require_encryption_key()?)
        .context("Invalid ENCRYPTION_KEY")?;

    let db_config = DatabaseConfig::from_url(config.require_db_url()?);
    tracing::info!("Connecting to database...");
    let db = Arc::new(
        Database::connect(&db_config, vault)
            .await
            .context("Failed to connect to database")?,
    );
    tracing::info!("Database connected successfully");

    let (shared_cache, redis): (Arc<dyn CacheStore>, Option<RedisCache>) = match &config.redis_url {
        Some(url) => {
            tracing::info!("Connecting to Redis...");
            let redis = RedisCache::connect(url, config.cache_command_timeout())
                .await
                .context("Failed to connect to Redis")?;
            tracing::info!("Redis connected successfully");
            let shared: Arc<dyn CacheStore> = Arc::new(redis.clone());
            (shared, Some(redis))
        }
        None => {
            tracing::warn!(
                "REDIS_URL not set, using in-process cache; health and rate limits are not shared across replicas"
            );
            let shared: Arc<dyn CacheStore> = Arc::new(MemoryCache::new());
            (shared, None)
        }
    };

    let log_sink = LogSink::start(Arc::new(TracingLogBackend), config.log_queue_capacity);
    let http_client = create_http_client(&config)?;

    let gateway = Gateway::new(
        db.clone(),
        shared_cache,
        Arc::new(MemoryCache::new()),
        http_client,
        log_sink.clone(),
    );
    let app = build_router(AppState::new(gateway), &config);

    let addr: SocketAddr = config
        .bind_addr()
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.bind_addr()))?;
    tracing::info!("Starting API Relay Gateway on {}", addr);
    tracing::info!("Proxy routes: {}/:group/*path", config.proxy_prefix);
    if config.admin_key.is_some() {
        tracing::info!("Admin API: /admin/v1/*");
    }
    tracing::info!("Metrics endpoint: /metrics");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Server stopped, flushing logs");
    log_sink.shutdown(LOG_DRAIN_DEADLINE).await;
    if let Some(redis) = redis {
        redis.close();
    }
    db.close().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Create HTTP client with connection pooling. Deadlines are applied per
/// provider, so the client itself has no global timeout.
fn create_http_client(config: &AppConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(!config.verify_ssl)
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .http2_keep_alive_interval(Duration::from_secs(30))
        .http2_keep_alive_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client")
}

/// Detect CPU limit from cgroup (for containerized environments)
fn detect_cpu_limit() -> Option<usize> {
    // Try cgroup v2 first
    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        let parts: Vec<&str> = max.split_whitespace().collect();
        if parts.len() == 2 {
            if let (Ok(quota), Ok(period)) = (parts[0].parse::<i64>(), parts[1].parse::<i64>()) {
                if quota > 0 {
                    let cores = ((quota as f64 / period as f64).ceil() as usize).max(1);
                    println!("Detected CPU limit from cgroup v2: {} cores", cores);
                    return Some(cores);
                }
            }
        }
    }

    // Fallback to cgroup v1
    let quota = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;

    let period = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us")
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;

    if quota > 0 {
        let cores = ((quota as f64 / period as f64).ceil() as usize).max(1);
        println!("Detected CPU limit from cgroup v1: {} cores", cores);
        Some(cores)
    } else {
        None
    }
}
