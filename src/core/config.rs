//! Configuration management for the gateway.
//!
//! Values come from built-in defaults, an optional config file named by
//! `GATEWAY_CONFIG` (TOML, YAML or JSON, picked by extension) and environment
//! variables, in increasing order of precedence. A `.env` file is loaded into
//! the environment by the binary before this runs.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Route prefix in front of `/:group/*path`
    #[serde(default = "default_proxy_prefix")]
    pub proxy_prefix: String,

    /// Shared cache. When unset the process keeps its state in memory.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Postgres URL of the configuration store
    #[serde(default)]
    pub db_url: Option<String>,

    /// Master secret for provider credential decryption
    #[serde(default)]
    pub encryption_key: Option<String>,

    /// Enables the `/admin/v1` routes when set
    #[serde(default)]
    pub admin_key: Option<String>,

    /// Whether to verify SSL certificates for upstream requests
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    #[serde(default = "default_log_queue_capacity")]
    pub log_queue_capacity: usize,

    #[serde(default = "default_cache_command_timeout_ms")]
    pub cache_command_timeout_ms: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    18000
}

fn default_proxy_prefix() -> String {
    "/api/proxy".to_string()
}

fn default_verify_ssl() -> bool {
    true
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_log_queue_capacity() -> usize {
    1024
}

fn default_cache_command_timeout_ms() -> u64 {
    5000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            proxy_prefix: default_proxy_prefix(),
            redis_url: None,
            db_url: None,
            encryption_key: None,
            admin_key: None,
            verify_ssl: default_verify_ssl(),
            max_body_bytes: default_max_body_bytes(),
            log_queue_capacity: default_log_queue_capacity(),
            cache_command_timeout_ms: default_cache_command_timeout_ms(),
        }
    }
}

/// `"api/proxy/"` becomes `"/api/proxy"`; an empty prefix stays empty.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl AppConfig {
    /// Load from the file named by `GATEWAY_CONFIG` (if any) and the environment.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var("GATEWAY_CONFIG").ok();
        Self::load(path.as_deref())
    }

    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let settings = builder
            .add_source(config::Environment::default().try_parsing(true))
            .build()
            .context("Failed to read configuration")?;

        let mut cfg: AppConfig = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;

        cfg.proxy_prefix = normalize_prefix(&cfg.proxy_prefix);
        cfg.redis_url = non_empty(cfg.redis_url);
        cfg.db_url = non_empty(cfg.db_url);
        cfg.encryption_key = non_empty(cfg.encryption_key);
        cfg.admin_key = non_empty(cfg.admin_key);

        if cfg.log_queue_capacity == 0 {
            bail!("LOG_QUEUE_CAPACITY must be greater than 0");
        }

        Ok(cfg)
    }

    pub fn require_db_url(&self) -> Result<&str> {
        self.db_url
            .as_deref()
            .context("DB_URL environment variable is required")
    }

    pub fn require_encryption_key(&self) -> Result<&str> {
        self.encryption_key
            .as_deref()
            .context("ENCRYPTION_KEY environment variable is required")
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn cache_command_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_command_timeout_ms)
    }
}
