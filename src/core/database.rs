//! PostgreSQL-backed configuration store.
//!
//! Schema and migrations are owned by the admin tooling. Only the four
//! tables the gateway reads are queried here: `groups`, `providers`,
//! `group_providers` and `api_keys`.

use crate::core::crypto::CredentialVault;
use crate::core::models::{
    ApiKeyRecord, Group, GroupId, GroupProvider, Provider, SelectionStrategy, StoredApiKey,
    DEFAULT_PROVIDER_TIMEOUT_MS, MAX_PRIORITY,
};
use crate::core::store::{ConfigStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use std::time::Duration;

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/api_gateway".to_string(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout_secs: 10,
            idle_timeout_secs: 600,
        }
    }
}

impl DatabaseConfig {
    pub fn from_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, FromRow)]
struct GroupRow {
    id: i64,
    slug: String,
    name: String,
    is_enabled: bool,
    polling_strategy: String,
}

impl GroupRow {
    fn into_group(self) -> Group {
        let strategy = self.polling_strategy.parse().unwrap_or_else(|e| {
            tracing::warn!(
                group = %self.slug,
                error = %e,
                "Unknown polling strategy, using weighted-random"
            );
            SelectionStrategy::WeightedRandom
        });

        Group {
            id: self.id,
            slug: self.slug,
            name: self.name,
            enabled: self.is_enabled,
            strategy,
        }
    }
}

#[derive(Debug, FromRow)]
struct MemberRow {
    provider_id: i64,
    name: String,
    base_url: String,
    api_key: Option<String>,
    provider_enabled: bool,
    provider_priority: i32,
    timeout_ms: i32,
    member_priority: i32,
    member_enabled: bool,
}

fn clamp_priority(raw: i32) -> u32 {
    raw.clamp(0, MAX_PRIORITY as i32) as u32
}

impl MemberRow {
    /// `None` when the stored credential cannot be decrypted.
    fn into_group_provider(self, vault: &CredentialVault) -> Option<GroupProvider> {
        let credential = match self.api_key.as_deref().filter(|c| !c.is_empty()) {
            Some(encrypted) => match vault.decrypt(encrypted) {
                Ok(plain) => Some(plain),
                Err(e) => {
                    tracing::error!(
                        provider_id = self.provider_id,
                        provider = %self.name,
                        error = %e,
                        "Failed to decrypt provider credential, skipping provider"
                    );
                    return None;
                }
            },
            None => None,
        };

        let timeout_ms = if self.timeout_ms > 0 {
            self.timeout_ms as u64
        } else {
            DEFAULT_PROVIDER_TIMEOUT_MS
        };

        Some(GroupProvider {
            provider: Provider {
                id: self.provider_id,
                name: self.name,
                base_url: self.base_url,
                credential,
                enabled: self.provider_enabled,
                priority: clamp_priority(self.provider_priority),
                timeout_ms,
            },
            priority: clamp_priority(self.member_priority),
            enabled: self.member_enabled,
        })
    }
}

/// PBKDF2 makes each decrypt CPU-bound, so the whole batch runs on the
/// blocking pool.
async fn decrypt_members(
    rows: Vec<MemberRow>,
    vault: CredentialVault,
) -> Result<Vec<GroupProvider>, StoreError> {
    if rows.iter().all(|row| row.api_key.as_deref().map_or(true, str::is_empty)) {
        return Ok(rows
            .into_iter()
            .filter_map(|row| row.into_group_provider(&vault))
            .collect());
    }

    tokio::task::spawn_blocking(move || {
        rows.into_iter()
            .filter_map(|row| row.into_group_provider(&vault))
            .collect()
    })
    .await
    .map_err(|e| StoreError::Unavailable(format!("credential decryption task failed: {}", e)))
}

#[derive(Debug, FromRow)]
struct ApiKeyRow {
    id: i64,
    key: String,
    name: String,
    group_id: Option<i64>,
    is_enabled: bool,
    rate_limit: i32,
    expires_at: Option<DateTime<Utc>>,
}

impl From<ApiKeyRow> for StoredApiKey {
    fn from(row: ApiKeyRow) -> Self {
        StoredApiKey {
            record: ApiKeyRecord {
                id: row.id,
                name: row.name,
                group_id: row.group_id,
                enabled: row.is_enabled,
                rate_limit: row.rate_limit.max(0) as u32,
                expires_at: row.expires_at,
            },
            key_hash: row.key,
        }
    }
}

/// Database connection manager
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    vault: CredentialVault,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig, vault: CredentialVault) -> Result<Self, sqlx::Error> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .connect(&config.url)
            .await?;

        tracing::info!(max_connections = config.max_connections, "Connected to configuration database");

        Ok(Self { pool, vault })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ConfigStore for Database {
    async fn get_group_by_slug(&self, slug: &str) -> Result<Option<Group>, StoreError> {
        let row = sqlx::query_as::<_, GroupRow>(
            "SELECT id::BIGINT AS id, slug, name, is_enabled, polling_strategy \
             FROM groups WHERE slug = $1 LIMIT 1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(GroupRow::into_group))
    }

    async fn get_enabled_providers_for_group(
        &self,
        group_id: GroupId,
    ) -> Result<Vec<GroupProvider>, StoreError> {
        let rows = sqlx::query_as::<_, MemberRow>(
            "SELECT p.id::BIGINT AS provider_id, p.name, p.base_url, p.api_key, \
                    p.is_enabled AS provider_enabled, p.priority::INT AS provider_priority, \
                    p.timeout::INT AS timeout_ms, gp.priority::INT AS member_priority, \
                    gp.is_enabled AS member_enabled \
             FROM group_providers gp \
             JOIN providers p ON p.id = gp.provider_id \
             WHERE gp.group_id = $1 AND gp.is_enabled AND p.is_enabled \
             ORDER BY gp.priority DESC, p.id",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        decrypt_members(rows, self.vault.clone()).await
    }

    async fn list_all_api_keys(&self) -> Result<Vec<StoredApiKey>, StoreError> {
        let rows = sqlx::query_as::<_, ApiKeyRow>(
            "SELECT id::BIGINT AS id, key, name, group_id::BIGINT AS group_id, is_enabled, \
                    rate_limit::INT AS rate_limit, expires_at::TIMESTAMPTZ AS expires_at \
             FROM api_keys",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(StoredApiKey::from).collect())
    }
}
