//! Key authentication for proxied requests.
//!
//! Accepts both OpenAI-style (`Authorization: Bearer`) and key-style
//! (`X-API-Key`) credentials. Issued keys are stored as salted digests, so a
//! cache miss means verifying the presented key against every stored digest.

use axum::http::HeaderMap;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::core::cache::{self, CacheStore};
use crate::core::cache_keys;
use crate::core::crypto::CredentialVault;
use crate::core::error::{AppError, AuthFailure, Result};
use crate::core::models::{ApiKeyRecord, StoredApiKey};
use crate::core::store::ConfigStore;

/// Hash an API key using SHA-256. Used only to derive cache keys.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Presented credential: bearer token first, then `X-API-Key`.
pub fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    extract_bearer(headers).or_else(|| {
        headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    })
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn check_usable(record: &ApiKeyRecord) -> std::result::Result<(), AuthFailure> {
    if !record.enabled {
        return Err(AuthFailure::Disabled);
    }
    if record.is_expired_at(Utc::now()) {
        return Err(AuthFailure::Expired);
    }
    Ok(())
}

/// Resolves presented credentials to API key records.
#[derive(Clone)]
pub struct KeyAuthenticator {
    store: Arc<dyn ConfigStore>,
    cache: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl KeyAuthenticator {
    pub fn new(store: Arc<dyn ConfigStore>, cache: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            cache,
            ttl: cache_keys::API_KEY_TTL,
        }
    }

    /// Authenticate the credential carried by `headers`.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<ApiKeyRecord> {
        let presented = extract_api_key(headers)
            .ok_or(AppError::Unauthenticated(AuthFailure::MissingCredential))?;
        self.authenticate_key(presented).await
    }

    pub async fn authenticate_key(&self, presented: &str) -> Result<ApiKeyRecord> {
        let cache_key = cache_keys::api_key(&hash_key(presented));

        match cache::get_json::<ApiKeyRecord>(self.cache.as_ref(), &cache_key).await {
            Ok(Some(record)) => {
                // Cached records may have expired since they were stored.
                check_usable(&record).map_err(|reason| {
                    tracing::warn!(api_key_id = record.id, reason = %reason, "Rejected cached API key");
                    AppError::Unauthenticated(reason)
                })?;
                return Ok(record);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "API key cache read failed, verifying against store");
            }
        }

        let keys = self.store.list_all_api_keys().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to load API keys");
            AppError::from(e)
        })?;

        let record = find_matching(presented.to_string(), keys)
            .await?
            .ok_or_else(|| {
                tracing::warn!(key = %crate::core::crypto::mask_api_key(presented), "Unknown API key");
                AppError::Unauthenticated(AuthFailure::InvalidKey)
            })?;

        check_usable(&record).map_err(|reason| {
            tracing::warn!(api_key_id = record.id, reason = %reason, "Rejected API key");
            AppError::Unauthenticated(reason)
        })?;

        if let Err(e) = cache::set_json(self.cache.as_ref(), &cache_key, &record, self.ttl).await {
            tracing::warn!(api_key_id = record.id, error = %e, "Failed to cache API key");
        }

        tracing::debug!(api_key_id = record.id, name = %record.name, "API key authenticated");
        Ok(record)
    }
}

/// bcrypt verification is CPU-bound, so it runs on the blocking pool.
async fn find_matching(presented: String, keys: Vec<StoredApiKey>) -> Result<Option<ApiKeyRecord>> {
    tokio::task::spawn_blocking(move || {
        keys.into_iter()
            .find(|k| CredentialVault::verify_secret(&presented, &k.key_hash))
            .map(|k| k.record)
    })
    .await
    .map_err(|e| AppError::Internal(format!("key verification task failed: {}", e)))
}
