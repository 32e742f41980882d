//! Cache key layout and lifetimes.

use crate::core::models::{ApiKeyId, GroupId, ProviderId};
use std::time::Duration;

/// Health records expire after this much inactivity.
pub const HEALTH_TTL: Duration = Duration::from_secs(300);

/// Group and group-provider snapshots.
pub const GROUP_TTL: Duration = Duration::from_secs(300);

/// Verified API key records.
pub const API_KEY_TTL: Duration = Duration::from_secs(600);

/// Fixed rate-limit window length.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

pub fn health(provider_id: ProviderId) -> String {
    format!("health:{}", provider_id)
}

pub fn group_by_slug(slug: &str) -> String {
    format!("group:slug:{}", slug)
}

pub fn group_endpoints(group_id: GroupId) -> String {
    format!("group:{}:endpoints", group_id)
}

pub fn rate_limit(api_key_id: ApiKeyId, bucket: i64) -> String {
    format!("ratelimit:{}:{}", api_key_id, bucket)
}

/// `key_hash` must be a digest of the presented key, never the key itself.
pub fn api_key(key_hash: &str) -> String {
    format!("apikey:{}", key_hash)
}
