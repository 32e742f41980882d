//! Domain types for the routing engine.
//!
//! Providers, groups and API keys are owned by the configuration store; the
//! gateway only ever works on read-only snapshots of them. [`HealthRecord`] is
//! the one piece of mutable state, and it lives in the shared cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type ProviderId = i64;
pub type GroupId = i64;
pub type ApiKeyId = i64;

/// Consecutive failures at which a provider stops being healthy.
pub const FAILURE_THRESHOLD: u32 = 5;

/// Smoothing factor for the success-rate and latency moving averages.
pub const EMA_ALPHA: f64 = 0.1;

/// Upstream request timeout used when the store has no usable value.
pub const DEFAULT_PROVIDER_TIMEOUT_MS: u64 = 30_000;

/// Highest base priority an operator can assign.
pub const MAX_PRIORITY: u32 = 1000;

/// An upstream endpoint exposing the proxied interface.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Provider {
    pub id: ProviderId,
    pub name: String,
    pub base_url: String,
    /// Decrypted upstream secret, injected as a bearer token when present.
    pub credential: Option<String>,
    pub enabled: bool,
    pub priority: u32,
    pub timeout_ms: u64,
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("credential", &self.credential.as_ref().map(|_| "[REDACTED]"))
            .field("enabled", &self.enabled)
            .field("priority", &self.priority)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

/// Provider selection algorithm configured on a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    #[default]
    #[serde(alias = "weighted-round-robin")]
    WeightedRandom,
    PriorityFailover,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WeightedRandom => "weighted-random",
            Self::PriorityFailover => "priority-failover",
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStrategy(pub String);

impl fmt::Display for UnknownStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown selection strategy: {}", self.0)
    }
}

impl std::error::Error for UnknownStrategy {}

impl FromStr for SelectionStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "weighted-random" | "weighted-round-robin" => Ok(Self::WeightedRandom),
            "priority-failover" => Ok(Self::PriorityFailover),
            other => Err(UnknownStrategy(other.to_string())),
        }
    }
}

/// A named, routable collection of providers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Group {
    pub id: GroupId,
    pub slug: String,
    pub name: String,
    pub enabled: bool,
    pub strategy: SelectionStrategy,
}

/// A provider as seen through one group's membership.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupProvider {
    pub provider: Provider,
    /// Group-scoped priority override; this is what selection uses.
    pub priority: u32,
    /// Membership flag, independent of `provider.enabled`.
    pub enabled: bool,
}

impl GroupProvider {
    pub fn id(&self) -> ProviderId {
        self.provider.id
    }

    pub fn name(&self) -> &str {
        &self.provider.name
    }

    pub fn is_effectively_enabled(&self) -> bool {
        self.provider.enabled && self.enabled
    }
}

/// An issued gateway key, without its digest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiKeyRecord {
    pub id: ApiKeyId,
    pub name: String,
    /// `None` marks a global key that may route to any group.
    pub group_id: Option<GroupId>,
    pub enabled: bool,
    /// Requests per minute.
    pub rate_limit: u32,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires < now)
    }

    pub fn can_access(&self, group_id: GroupId) -> bool {
        self.group_id.map_or(true, |bound| bound == group_id)
    }
}

/// An API key row as held by the key source of truth.
#[derive(Debug, Clone)]
pub struct StoredApiKey {
    pub record: ApiKeyRecord,
    /// Salted digest of the issued secret.
    pub key_hash: String,
}

/// Rolling health statistics for one provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthRecord {
    pub consecutive_failures: u32,
    pub healthy: bool,
    pub last_checked_at: DateTime<Utc>,
    /// Success percentage, 0 to 100.
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
}

impl HealthRecord {
    /// Defaults for a provider with no recorded traffic.
    pub fn optimistic(now: DateTime<Utc>) -> Self {
        Self {
            consecutive_failures: 0,
            healthy: true,
            last_checked_at: now,
            success_rate: 100.0,
            avg_response_time_ms: 0.0,
        }
    }

    /// Re-derive `healthy` from the failure counter.
    pub fn normalized(mut self) -> Self {
        self.healthy = self.consecutive_failures < FAILURE_THRESHOLD;
        self
    }

    /// Fold one upstream attempt into the record.
    pub fn apply(&self, success: bool, latency_ms: f64, now: DateTime<Utc>) -> Self {
        let consecutive_failures = if success {
            0
        } else {
            self.consecutive_failures.saturating_add(1)
        };
        let sample = if success { 100.0 } else { 0.0 };

        Self {
            consecutive_failures,
            healthy: consecutive_failures < FAILURE_THRESHOLD,
            last_checked_at: now,
            success_rate: ema(self.success_rate, sample),
            avg_response_time_ms: ema(self.avg_response_time_ms, latency_ms),
        }
    }
}

pub fn ema(old: f64, sample: f64) -> f64 {
    old * (1.0 - EMA_ALPHA) + sample * EMA_ALPHA
}

/// The provider chosen for one request and the weight it was chosen with.
#[derive(Debug, Clone)]
pub struct SelectionResult {
    pub provider: GroupProvider,
    pub weight: f64,
}
