//! Provider selection for a group.
//!
//! Both strategies prefer providers below the failure threshold and fall back
//! to the unhealthy ones rather than failing, so selection over a non-empty
//! list always produces a provider.

use crate::core::metrics::get_metrics;
use crate::core::models::{
    Group, GroupProvider, HealthRecord, SelectionResult, SelectionStrategy, FAILURE_THRESHOLD,
};
use crate::services::health_store::HealthStore;
use crate::services::weight::calculate_weight;
use futures::future::join_all;
use rand::Rng;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("No providers available for group: {0}")]
    NoProviderAvailable(String),
}

/// A provider together with the health snapshot it is judged on.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider: GroupProvider,
    pub health: HealthRecord,
    pub weight: f64,
}

impl Candidate {
    pub fn new(provider: GroupProvider, health: HealthRecord) -> Self {
        let weight = calculate_weight(provider.priority, &health);
        Self {
            provider,
            health,
            weight,
        }
    }

    fn below_threshold(&self) -> bool {
        self.health.consecutive_failures < FAILURE_THRESHOLD
    }
}

/// Index into `weights`, drawn with probability proportional to weight.
///
/// Zero-weight entries are never drawn unless every weight is zero, in which
/// case the pick is uniform. `weights` must not be empty.
pub fn pick_weighted<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> usize {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return rng.gen_range(0..weights.len());
    }

    let mut remaining = rng.gen::<f64>() * total;
    let mut last = 0;
    for (index, weight) in weights.iter().enumerate() {
        if *weight <= 0.0 {
            continue;
        }
        last = index;
        remaining -= weight;
        if remaining <= 0.0 {
            return index;
        }
    }
    // Floating-point drift.
    last
}

fn weighted_random<R: Rng + ?Sized>(
    group_slug: &str,
    candidates: &[Candidate],
    rng: &mut R,
) -> Result<SelectionResult, SelectionError> {
    if candidates.is_empty() {
        return Err(SelectionError::NoProviderAvailable(group_slug.to_string()));
    }

    let healthy: Vec<&Candidate> = candidates.iter().filter(|c| c.below_threshold()).collect();
    let pool = if healthy.is_empty() {
        tracing::warn!(group = %group_slug, "No healthy providers available, using all providers");
        candidates.iter().collect()
    } else {
        healthy
    };

    let weights: Vec<f64> = pool.iter().map(|c| c.weight).collect();
    let total: f64 = weights.iter().sum();
    let chosen = pool[pick_weighted(&weights, rng)];

    Ok(SelectionResult {
        provider: chosen.provider.clone(),
        weight: if total > 0.0 { chosen.weight } else { 0.0 },
    })
}

fn priority_failover(
    group_slug: &str,
    candidates: &[Candidate],
) -> Result<SelectionResult, SelectionError> {
    let mut ordered: Vec<&Candidate> = candidates.iter().collect();
    // Stable, so ties keep their configured order.
    ordered.sort_by(|a, b| b.provider.priority.cmp(&a.provider.priority));

    let chosen = match ordered.iter().find(|c| c.below_threshold()) {
        Some(candidate) => *candidate,
        None => {
            let top = ordered
                .first()
                .ok_or_else(|| SelectionError::NoProviderAvailable(group_slug.to_string()))?;
            tracing::warn!(
                group = %group_slug,
                provider = %top.provider.name(),
                "All providers unhealthy, using highest priority provider"
            );
            *top
        }
    };

    Ok(SelectionResult {
        provider: chosen.provider.clone(),
        weight: f64::from(chosen.provider.priority),
    })
}

impl SelectionStrategy {
    pub fn select<R: Rng + ?Sized>(
        &self,
        group_slug: &str,
        candidates: &[Candidate],
        rng: &mut R,
    ) -> Result<SelectionResult, SelectionError> {
        match self {
            SelectionStrategy::WeightedRandom => weighted_random(group_slug, candidates, rng),
            SelectionStrategy::PriorityFailover => priority_failover(group_slug, candidates),
        }
    }
}

/// Chooses a provider for a group from its resolved member list.
#[derive(Clone)]
pub struct ProviderSelector {
    health: HealthStore,
}

impl ProviderSelector {
    pub fn new(health: HealthStore) -> Self {
        Self { health }
    }

    /// Health snapshot and weight for each provider, read concurrently.
    pub async fn candidates(&self, providers: &[GroupProvider]) -> Vec<Candidate> {
        let records = join_all(providers.iter().map(|p| self.health.get(p.id()))).await;
        providers
            .iter()
            .cloned()
            .zip(records)
            .map(|(provider, health)| Candidate::new(provider, health))
            .collect()
    }

    pub async fn select(
        &self,
        group: &Group,
        providers: &[GroupProvider],
    ) -> Result<SelectionResult, SelectionError> {
        let enabled: Vec<GroupProvider> = providers
            .iter()
            .filter(|p| p.is_effectively_enabled())
            .cloned()
            .collect();

        if enabled.is_empty() {
            tracing::error!(group = %group.slug, "No enabled providers in group");
            return Err(SelectionError::NoProviderAvailable(group.slug.clone()));
        }

        let candidates = self.candidates(&enabled).await;
        let result = group
            .strategy
            .select(&group.slug, &candidates, &mut rand::thread_rng())?;

        get_metrics()
            .provider_selections
            .with_label_values(&[&group.slug, result.provider.name(), group.strategy.as_str()])
            .inc();

        tracing::debug!(
            group = %group.slug,
            strategy = %group.strategy,
            provider = %result.provider.name(),
            provider_id = result.provider.id(),
            weight = result.weight,
            "Provider selected"
        );

        Ok(result)
    }
}
