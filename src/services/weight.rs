//! Selection weight from configured priority and observed health.

use crate::core::models::HealthRecord;

const HEALTHY_BONUS: f64 = 20.0;
const DEGRADED_BONUS: f64 = 10.0;
/// Unhealthy providers below this many failures still get [`DEGRADED_BONUS`].
const DEGRADED_FAILURE_LIMIT: u32 = 3;
const SUCCESS_RATE_POINTS: f64 = 20.0;
const LATENCY_SCALE_MS: f64 = 5000.0;
const LATENCY_PENALTY_CAP: f64 = 20.0;

/// `priority + health bonus + success-rate bonus - latency penalty`, floored at 0.
///
/// The latency penalty is capped so a slow but reliable provider never loses
/// more than 20 points.
pub fn calculate_weight(base_priority: u32, health: &HealthRecord) -> f64 {
    let health_bonus = if health.healthy {
        HEALTHY_BONUS
    } else if health.consecutive_failures < DEGRADED_FAILURE_LIMIT {
        DEGRADED_BONUS
    } else {
        0.0
    };

    let success_bonus = (health.success_rate / 100.0) * SUCCESS_RATE_POINTS;
    let latency_penalty =
        ((health.avg_response_time_ms / LATENCY_SCALE_MS) * LATENCY_PENALTY_CAP).min(LATENCY_PENALTY_CAP);

    let weight = f64::from(base_priority) + health_bonus + success_bonus - latency_penalty;
    weight.max(0.0)
}
