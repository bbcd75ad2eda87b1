//! Candidate scoring for order to driver matching. All scores live in
//! [0, 1]; the weighted total is compared against `min_score`.

use crate::config::ScoreWeights;
use crate::models::{Coordinate, Driver};

/// The four sub-scores and their weighted total for one candidate.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ScoreBreakdown {
    pub proximity: f64,
    pub performance: f64,
    pub capacity: f64,
    pub zone: f64,
    pub total: f64,
}

/// Scores one candidate driver against an order anchor location.
pub fn score_candidate(
    driver: &Driver,
    anchor: Coordinate,
    distance_km: f64,
    radius_km: f64,
    zone_radius_km: f64,
    weights: &ScoreWeights,
) -> ScoreBreakdown {
    let proximity = 1.0 - (distance_km / radius_km).max(0.0).min(1.0);
    let performance = driver.on_time_rate.max(0.0).min(1.0);
    let capacity = if driver.capacity_kg > 0.0 {
        (1.0 - driver.assigned_load_kg / driver.capacity_kg).max(0.0).min(1.0)
    } else {
        0.0
    };
    let zone = if driver
        .recent_dropoffs
        .iter()
        .any(|dropoff| dropoff.haversine_km(&anchor) <= zone_radius_km)
    {
        1.0
    } else {
        0.0
    };
    let total = weights.proximity * proximity
        + weights.performance * performance
        + weights.capacity * capacity
        + weights.zone * zone;
    ScoreBreakdown {
        proximity,
        performance,
        capacity,
        zone,
        total,
    }
}

/// Weights for reassignment candidate selection: performance and zone are
/// boosted relative to proximity, then renormalized to sum to 1.
pub fn boosted_weights(weights: &ScoreWeights) -> ScoreWeights {
    let boosted = ScoreWeights {
        proximity: weights.proximity,
        performance: weights.performance * 1.5,
        capacity: weights.capacity,
        zone: weights.zone * 1.5,
    };
    let sum = boosted.sum();
    ScoreWeights {
        proximity: boosted.proximity / sum,
        performance: boosted.performance / sum,
        capacity: boosted.capacity / sum,
        zone: boosted.zone / sum,
    }
}

/// Orders candidates best first: total score descending, then fewer
/// completed deliveries today (workload smoothing), then lower driver id so
/// results are deterministic.
pub fn rank_candidates(candidates: &mut Vec<(Driver, ScoreBreakdown)>) {
    candidates.sort_by(|(a, sa), (b, sb)| {
        sb.total
            .partial_cmp(&sa.total)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.completed_today.cmp(&b.completed_today))
            .then_with(|| a.id.cmp(&b.id))
    });
}
