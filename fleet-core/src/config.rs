//! Engine configuration. All knobs are enumerated here with their defaults;
//! loading validates up front and construction from CLI flags happens in the
//! binary.

use crate::models::ServiceTier;
use anyhow::{ensure, Result};
use std::time::Duration;

/// Relative weights of the dispatch score components. Must sum to 1.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoreWeights {
    pub proximity: f64,
    pub performance: f64,
    pub capacity: f64,
    pub zone: f64,
}

impl ScoreWeights {
    pub fn sum(&self) -> f64 {
        self.proximity + self.performance + self.capacity + self.zone
    }
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            proximity: 0.40,
            performance: 0.30,
            capacity: 0.20,
            zone: 0.10,
        }
    }
}

impl std::str::FromStr for ScoreWeights {
    type Err = anyhow::Error;

    /// Parses `"0.4,0.3,0.2,0.1"`.
    fn from_str(value: &str) -> Result<Self> {
        let parts = value
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()?;
        ensure!(parts.len() == 4, "expected four comma separated weights");
        Ok(Self {
            proximity: parts[0],
            performance: parts[1],
            capacity: parts[2],
            zone: parts[3],
        })
    }
}

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Dispatch loop cadence.
    pub tick: Duration,
    /// Initial candidate radius around the order pickup.
    pub radius_km: f64,
    /// Below this total score no normal assignment happens.
    pub min_score: f64,
    pub weights: ScoreWeights,
    /// Per-driver offer window.
    pub offer_timeout: Duration,
    /// Rejections tolerated before the ALL_BUSY alert.
    pub max_offers_per_order: u32,
    /// Remaining SLA below which dispatch may bypass `min_score`.
    pub force_threshold: Duration,
    /// Driver excluded from an order's candidates for this long after a
    /// rejection or an expired offer.
    pub offer_cooldown: Duration,
    /// When true offers commit immediately; otherwise they wait for an
    /// `offer_response` inbound event or the timeout.
    pub auto_accept_offers: bool,
    /// Dropoffs within this radius of an order pickup count as zone overlap.
    pub zone_radius_km: f64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(10),
            radius_km: 10.0,
            min_score: 0.40,
            weights: ScoreWeights::default(),
            offer_timeout: Duration::from_secs(30),
            max_offers_per_order: 5,
            force_threshold: Duration::from_secs(15 * 60),
            offer_cooldown: Duration::from_secs(60),
            auto_accept_offers: true,
            zone_radius_km: 3.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BatchingConfig {
    /// Batching loop cadence.
    pub tick: Duration,
    /// Maximum distance between pickups of batched orders.
    pub pickup_cluster_km: f64,
    /// Cap on the bounding box diagonal over all pickups and dropoffs.
    pub drop_span_km: f64,
    pub max_batch_size: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            pickup_cluster_km: 2.0,
            drop_span_km: 8.0,
            max_batch_size: 6,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RouteConfig {
    /// Per-driver periodic re-optimization cadence.
    pub periodic_tick: Duration,
    /// Minimum relative distance improvement to accept a new route.
    pub min_improvement: f64,
    /// Above this stop count the solver switches from nearest-neighbor to
    /// cheapest-insertion for the initial tour.
    pub nn_cap: usize,
    pub max_2opt_passes: usize,
    /// Haversine to road distance correction.
    pub road_factor: f64,
    /// Concurrent event-triggered optimizations.
    pub worker_pool_size: usize,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            periodic_tick: Duration::from_secs(5 * 60),
            min_improvement: 0.05,
            nn_cap: 10,
            max_2opt_passes: 20,
            road_factor: 1.3,
            worker_pool_size: 4,
        }
    }
}

#[derive(Clone, Debug)]
pub struct EscalationConfig {
    /// Escalation loop cadence.
    pub tick: Duration,
    /// Per (order, type) suppression window.
    pub debounce: Duration,
    /// No driver update for this long marks the order stuck.
    pub stuck_threshold: Duration,
    pub max_reassignments: u32,
    /// Remaining SLA below which an unassigned order is critical.
    pub critical_window: Duration,
    /// Remaining SLA below which an assigned order's ETA is checked.
    pub assigned_window: Duration,
    /// The ETA must beat the deadline by at least this margin.
    pub eta_margin: Duration,
    /// Base penalty per tier for the breach penalty function.
    pub barq_base_penalty: f64,
    pub bullet_base_penalty: f64,
    /// Active traffic incidents age out after this long without an explicit
    /// resolution.
    pub incident_ttl: Duration,
}

impl EscalationConfig {
    pub fn base_penalty(&self, tier: ServiceTier) -> f64 {
        match tier {
            ServiceTier::Barq => self.barq_base_penalty,
            ServiceTier::Bullet => self.bullet_base_penalty,
        }
    }
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            debounce: Duration::from_secs(5 * 60),
            stuck_threshold: Duration::from_secs(15 * 60),
            max_reassignments: 3,
            critical_window: Duration::from_secs(15 * 60),
            assigned_window: Duration::from_secs(10 * 60),
            eta_margin: Duration::from_secs(2 * 60),
            barq_base_penalty: 25.0,
            bullet_base_penalty: 15.0,
            incident_ttl: Duration::from_secs(2 * 60 * 60),
        }
    }
}

/// Quantitative caps feeding the `can_accept` predicate.
#[derive(Clone, Debug)]
pub struct DriverCaps {
    pub max_consecutive_deliveries: u32,
    pub max_working_hours: f64,
    pub target_deliveries: u32,
    pub max_concurrent_orders: usize,
    /// Minimum rolling on-time rate to keep receiving work.
    pub min_on_time_rate: f64,
}

impl Default for DriverCaps {
    fn default() -> Self {
        Self {
            max_consecutive_deliveries: 5,
            max_working_hours: 8.0,
            target_deliveries: 25,
            max_concurrent_orders: 3,
            min_on_time_rate: 0.9,
        }
    }
}

/// Average road speed per tier, used for duration estimates when no provider
/// is available.
#[derive(Clone, Copy, Debug)]
pub struct TierSpeeds {
    pub barq_kmh: f64,
    pub bullet_kmh: f64,
}

impl TierSpeeds {
    pub fn for_tier(&self, tier: ServiceTier) -> f64 {
        match tier {
            ServiceTier::Barq => self.barq_kmh,
            ServiceTier::Bullet => self.bullet_kmh,
        }
    }
}

impl Default for TierSpeeds {
    fn default() -> Self {
        Self {
            barq_kmh: 35.0,
            bullet_kmh: 28.0,
        }
    }
}

/// Service level windows per tier.
#[derive(Clone, Copy, Debug)]
pub struct TierSlas {
    pub barq: Duration,
    pub bullet: Duration,
}

impl TierSlas {
    pub fn for_tier(&self, tier: ServiceTier) -> Duration {
        match tier {
            ServiceTier::Barq => self.barq,
            ServiceTier::Bullet => self.bullet,
        }
    }
}

impl Default for TierSlas {
    fn default() -> Self {
        Self {
            barq: Duration::from_secs(60 * 60),
            bullet: Duration::from_secs(4 * 60 * 60),
        }
    }
}

/// Everything the engine needs, validated up front.
#[derive(Clone, Debug)]
pub struct FleetConfig {
    pub dispatch: DispatchConfig,
    pub batching: BatchingConfig,
    pub route: RouteConfig,
    pub escalation: EscalationConfig,
    pub caps: DriverCaps,
    pub speeds: TierSpeeds,
    pub slas: TierSlas,
    /// Consecutive store failures before the engine degrades to read-only.
    pub unavailable_threshold: u32,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            batching: BatchingConfig::default(),
            route: RouteConfig::default(),
            escalation: EscalationConfig::default(),
            caps: DriverCaps::default(),
            speeds: TierSpeeds::default(),
            slas: TierSlas::default(),
            unavailable_threshold: 5,
        }
    }
}

impl FleetConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (self.dispatch.weights.sum() - 1.0).abs() <= 1e-6,
            "dispatch weights must sum to 1, got {}",
            self.dispatch.weights.sum(),
        );
        ensure!(
            self.dispatch.min_score >= 0.0 && self.dispatch.min_score <= 1.0,
            "min_score must be within [0, 1]",
        );
        ensure!(self.dispatch.radius_km > 0.0, "radius_km must be positive");
        ensure!(
            !self.dispatch.tick.as_secs_f64().eq(&0.0)
                && !self.batching.tick.as_secs_f64().eq(&0.0)
                && !self.escalation.tick.as_secs_f64().eq(&0.0),
            "loop cadences must be non-zero",
        );
        ensure!(
            self.batching.max_batch_size >= 2,
            "a batch needs at least two orders",
        );
        ensure!(
            self.route.min_improvement >= 0.0 && self.route.min_improvement < 1.0,
            "min_improvement must be within [0, 1)",
        );
        ensure!(
            self.route.worker_pool_size > 0,
            "route worker pool must not be empty",
        );
        ensure!(
            self.caps.min_on_time_rate >= 0.0 && self.caps.min_on_time_rate <= 1.0,
            "min_on_time_rate must be within [0, 1]",
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(FleetConfig::default().validate().is_ok());
    }

    #[test]
    fn unbalanced_weights_are_rejected() {
        let mut config = FleetConfig::default();
        config.dispatch.weights.proximity = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn weights_parse_from_comma_list() {
        let weights: ScoreWeights = "0.4, 0.3, 0.2, 0.1".parse().unwrap();
        assert_eq!(weights, ScoreWeights::default());
        assert!("0.4,0.3,0.2".parse::<ScoreWeights>().is_err());
        assert!("a,b,c,d".parse::<ScoreWeights>().is_err());
    }

    #[test]
    fn zero_tick_is_rejected() {
        let mut config = FleetConfig::default();
        config.dispatch.tick = Duration::from_secs(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn tier_lookups() {
        let config = FleetConfig::default();
        assert_eq!(config.slas.for_tier(ServiceTier::Barq).as_secs(), 3600);
        assert!(config.speeds.for_tier(ServiceTier::Barq) > config.speeds.for_tier(ServiceTier::Bullet));
        assert!(config.escalation.base_penalty(ServiceTier::Barq) > config.escalation.base_penalty(ServiceTier::Bullet));
    }
}
