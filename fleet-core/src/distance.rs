//! Distance and duration estimation. Routing uses a provider-backed
//! estimator when one is configured and falls back to haversine with a road
//! correction factor and tier average speeds.

pub mod clients;

use crate::config::TierSpeeds;
use crate::http::HttpFactory;
use crate::models::{Coordinate, ServiceTier};
use anyhow::{anyhow, Result};
use std::sync::Arc;

/// A single leg estimate between two points.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Leg {
    pub distance_km: f64,
    pub duration_min: f64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait DistanceEstimating: Send + Sync {
    /// Estimated road distance and travel time from `from` to `to` for a
    /// vehicle serving `tier`.
    async fn leg(&self, from: Coordinate, to: Coordinate, tier: ServiceTier) -> Result<Leg>;
}

/// Haversine with a flat road factor and tier average speeds. Never fails,
/// which makes it the terminal fallback of every estimator stack.
pub struct HaversineEstimator {
    road_factor: f64,
    speeds: TierSpeeds,
}

impl HaversineEstimator {
    pub fn new(road_factor: f64, speeds: TierSpeeds) -> Self {
        Self {
            road_factor,
            speeds,
        }
    }
}

#[async_trait::async_trait]
impl DistanceEstimating for HaversineEstimator {
    async fn leg(&self, from: Coordinate, to: Coordinate, tier: ServiceTier) -> Result<Leg> {
        let distance_km = from.haversine_km(&to) * self.road_factor;
        let duration_min = distance_km / self.speeds.for_tier(tier) * 60.0;
        Ok(Leg {
            distance_km,
            duration_min,
        })
    }
}

/// Takes the first successful inner estimator.
pub struct PriorityDistanceEstimator(Vec<Box<dyn DistanceEstimating>>);

impl PriorityDistanceEstimator {
    pub fn new(inner: Vec<Box<dyn DistanceEstimating>>) -> Self {
        Self(inner)
    }
}

#[async_trait::async_trait]
impl DistanceEstimating for PriorityDistanceEstimator {
    async fn leg(&self, from: Coordinate, to: Coordinate, tier: ServiceTier) -> Result<Leg> {
        for estimator in &self.0 {
            match estimator.leg(from, to, tier).await {
                Ok(leg) => return Ok(leg),
                Err(err) => log::warn!("distance estimator failed, falling back: {:?}", err),
            }
        }
        Err(anyhow!("all distance estimators failed"))
    }
}

/// Creates the estimator stack: the routing provider first when configured,
/// haversine as the infallible fallback.
pub fn create_estimator(
    http_factory: &HttpFactory,
    provider_url: Option<&str>,
    road_factor: f64,
    speeds: TierSpeeds,
) -> Result<Arc<dyn DistanceEstimating>> {
    let haversine = HaversineEstimator::new(road_factor, speeds);
    Ok(match provider_url {
        Some(url) => Arc::new(PriorityDistanceEstimator::new(vec![
            Box::new(clients::osrm::OsrmApi::new(http_factory, url)?),
            Box::new(haversine),
        ])),
        None => Arc::new(haversine),
    })
}
