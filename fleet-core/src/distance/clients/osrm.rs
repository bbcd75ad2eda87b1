//! Client for an OSRM compatible routing service (`/route/v1/driving`).

use crate::distance::{DistanceEstimating, Leg};
use crate::http::{HttpClient, HttpFactory, HttpLabel};
use crate::models::{Coordinate, ServiceTier};
use anyhow::{anyhow, Context as _, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct RouteResponse {
    code: String,
    #[serde(default)]
    routes: Vec<ProviderRoute>,
}

#[derive(Debug, Deserialize)]
struct ProviderRoute {
    /// Meters.
    distance: f64,
    /// Seconds.
    duration: f64,
}

pub struct OsrmApi {
    base_url: String,
    client: HttpClient,
}

impl OsrmApi {
    pub fn new(http_factory: &HttpFactory, base_url: &str) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client: http_factory
                .create()
                .context("failed to create OSRM client")?,
        })
    }

    fn route_url(&self, from: Coordinate, to: Coordinate) -> String {
        // OSRM takes lng,lat pairs.
        format!(
            "{}/route/v1/driving/{},{};{},{}?overview=false",
            self.base_url, from.lng, from.lat, to.lng, to.lat,
        )
    }
}

#[async_trait::async_trait]
impl DistanceEstimating for OsrmApi {
    async fn leg(&self, from: Coordinate, to: Coordinate, _tier: ServiceTier) -> Result<Leg> {
        let url = self.route_url(from, to);
        let response: RouteResponse = self
            .client
            .get_json_async(url.as_str(), HttpLabel::RoutingProvider)
            .await?;
        if response.code != "Ok" {
            return Err(anyhow!("routing provider returned code '{}'", response.code));
        }
        let route = response
            .routes
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("routing provider returned no routes"))?;
        Ok(Leg {
            distance_km: route.distance / 1000.0,
            duration_min: route.duration / 60.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_uses_lng_lat_order() {
        let api = OsrmApi::new(&HttpFactory::default(), "http://router.local/").unwrap();
        let url = api.route_url(
            Coordinate::new(24.7136, 46.6753),
            Coordinate::new(24.7200, 46.6800),
        );
        assert_eq!(
            url,
            "http://router.local/route/v1/driving/46.6753,24.7136;46.68,24.72?overview=false",
        );
    }

    #[test]
    fn response_parses_distance_and_duration() {
        let json = r#"{"code": "Ok", "routes": [{"distance": 1520.3, "duration": 312.0}]}"#;
        let response: RouteResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.code, "Ok");
        assert_eq!(response.routes.len(), 1);
        assert!((response.routes[0].distance - 1520.3).abs() < 1e-9);
    }
}
