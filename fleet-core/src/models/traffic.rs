use crate::models::Coordinate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a reported traffic incident.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize,
)]
#[serde(transparent)]
pub struct IncidentId(pub u64);

impl fmt::Display for IncidentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentSeverity {
    Low,
    Medium,
    High,
    Severe,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentStatus {
    Active,
    Resolved,
}

/// An externally reported road incident. Active HIGH/SEVERE incidents steer
/// the route optimizer away from legs crossing their radius.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TrafficIncident {
    pub id: IncidentId,
    pub location: Coordinate,
    pub radius_m: f64,
    pub severity: IncidentSeverity,
    pub kind: String,
    pub status: IncidentStatus,
    pub reported_at: DateTime<Utc>,
}

impl TrafficIncident {
    pub fn is_active(&self) -> bool {
        self.status == IncidentStatus::Active
    }

    /// Whether the optimizer must route around this incident.
    pub fn blocks_routing(&self) -> bool {
        self.is_active() && self.severity >= IncidentSeverity::High
    }

    /// Whether the straight leg `a`-`b` passes through the incident circle.
    pub fn crosses(&self, a: &Coordinate, b: &Coordinate) -> bool {
        self.location.distance_to_segment_km(a, b) * 1000.0 <= self.radius_m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incident(severity: IncidentSeverity, radius_m: f64) -> TrafficIncident {
        TrafficIncident {
            id: IncidentId(1),
            location: Coordinate::new(24.70, 46.65),
            radius_m,
            severity,
            kind: "accident".to_owned(),
            status: IncidentStatus::Active,
            reported_at: Utc::now(),
        }
    }

    #[test]
    fn only_high_and_severe_block_routing() {
        assert!(!incident(IncidentSeverity::Low, 500.0).blocks_routing());
        assert!(!incident(IncidentSeverity::Medium, 500.0).blocks_routing());
        assert!(incident(IncidentSeverity::High, 500.0).blocks_routing());
        assert!(incident(IncidentSeverity::Severe, 500.0).blocks_routing());
    }

    #[test]
    fn resolved_incidents_do_not_block() {
        let mut incident = incident(IncidentSeverity::Severe, 500.0);
        incident.status = IncidentStatus::Resolved;
        assert!(!incident.blocks_routing());
    }

    #[test]
    fn leg_through_centre_crosses() {
        let incident = incident(IncidentSeverity::High, 300.0);
        // Horizontal leg passing through the incident latitude.
        let a = Coordinate::new(24.70, 46.60);
        let b = Coordinate::new(24.70, 46.70);
        assert!(incident.crosses(&a, &b));
        // A leg far to the north misses it.
        let c = Coordinate::new(24.80, 46.60);
        let d = Coordinate::new(24.80, 46.70);
        assert!(!incident.crosses(&c, &d));
    }
}
