use crate::models::{BatchId, Coordinate, DriverId, OrderId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Identifier of a driver route.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize,
)]
#[serde(transparent)]
pub struct RouteId(pub u64);

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopKind {
    Pickup,
    Delivery,
}

/// One stop on a driver's route.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Stop {
    pub order_id: OrderId,
    pub kind: StopKind,
    pub location: Coordinate,
    pub eta: Option<DateTime<Utc>>,
    pub arrived_at: Option<DateTime<Utc>>,
}

impl Stop {
    pub fn new(order_id: OrderId, kind: StopKind, location: Coordinate) -> Self {
        Self {
            order_id,
            kind,
            location,
            eta: None,
            arrived_at: None,
        }
    }
}

/// The ordered stop list a driver executes next. Routes are copy-on-write:
/// re-optimization creates a new route and flips `is_active` atomically.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Route {
    pub id: RouteId,
    pub driver_id: DriverId,
    pub batch_id: Option<BatchId>,
    pub stops: Vec<Stop>,
    pub total_distance_km: f64,
    pub total_duration_min: f64,
    pub is_active: bool,
    pub optimized_at: DateTime<Utc>,
}

impl Route {
    /// Every DELIVERY stop must come after its order's PICKUP stop. Orders
    /// already picked up have no PICKUP stop left and are exempt.
    pub fn is_precedence_valid(&self) -> bool {
        let mut picked: HashSet<OrderId> = HashSet::new();
        let has_pickup: HashSet<OrderId> = self
            .stops
            .iter()
            .filter(|stop| stop.kind == StopKind::Pickup)
            .map(|stop| stop.order_id)
            .collect();
        for stop in &self.stops {
            match stop.kind {
                StopKind::Pickup => {
                    picked.insert(stop.order_id);
                }
                StopKind::Delivery => {
                    if has_pickup.contains(&stop.order_id) && !picked.contains(&stop.order_id) {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// The set of orders referenced by this route.
    pub fn order_ids(&self) -> HashSet<OrderId> {
        self.stops.iter().map(|stop| stop.order_id).collect()
    }

    /// ETA of the delivery stop for `order`, if the route contains one.
    pub fn delivery_eta(&self, order: OrderId) -> Option<DateTime<Utc>> {
        self.stops
            .iter()
            .find(|stop| stop.order_id == order && stop.kind == StopKind::Delivery)
            .and_then(|stop| stop.eta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route_with_stops(stops: Vec<Stop>) -> Route {
        Route {
            id: RouteId(1),
            driver_id: DriverId(1),
            batch_id: None,
            stops,
            total_distance_km: 0.0,
            total_duration_min: 0.0,
            is_active: true,
            optimized_at: Utc::now(),
        }
    }

    fn stop(order: u64, kind: StopKind) -> Stop {
        Stop::new(OrderId(order), kind, Coordinate::new(24.7, 46.6))
    }

    #[test]
    fn pickup_before_delivery_is_valid() {
        let route = route_with_stops(vec![
            stop(1, StopKind::Pickup),
            stop(2, StopKind::Pickup),
            stop(1, StopKind::Delivery),
            stop(2, StopKind::Delivery),
        ]);
        assert!(route.is_precedence_valid());
    }

    #[test]
    fn delivery_before_pickup_is_invalid() {
        let route = route_with_stops(vec![
            stop(1, StopKind::Delivery),
            stop(1, StopKind::Pickup),
        ]);
        assert!(!route.is_precedence_valid());
    }

    #[test]
    fn delivery_without_pickup_stop_is_valid() {
        // The parcel is already on board; only the delivery leg remains.
        let route = route_with_stops(vec![stop(1, StopKind::Delivery)]);
        assert!(route.is_precedence_valid());
    }
}
