use crate::models::{Coordinate, OrderId, ServiceTier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a fleet driver.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize,
)]
#[serde(transparent)]
pub struct DriverId(pub u64);

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "D{}", self.0)
    }
}

/// Driver availability state. Transitions are validated by the state machine,
/// never written directly.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverStatus {
    Offline,
    Available,
    Busy,
    Returning,
    OnBreak,
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DriverStatus::Offline => "OFFLINE",
            DriverStatus::Available => "AVAILABLE",
            DriverStatus::Busy => "BUSY",
            DriverStatus::Returning => "RETURNING",
            DriverStatus::OnBreak => "ON_BREAK",
        };
        f.write_str(name)
    }
}

arg_enum! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
    pub enum VehicleType {
        Motorcycle,
        Car,
        Van,
    }
}

impl VehicleType {
    /// Nominal cargo capacity used when a driver record does not carry an
    /// explicit override.
    pub fn default_capacity_kg(self) -> f64 {
        match self {
            VehicleType::Motorcycle => 30.0,
            VehicleType::Car => 300.0,
            VehicleType::Van => 1500.0,
        }
    }
}

/// A fleet member. The `status` field is owned by the state machine; the
/// remaining mutable fields are updated under the driver's lock.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Driver {
    pub id: DriverId,
    pub current_location: Coordinate,
    pub vehicle_type: VehicleType,
    pub capacity_kg: f64,
    pub service_tiers: Vec<ServiceTier>,
    pub status: DriverStatus,
    pub previous_status: DriverStatus,
    pub state_changed_at: DateTime<Utc>,
    /// Active orders in assignment order. Bounded by `max_concurrent_orders`.
    pub active_order_ids: Vec<OrderId>,
    /// Sum of `load_kg` over active orders. Maintained at assignment
    /// boundaries so capacity checks need no order lookups.
    pub assigned_load_kg: f64,
    pub completed_today: u32,
    pub target_deliveries: u32,
    pub hours_worked_today: f64,
    pub max_working_hours: f64,
    pub consecutive_deliveries: u32,
    pub on_time_rate: f64,
    pub last_break_at: Option<DateTime<Utc>>,
    pub last_location_update: Option<DateTime<Utc>>,
    /// Dropoff locations of today's completed deliveries, most recent last.
    /// Used by the zone component of dispatch scoring.
    pub recent_dropoffs: Vec<Coordinate>,
    /// Set when a fatal precondition contradiction was detected. Quarantined
    /// drivers are excluded from all engines until an operator intervenes.
    pub quarantined: bool,
}

impl Driver {
    pub fn serves(&self, tier: ServiceTier) -> bool {
        self.service_tiers.contains(&tier)
    }

    pub fn remaining_capacity_kg(&self) -> f64 {
        (self.capacity_kg - self.assigned_load_kg).max(0.0)
    }

    /// Record a completed delivery dropoff, keeping a short recency window.
    pub fn push_recent_dropoff(&mut self, dropoff: Coordinate) {
        const RECENT_WINDOW: usize = 10;
        self.recent_dropoffs.push(dropoff);
        if self.recent_dropoffs.len() > RECENT_WINDOW {
            self.recent_dropoffs.remove(0);
        }
    }
}

#[cfg(test)]
pub mod test_util {
    use super::*;

    /// An available van driver in central Riyadh with a clean slate.
    pub fn create_driver_for_test(id: u64) -> Driver {
        let epoch = chrono::TimeZone::ymd(&Utc, 2024, 3, 1).and_hms(8, 0, 0);
        Driver {
            id: DriverId(id),
            current_location: Coordinate::new(24.7136, 46.6753),
            vehicle_type: VehicleType::Van,
            capacity_kg: 1500.0,
            service_tiers: vec![ServiceTier::Barq, ServiceTier::Bullet],
            status: DriverStatus::Available,
            previous_status: DriverStatus::Offline,
            state_changed_at: epoch,
            active_order_ids: Vec::new(),
            assigned_load_kg: 0.0,
            completed_today: 0,
            target_deliveries: 25,
            hours_worked_today: 0.0,
            max_working_hours: 8.0,
            consecutive_deliveries: 0,
            on_time_rate: 1.0,
            last_break_at: None,
            last_location_update: Some(epoch),
            recent_dropoffs: Vec::new(),
            quarantined: false,
        }
    }
}
