use crate::models::{BatchId, Coordinate, DriverId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a delivery order.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize,
)]
#[serde(transparent)]
pub struct OrderId(pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "O{}", self.0)
    }
}

/// The service tier an order was booked under. BARQ is the express product,
/// BULLET the same-day product.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceTier {
    Barq,
    Bullet,
}

impl fmt::Display for ServiceTier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServiceTier::Barq => f.write_str("BARQ"),
            ServiceTier::Bullet => f.write_str("BULLET"),
        }
    }
}

/// Lifecycle state of an order. Progression is monotone; `Cancelled` and
/// `Failed` are reachable from every non-terminal state.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    PendingDriver,
    Assigned,
    PickedUp,
    Delivered,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }

    /// Whether moving to `next` respects the order state machine.
    pub fn may_progress_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Cancelled) | (_, Failed) => true,
            (Pending, PendingDriver) | (Pending, Assigned) => true,
            (PendingDriver, Assigned) => true,
            (Assigned, PickedUp) => true,
            // A failed pickup attempt puts the order back in the dispatch pool.
            (Assigned, Pending) | (Assigned, PendingDriver) => true,
            (PickedUp, Delivered) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::PendingDriver => "pending_driver",
            OrderStatus::Assigned => "assigned",
            OrderStatus::PickedUp => "picked_up",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a delivery attempt failed. Drives the recovery action chosen by the
/// escalation engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    CustomerUnavailable,
    WrongAddress,
    AccessRestricted,
    DamagedParcel,
    Other,
}

/// A single delivery request.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Order {
    pub id: OrderId,
    pub service_tier: ServiceTier,
    pub pickup: Coordinate,
    pub dropoff: Coordinate,
    pub load_kg: f64,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub sla_deadline: DateTime<Utc>,
    pub status: OrderStatus,
    pub driver_id: Option<DriverId>,
    pub batch_id: Option<BatchId>,
    pub pickup_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    /// Latches true the first time the deadline passes while non-terminal.
    pub sla_breached: bool,
    pub reassignment_count: u32,
}

impl Order {
    /// Time left until the SLA deadline. Negative once breached.
    pub fn remaining_sla(&self, now: DateTime<Utc>) -> Duration {
        self.sla_deadline - now
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the order still waits for a driver.
    pub fn is_unassigned(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Pending | OrderStatus::PendingDriver
        )
    }
}
