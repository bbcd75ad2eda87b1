use crate::models::{DriverId, OrderId, ServiceTier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an order batch.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize,
)]
#[serde(transparent)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Cancelled)
    }
}

/// A set of orders compatible enough to be served by one driver in one route.
/// Orders keep their own status; the batch tracks the collective lifecycle.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Batch {
    pub id: BatchId,
    pub driver_id: Option<DriverId>,
    pub order_ids: Vec<OrderId>,
    pub service_tier: ServiceTier,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn contains(&self, order: OrderId) -> bool {
        self.order_ids.contains(&order)
    }
}
