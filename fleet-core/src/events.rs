//! The event contract of the core: inbound events it accepts from the outer
//! platform and outbound events it emits. Outbound delivery is a typed
//! broadcast to subscribers registered up front; a dropped receiver is pruned
//! on the next publish.

use crate::models::{
    BatchId, Coordinate, DispatchAlertType, DriverId, DriverStatus, FailureCategory, IncidentId,
    IncidentSeverity, OrderId, ServiceTier, Severity,
};
use chrono::{DateTime, Utc};
use futures::channel::mpsc;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Payload of an `order.created` event. The core derives `sla_deadline` from
/// the tier when the producer does not set one.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NewOrder {
    pub id: OrderId,
    pub service_tier: ServiceTier,
    pub pickup: Coordinate,
    pub dropoff: Coordinate,
    pub load_kg: f64,
    #[serde(default)]
    pub priority: u8,
    pub created_at: Option<DateTime<Utc>>,
    pub sla_deadline: Option<DateTime<Utc>>,
}

/// Driver-originated status notifications.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatusEventKind {
    ShiftStart,
    ShiftEnd,
    BreakStart,
    BreakEnd,
    ArrivedAtBase,
}

/// Inbound events the core accepts.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum InboundEvent {
    #[serde(rename = "order.created")]
    OrderCreated { order: NewOrder },
    #[serde(rename = "order.cancelled")]
    OrderCancelled { id: OrderId },
    #[serde(rename = "driver.location")]
    DriverLocation {
        driver_id: DriverId,
        location: Coordinate,
        at: DateTime<Utc>,
    },
    #[serde(rename = "driver.status_event")]
    DriverStatusEvent {
        driver_id: DriverId,
        kind: DriverStatusEventKind,
    },
    #[serde(rename = "dispatch.offer_response")]
    OfferResponse {
        order_id: OrderId,
        driver_id: DriverId,
        accepted: bool,
    },
    #[serde(rename = "delivery.pickup")]
    DeliveryPickup { order_id: OrderId },
    #[serde(rename = "delivery.completed")]
    DeliveryCompleted {
        order_id: OrderId,
        on_time: Option<bool>,
    },
    #[serde(rename = "delivery.failed")]
    DeliveryFailed {
        order_id: OrderId,
        category: FailureCategory,
        notes: Option<String>,
    },
    #[serde(rename = "traffic.incident")]
    TrafficIncidentReported {
        location: Coordinate,
        severity: IncidentSeverity,
        kind: String,
        radius_m: f64,
    },
    #[serde(rename = "traffic.resolved")]
    TrafficResolved { incident_id: IncidentId },
}

/// Outbound events the core emits.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum OutboundEvent {
    #[serde(rename = "order.assigned")]
    OrderAssigned {
        order_id: OrderId,
        driver_id: DriverId,
        score: f64,
    },
    #[serde(rename = "order.reassigned")]
    OrderReassigned {
        order_id: OrderId,
        from_driver: DriverId,
        to_driver: DriverId,
    },
    #[serde(rename = "order.delivered")]
    OrderDelivered { order_id: OrderId, on_time: bool },
    #[serde(rename = "order.pending_driver")]
    OrderPendingDriver { order_id: OrderId },
    #[serde(rename = "driver.state_changed")]
    DriverStateChanged {
        driver_id: DriverId,
        from: DriverStatus,
        to: DriverStatus,
        reason: String,
    },
    #[serde(rename = "route.optimized")]
    RouteOptimized {
        driver_id: DriverId,
        saved_km: f64,
        saved_min: f64,
    },
    #[serde(rename = "batch.created")]
    BatchCreated {
        batch_id: BatchId,
        order_ids: Vec<OrderId>,
    },
    #[serde(rename = "batch.completed")]
    BatchCompleted { batch_id: BatchId },
    #[serde(rename = "alert.dispatch")]
    DispatchAlertRaised {
        severity: Severity,
        alert_type: DispatchAlertType,
        order_id: Option<OrderId>,
    },
    #[serde(rename = "alert.sla")]
    SlaAlert {
        order_id: OrderId,
        level: Severity,
    },
}

/// Broadcast channel for outbound events. Subscribers are expected to be
/// registered at construction time; publishing never blocks.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<OutboundEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<OutboundEvent> {
        let (sender, receiver) = mpsc::unbounded();
        self.subscribers.lock().unwrap().push(sender);
        receiver
    }

    pub fn publish(&self, event: OutboundEvent) {
        log::debug!("emitting {:?}", event);
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|subscriber| subscriber.unbounded_send(event.clone()).is_ok());
    }
}
