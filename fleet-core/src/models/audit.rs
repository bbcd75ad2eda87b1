//! Append-only audit rows emitted by the engines. These are the persisted
//! shape of every operational decision: assignments, state transitions, route
//! swaps, escalations, reassignments, breaches, and operator-facing alerts.

use crate::models::{DriverId, DriverStatus, OrderId, RouteId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operator-facing alert severity.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

/// How an assignment came to be.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentKind {
    Normal,
    ForceAssigned,
    Reassigned,
}

/// One committed order (or batch) to driver binding with its full score
/// breakdown, kept for auditing dispatch decisions.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct AssignmentLog {
    pub order_id: OrderId,
    pub driver_id: DriverId,
    pub kind: AssignmentKind,
    pub proximity_score: f64,
    pub performance_score: f64,
    pub capacity_score: f64,
    pub zone_score: f64,
    pub total_score: f64,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// One driver state transition with its provenance.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct StateChange {
    pub driver_id: DriverId,
    pub from: DriverStatus,
    pub to: DriverStatus,
    pub reason: String,
    pub actor: String,
    pub at: DateTime<Utc>,
}

/// Outcome of one route optimizer run that produced a better route.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RouteOptimization {
    pub driver_id: DriverId,
    pub old_route_id: Option<RouteId>,
    pub new_route_id: RouteId,
    pub old_distance_km: f64,
    pub new_distance_km: f64,
    pub saved_min: f64,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// The monitored conditions the escalation engine acts on.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationType {
    SlaRiskCritical,
    SlaRiskAssigned,
    DriverUnresponsive,
    StuckOrder,
    FailedDelivery,
}

impl fmt::Display for EscalationType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            EscalationType::SlaRiskCritical => "SLA_RISK_CRITICAL",
            EscalationType::SlaRiskAssigned => "SLA_RISK_ASSIGNED",
            EscalationType::DriverUnresponsive => "DRIVER_UNRESPONSIVE",
            EscalationType::StuckOrder => "STUCK_ORDER",
            EscalationType::FailedDelivery => "FAILED_DELIVERY",
        };
        f.write_str(name)
    }
}

/// One escalation firing. Debounced per (order, type).
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct EscalationLog {
    pub order_id: OrderId,
    pub escalation: EscalationType,
    pub severity: Severity,
    pub message: String,
    pub at: DateTime<Utc>,
    pub acknowledged: bool,
    pub resolved: bool,
}

/// A committed reassignment of an order between two drivers.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ReassignmentEvent {
    pub order_id: OrderId,
    pub from_driver: DriverId,
    pub to_driver: DriverId,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Recorded when an order terminates past its deadline.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SlaBreach {
    pub order_id: OrderId,
    pub breach_min: f64,
    pub penalty: f64,
    /// True when the escalation engine had an opportunity to act before the
    /// breach (a candidate existed at the last SLA risk tick).
    pub preventable: bool,
    pub at: DateTime<Utc>,
}

/// Operational alert classes surfaced to dispatch operators.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchAlertType {
    NoDrivers,
    AllBusy,
    OptimizerFailure,
    StoreUnavailable,
    DriverQuarantined,
    DriverUnresponsive,
    StuckOrder,
    DeliveryFailed,
}

impl fmt::Display for DispatchAlertType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DispatchAlertType::NoDrivers => "NO_DRIVERS",
            DispatchAlertType::AllBusy => "ALL_BUSY",
            DispatchAlertType::OptimizerFailure => "OPTIMIZER_FAILURE",
            DispatchAlertType::StoreUnavailable => "STORE_UNAVAILABLE",
            DispatchAlertType::DriverQuarantined => "DRIVER_QUARANTINED",
            DispatchAlertType::DriverUnresponsive => "DRIVER_UNRESPONSIVE",
            DispatchAlertType::StuckOrder => "STUCK_ORDER",
            DispatchAlertType::DeliveryFailed => "DELIVERY_FAILED",
        };
        f.write_str(name)
    }
}

/// An operator-facing alert from the dispatch pipeline.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DispatchAlert {
    pub severity: Severity,
    pub alert_type: DispatchAlertType,
    pub order_id: Option<OrderId>,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// A customer-visible order alert (SLA level changes and compensation).
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct OrderAlert {
    pub order_id: OrderId,
    pub severity: Severity,
    pub message: String,
    pub at: DateTime<Utc>,
}
