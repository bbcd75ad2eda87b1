pub mod audit;
pub mod batch;
pub mod driver;
pub mod geo;
pub mod order;
pub mod route;
pub mod traffic;

pub use self::{
    audit::{
        AssignmentKind, AssignmentLog, DispatchAlert, DispatchAlertType, EscalationLog,
        EscalationType, OrderAlert, ReassignmentEvent, RouteOptimization, Severity, SlaBreach,
        StateChange,
    },
    batch::{Batch, BatchId, BatchStatus},
    driver::{Driver, DriverId, DriverStatus, VehicleType},
    geo::{BoundingBox, Coordinate},
    order::{FailureCategory, Order, OrderId, OrderStatus, ServiceTier},
    route::{Route, RouteId, Stop, StopKind},
    traffic::{IncidentId, IncidentSeverity, IncidentStatus, TrafficIncident},
};
