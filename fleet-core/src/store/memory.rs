//! In-memory implementation of the persistence contract. All compare-and-set
//! operations take the table's write lock for their full read-modify-write,
//! which makes them atomic with respect to each other.

use super::{
    AuditJournal, BatchRepository, DriverRepository, IncidentRepository, OrderRepository,
    RouteRepository, StoreError, StoreResult,
};
use crate::models::{
    AssignmentLog, Batch, BatchId, BatchStatus, Coordinate, DispatchAlert, Driver, DriverId,
    EscalationLog, IncidentId, IncidentStatus, Order, OrderAlert, OrderId, OrderStatus,
    ReassignmentEvent, Route, RouteId, RouteOptimization, ServiceTier, SlaBreach, StateChange,
    TrafficIncident,
};
use async_std::sync::{Mutex, RwLock};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct AuditStreams {
    assignments: Vec<AssignmentLog>,
    state_changes: Vec<StateChange>,
    route_optimizations: Vec<RouteOptimization>,
    escalations: Vec<EscalationLog>,
    reassignments: Vec<ReassignmentEvent>,
    sla_breaches: Vec<SlaBreach>,
    dispatch_alerts: Vec<DispatchAlert>,
    order_alerts: Vec<OrderAlert>,
}

/// The authoritative in-process state of a running engine.
#[derive(Default)]
pub struct InMemoryStore {
    orders: RwLock<HashMap<OrderId, Order>>,
    drivers: RwLock<HashMap<DriverId, Driver>>,
    routes: RwLock<HashMap<RouteId, Route>>,
    active_routes: RwLock<HashMap<DriverId, RouteId>>,
    batches: RwLock<HashMap<BatchId, Batch>>,
    incidents: RwLock<HashMap<IncidentId, TrafficIncident>>,
    next_route_id: AtomicU64,
    next_batch_id: AtomicU64,
    next_incident_id: AtomicU64,
    audit: Mutex<AuditStreams>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn missing_order(id: OrderId) -> StoreError {
        StoreError::NotFound(format!("order {}", id))
    }

    fn missing_driver(id: DriverId) -> StoreError {
        StoreError::NotFound(format!("driver {}", id))
    }

    // Audit stream read-back, used by integration tests and operator
    // tooling; the engines themselves only append.

    pub async fn assignments(&self) -> Vec<AssignmentLog> {
        self.audit.lock().await.assignments.clone()
    }

    pub async fn state_changes(&self) -> Vec<StateChange> {
        self.audit.lock().await.state_changes.clone()
    }

    pub async fn route_optimizations(&self) -> Vec<RouteOptimization> {
        self.audit.lock().await.route_optimizations.clone()
    }

    pub async fn escalations(&self) -> Vec<EscalationLog> {
        self.audit.lock().await.escalations.clone()
    }

    pub async fn reassignments(&self) -> Vec<ReassignmentEvent> {
        self.audit.lock().await.reassignments.clone()
    }

    pub async fn sla_breaches(&self) -> Vec<SlaBreach> {
        self.audit.lock().await.sla_breaches.clone()
    }

    pub async fn dispatch_alerts(&self) -> Vec<DispatchAlert> {
        self.audit.lock().await.dispatch_alerts.clone()
    }

    pub async fn order_alerts(&self) -> Vec<OrderAlert> {
        self.audit.lock().await.order_alerts.clone()
    }

    pub async fn all_routes_for(&self, driver: DriverId) -> Vec<Route> {
        self.routes
            .read()
            .await
            .values()
            .filter(|route| route.driver_id == driver)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl OrderRepository for InMemoryStore {
    async fn create_order(&self, order: Order) -> StoreResult<()> {
        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.id) {
            return Err(StoreError::Conflict(format!(
                "order {} already exists",
                order.id
            )));
        }
        orders.insert(order.id, order);
        Ok(())
    }

    async fn order(&self, id: OrderId) -> StoreResult<Order> {
        self.orders
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Self::missing_order(id))
    }

    async fn orders_with_status(&self, statuses: Vec<OrderStatus>) -> StoreResult<Vec<Order>> {
        let mut result: Vec<Order> = self
            .orders
            .read()
            .await
            .values()
            .filter(|order| statuses.contains(&order.status))
            .cloned()
            .collect();
        result.sort_by_key(|order| order.id);
        Ok(result)
    }

    async fn try_assign(
        &self,
        id: OrderId,
        driver: DriverId,
        _at: DateTime<Utc>,
    ) -> StoreResult<Order> {
        let mut orders = self.orders.write().await;
        let order = orders.get_mut(&id).ok_or_else(|| Self::missing_order(id))?;
        if !order.is_unassigned() || order.driver_id.is_some() {
            return Err(StoreError::Conflict(format!(
                "order {} is {} and cannot be assigned",
                id, order.status
            )));
        }
        order.status = OrderStatus::Assigned;
        order.driver_id = Some(driver);
        Ok(order.clone())
    }

    async fn reassign(&self, id: OrderId, from: DriverId, to: DriverId) -> StoreResult<Order> {
        let mut orders = self.orders.write().await;
        let order = orders.get_mut(&id).ok_or_else(|| Self::missing_order(id))?;
        if order.status != OrderStatus::Assigned || order.driver_id != Some(from) {
            return Err(StoreError::Conflict(format!(
                "order {} is no longer assigned to {}",
                id, from
            )));
        }
        order.driver_id = Some(to);
        order.reassignment_count += 1;
        Ok(order.clone())
    }

    async fn return_to_pool(&self, id: OrderId) -> StoreResult<Order> {
        let mut orders = self.orders.write().await;
        let order = orders.get_mut(&id).ok_or_else(|| Self::missing_order(id))?;
        if order.status != OrderStatus::Assigned {
            return Err(StoreError::Conflict(format!(
                "order {} is {} and cannot return to the pool",
                id, order.status
            )));
        }
        order.status = OrderStatus::PendingDriver;
        order.driver_id = None;
        Ok(order.clone())
    }

    async fn set_pending_driver(&self, id: OrderId) -> StoreResult<Order> {
        let mut orders = self.orders.write().await;
        let order = orders.get_mut(&id).ok_or_else(|| Self::missing_order(id))?;
        if order.status == OrderStatus::Pending {
            order.status = OrderStatus::PendingDriver;
        }
        Ok(order.clone())
    }

    async fn mark_picked_up(&self, id: OrderId, at: DateTime<Utc>) -> StoreResult<Order> {
        let mut orders = self.orders.write().await;
        let order = orders.get_mut(&id).ok_or_else(|| Self::missing_order(id))?;
        if order.status != OrderStatus::Assigned {
            return Err(StoreError::Conflict(format!(
                "order {} is {} and cannot be picked up",
                id, order.status
            )));
        }
        order.status = OrderStatus::PickedUp;
        order.pickup_at = Some(at);
        Ok(order.clone())
    }

    async fn mark_delivered(&self, id: OrderId, at: DateTime<Utc>) -> StoreResult<Order> {
        let mut orders = self.orders.write().await;
        let order = orders.get_mut(&id).ok_or_else(|| Self::missing_order(id))?;
        if order.status != OrderStatus::PickedUp {
            return Err(StoreError::Conflict(format!(
                "order {} is {} and cannot be delivered",
                id, order.status
            )));
        }
        order.status = OrderStatus::Delivered;
        order.delivered_at = Some(at);
        order.driver_id = None;
        Ok(order.clone())
    }

    async fn terminate(&self, id: OrderId, status: OrderStatus) -> StoreResult<Order> {
        if !matches!(status, OrderStatus::Cancelled | OrderStatus::Failed) {
            return Err(StoreError::Conflict(format!(
                "{} is not a termination status",
                status
            )));
        }
        let mut orders = self.orders.write().await;
        let order = orders.get_mut(&id).ok_or_else(|| Self::missing_order(id))?;
        if order.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "order {} already terminated as {}",
                id, order.status
            )));
        }
        order.status = status;
        order.driver_id = None;
        Ok(order.clone())
    }

    async fn latch_sla_breach(&self, id: OrderId) -> StoreResult<bool> {
        let mut orders = self.orders.write().await;
        let order = orders.get_mut(&id).ok_or_else(|| Self::missing_order(id))?;
        let changed = !order.sla_breached;
        order.sla_breached = true;
        Ok(changed)
    }

    async fn set_batch(&self, id: OrderId, batch: BatchId) -> StoreResult<bool> {
        let mut orders = self.orders.write().await;
        let order = orders.get_mut(&id).ok_or_else(|| Self::missing_order(id))?;
        if !order.is_unassigned() || order.batch_id.is_some() {
            return Ok(false);
        }
        order.batch_id = Some(batch);
        Ok(true)
    }

    async fn clear_batch(&self, id: OrderId) -> StoreResult<()> {
        let mut orders = self.orders.write().await;
        let order = orders.get_mut(&id).ok_or_else(|| Self::missing_order(id))?;
        order.batch_id = None;
        Ok(())
    }
}

#[async_trait::async_trait]
impl DriverRepository for InMemoryStore {
    async fn upsert_driver(&self, driver: Driver) -> StoreResult<()> {
        self.drivers.write().await.insert(driver.id, driver);
        Ok(())
    }

    async fn driver(&self, id: DriverId) -> StoreResult<Driver> {
        self.drivers
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Self::missing_driver(id))
    }

    async fn drivers(&self) -> StoreResult<Vec<Driver>> {
        let mut result: Vec<Driver> = self.drivers.read().await.values().cloned().collect();
        result.sort_by_key(|driver| driver.id);
        Ok(result)
    }

    async fn store_driver(&self, driver: Driver) -> StoreResult<()> {
        let mut drivers = self.drivers.write().await;
        if !drivers.contains_key(&driver.id) {
            return Err(Self::missing_driver(driver.id));
        }
        drivers.insert(driver.id, driver);
        Ok(())
    }

    async fn update_location(
        &self,
        id: DriverId,
        location: Coordinate,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut drivers = self.drivers.write().await;
        let driver = drivers.get_mut(&id).ok_or_else(|| Self::missing_driver(id))?;
        driver.current_location = location;
        driver.last_location_update = Some(at);
        Ok(())
    }
}

#[async_trait::async_trait]
impl RouteRepository for InMemoryStore {
    // Lock order is always `routes` before `active_routes`; `activate_route`
    // and `deactivate_route` hold both for their atomic swap.

    async fn active_route(&self, driver: DriverId) -> StoreResult<Option<Route>> {
        let routes = self.routes.read().await;
        let active = self.active_routes.read().await;
        Ok(active
            .get(&driver)
            .and_then(|route_id| routes.get(route_id).cloned()))
    }

    async fn active_routes(&self) -> StoreResult<Vec<Route>> {
        let routes = self.routes.read().await;
        let active = self.active_routes.read().await;
        let mut result: Vec<Route> = active
            .values()
            .filter_map(|route_id| routes.get(route_id).cloned())
            .collect();
        result.sort_by_key(|route| route.id);
        Ok(result)
    }

    async fn activate_route(&self, mut route: Route) -> StoreResult<Route> {
        let mut routes = self.routes.write().await;
        let mut active = self.active_routes.write().await;

        route.id = RouteId(self.next_route_id.fetch_add(1, Ordering::SeqCst) + 1);
        route.is_active = true;
        if let Some(previous) = active.insert(route.driver_id, route.id) {
            if let Some(previous) = routes.get_mut(&previous) {
                previous.is_active = false;
            }
        }
        routes.insert(route.id, route.clone());
        Ok(route)
    }

    async fn deactivate_route(&self, driver: DriverId) -> StoreResult<()> {
        let mut routes = self.routes.write().await;
        let mut active = self.active_routes.write().await;
        if let Some(route_id) = active.remove(&driver) {
            if let Some(route) = routes.get_mut(&route_id) {
                route.is_active = false;
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BatchRepository for InMemoryStore {
    async fn create_batch(
        &self,
        order_ids: Vec<OrderId>,
        service_tier: ServiceTier,
        at: DateTime<Utc>,
    ) -> StoreResult<Batch> {
        let batch = Batch {
            id: BatchId(self.next_batch_id.fetch_add(1, Ordering::SeqCst) + 1),
            driver_id: None,
            order_ids,
            service_tier,
            status: BatchStatus::Pending,
            created_at: at,
        };
        self.batches.write().await.insert(batch.id, batch.clone());
        Ok(batch)
    }

    async fn batch(&self, id: BatchId) -> StoreResult<Batch> {
        self.batches
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("batch {}", id)))
    }

    async fn pending_batches(&self) -> StoreResult<Vec<Batch>> {
        let mut result: Vec<Batch> = self
            .batches
            .read()
            .await
            .values()
            .filter(|batch| batch.status == BatchStatus::Pending)
            .cloned()
            .collect();
        result.sort_by_key(|batch| batch.id);
        Ok(result)
    }

    async fn set_batch_status(&self, id: BatchId, status: BatchStatus) -> StoreResult<()> {
        let mut batches = self.batches.write().await;
        let batch = batches
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("batch {}", id)))?;
        batch.status = status;
        Ok(())
    }

    async fn set_batch_driver(&self, id: BatchId, driver: Option<DriverId>) -> StoreResult<()> {
        let mut batches = self.batches.write().await;
        let batch = batches
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("batch {}", id)))?;
        batch.driver_id = driver;
        Ok(())
    }
}

#[async_trait::async_trait]
impl IncidentRepository for InMemoryStore {
    async fn report_incident(&self, mut incident: TrafficIncident) -> StoreResult<TrafficIncident> {
        incident.id = IncidentId(self.next_incident_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.incidents
            .write()
            .await
            .insert(incident.id, incident.clone());
        Ok(incident)
    }

    async fn resolve_incident(&self, id: IncidentId) -> StoreResult<()> {
        let mut incidents = self.incidents.write().await;
        let incident = incidents
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("incident {}", id)))?;
        incident.status = IncidentStatus::Resolved;
        Ok(())
    }

    async fn expire_incidents(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut incidents = self.incidents.write().await;
        let mut expired = 0;
        for incident in incidents.values_mut() {
            if incident.is_active() && incident.reported_at < cutoff {
                incident.status = IncidentStatus::Resolved;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn active_incidents(&self) -> StoreResult<Vec<TrafficIncident>> {
        Ok(self
            .incidents
            .read()
            .await
            .values()
            .filter(|incident| incident.is_active())
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl AuditJournal for InMemoryStore {
    async fn record_assignment(&self, log: AssignmentLog) -> StoreResult<()> {
        self.audit.lock().await.assignments.push(log);
        Ok(())
    }

    async fn record_state_change(&self, change: StateChange) -> StoreResult<()> {
        self.audit.lock().await.state_changes.push(change);
        Ok(())
    }

    async fn record_route_optimization(&self, record: RouteOptimization) -> StoreResult<()> {
        self.audit.lock().await.route_optimizations.push(record);
        Ok(())
    }

    async fn record_escalation(&self, log: EscalationLog) -> StoreResult<()> {
        self.audit.lock().await.escalations.push(log);
        Ok(())
    }

    async fn record_reassignment(&self, event: ReassignmentEvent) -> StoreResult<()> {
        self.audit.lock().await.reassignments.push(event);
        Ok(())
    }

    async fn record_sla_breach(&self, breach: SlaBreach) -> StoreResult<()> {
        self.audit.lock().await.sla_breaches.push(breach);
        Ok(())
    }

    async fn record_dispatch_alert(&self, alert: DispatchAlert) -> StoreResult<()> {
        self.audit.lock().await.dispatch_alerts.push(alert);
        Ok(())
    }

    async fn record_order_alert(&self, alert: OrderAlert) -> StoreResult<()> {
        self.audit.lock().await.order_alerts.push(alert);
        Ok(())
    }
}
