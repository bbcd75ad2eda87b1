//! The persistence contract of the control plane. Only the semantic
//! operations are specified here; the in-memory implementation in
//! `store::memory` is the authoritative state for a running engine, the same
//! way an external database would be.
//!
//! Concurrency rules enforced at this seam:
//! - order mutations are compare-and-set on the current status, so the first
//!   successful writer wins and concurrent attempts observe a `Conflict`;
//! - driver rows are only written while holding the driver's logical lock
//!   from [`DriverLockRegistry`];
//! - route swaps are copy-on-write and atomic;
//! - audit streams are append-only.

pub mod memory;

pub use self::memory::InMemoryStore;
use crate::models::{
    AssignmentLog, Batch, BatchId, BatchStatus, Coordinate, DispatchAlert, Driver, DriverId,
    EscalationLog, IncidentId, Order, OrderAlert, OrderId, OrderStatus, ReassignmentEvent, Route,
    RouteOptimization, ServiceTier, SlaBreach, StateChange, TrafficIncident,
};
use async_std::sync::Mutex;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Conflicts are legitimate races; everything else is infrastructure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait OrderRepository: Send + Sync {
    /// Inserts a new order. Fails with `Conflict` when the id is taken.
    async fn create_order(&self, order: Order) -> StoreResult<()>;

    async fn order(&self, id: OrderId) -> StoreResult<Order>;

    async fn orders_with_status(&self, statuses: Vec<OrderStatus>) -> StoreResult<Vec<Order>>;

    /// Compare-and-set assignment: succeeds only while the order is still
    /// unassigned (`pending` or `pending_driver`) and unclaimed. The first
    /// successful writer wins.
    async fn try_assign(
        &self,
        id: OrderId,
        driver: DriverId,
        at: DateTime<Utc>,
    ) -> StoreResult<Order>;

    /// Moves an assigned order to a different driver, guarded on the current
    /// driver still being `from`. Bumps `reassignment_count`.
    async fn reassign(
        &self,
        id: OrderId,
        from: DriverId,
        to: DriverId,
    ) -> StoreResult<Order>;

    /// Puts an assigned order back into the dispatch pool as
    /// `pending_driver`, clearing the driver binding.
    async fn return_to_pool(&self, id: OrderId) -> StoreResult<Order>;

    /// Marks a pending order as `pending_driver` (no candidates found).
    async fn set_pending_driver(&self, id: OrderId) -> StoreResult<Order>;

    async fn mark_picked_up(&self, id: OrderId, at: DateTime<Utc>) -> StoreResult<Order>;

    async fn mark_delivered(&self, id: OrderId, at: DateTime<Utc>) -> StoreResult<Order>;

    /// Terminates the order as cancelled or failed. Only these two terminal
    /// statuses are accepted.
    async fn terminate(&self, id: OrderId, status: OrderStatus) -> StoreResult<Order>;

    /// Latches `sla_breached`; returns whether this call flipped it.
    async fn latch_sla_breach(&self, id: OrderId) -> StoreResult<bool>;

    /// Links the order to a batch; only succeeds while the order is pending
    /// and unbatched so an order never sits in two PENDING batches.
    async fn set_batch(&self, id: OrderId, batch: BatchId) -> StoreResult<bool>;

    async fn clear_batch(&self, id: OrderId) -> StoreResult<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait DriverRepository: Send + Sync {
    /// Inserts or replaces a driver record.
    async fn upsert_driver(&self, driver: Driver) -> StoreResult<()>;

    async fn driver(&self, id: DriverId) -> StoreResult<Driver>;

    async fn drivers(&self) -> StoreResult<Vec<Driver>>;

    /// Full-row write. The caller must hold the driver's logical lock.
    async fn store_driver(&self, driver: Driver) -> StoreResult<()>;

    async fn update_location(
        &self,
        id: DriverId,
        location: Coordinate,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait RouteRepository: Send + Sync {
    async fn active_route(&self, driver: DriverId) -> StoreResult<Option<Route>>;

    /// Every currently active route across the fleet.
    async fn active_routes(&self) -> StoreResult<Vec<Route>>;

    /// Stores `route` as the driver's active route and deactivates the
    /// previous one in the same step. The store allocates the route id.
    async fn activate_route(&self, route: Route) -> StoreResult<Route>;

    async fn deactivate_route(&self, driver: DriverId) -> StoreResult<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait BatchRepository: Send + Sync {
    /// Creates a batch in `PENDING`. The store allocates the batch id.
    async fn create_batch(
        &self,
        order_ids: Vec<OrderId>,
        service_tier: ServiceTier,
        at: DateTime<Utc>,
    ) -> StoreResult<Batch>;

    async fn batch(&self, id: BatchId) -> StoreResult<Batch>;

    async fn pending_batches(&self) -> StoreResult<Vec<Batch>>;

    async fn set_batch_status(&self, id: BatchId, status: BatchStatus) -> StoreResult<()>;

    async fn set_batch_driver(&self, id: BatchId, driver: Option<DriverId>) -> StoreResult<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait IncidentRepository: Send + Sync {
    /// Stores a new incident. The store allocates the incident id.
    async fn report_incident(&self, incident: TrafficIncident) -> StoreResult<TrafficIncident>;

    async fn resolve_incident(&self, id: IncidentId) -> StoreResult<()>;

    /// Resolves every active incident reported before `cutoff`; returns how
    /// many aged out.
    async fn expire_incidents(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;

    async fn active_incidents(&self) -> StoreResult<Vec<TrafficIncident>>;
}

/// The append-only audit streams.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait AuditJournal: Send + Sync {
    async fn record_assignment(&self, log: AssignmentLog) -> StoreResult<()>;
    async fn record_state_change(&self, change: StateChange) -> StoreResult<()>;
    async fn record_route_optimization(&self, record: RouteOptimization) -> StoreResult<()>;
    async fn record_escalation(&self, log: EscalationLog) -> StoreResult<()>;
    async fn record_reassignment(&self, event: ReassignmentEvent) -> StoreResult<()>;
    async fn record_sla_breach(&self, breach: SlaBreach) -> StoreResult<()>;
    async fn record_dispatch_alert(&self, alert: DispatchAlert) -> StoreResult<()>;
    async fn record_order_alert(&self, alert: OrderAlert) -> StoreResult<()>;
}

/// Serializes writers per driver. Locks are acquired in driver-id order when
/// more than one is needed (see `lock_pair`) so writers cannot deadlock.
#[derive(Default)]
pub struct DriverLockRegistry {
    locks: Mutex<HashMap<DriverId, Arc<Mutex<()>>>>,
}

impl DriverLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The logical lock for one driver. Callers lock the returned mutex for
    /// the duration of their read-modify-write.
    pub async fn acquire(&self, id: DriverId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(id).or_default().clone()
    }

    /// Locks for a pair of drivers in id order.
    pub async fn acquire_pair(
        &self,
        a: DriverId,
        b: DriverId,
    ) -> (Arc<Mutex<()>>, Arc<Mutex<()>>) {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        let mut locks = self.locks.lock().await;
        let first = locks.entry(first).or_default().clone();
        let second = locks.entry(second).or_default().clone();
        (first, second)
    }
}

/// Tracks store availability to drive the degraded read-only mode: after a
/// threshold of consecutive infrastructure failures the engines stop
/// assigning until the first success.
pub struct Availability {
    consecutive_failures: AtomicU32,
    threshold: u32,
    degraded: AtomicBool,
}

impl Availability {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            threshold,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Records the outcome of a store round trip. Conflicts count as
    /// successes since they prove the store answered. Returns true when this
    /// observation changed the degraded flag.
    pub fn observe<T>(&self, result: &StoreResult<T>) -> bool {
        match result {
            Err(StoreError::Unavailable(_)) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                failures >= self.threshold && !self.degraded.swap(true, Ordering::SeqCst)
            }
            _ => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.degraded.swap(false, Ordering::SeqCst)
            }
        }
    }
}

/// Runs a store operation, retrying transient `Unavailable` failures with
/// exponential backoff (50ms doubling to 1s, five attempts). Conflicts and
/// missing entities return immediately; the final outcome is reported to the
/// availability tracker.
pub async fn with_retry<T, Fut>(
    sleep: &dyn crate::util::AsyncSleeping,
    availability: &Availability,
    mut operation: impl FnMut() -> Fut,
) -> StoreResult<T>
where
    Fut: std::future::Future<Output = StoreResult<T>>,
{
    let mut backoff = std::time::Duration::from_millis(50);
    let mut attempt = 1;
    loop {
        let result = operation().await;
        match result {
            Err(StoreError::Unavailable(ref message)) if attempt < crate::util::RETRY_ATTEMPTS => {
                log::warn!(
                    "store unavailable (attempt {}/{}), retrying in {:?}: {}",
                    attempt,
                    crate::util::RETRY_ATTEMPTS,
                    backoff,
                    message,
                );
                sleep.sleep(backoff).await;
                backoff = (backoff * 2).min(std::time::Duration::from_secs(1));
                attempt += 1;
            }
            result => {
                availability.observe(&result);
                return result;
            }
        }
    }
}
