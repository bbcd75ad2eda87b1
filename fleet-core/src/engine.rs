//! The engine value that owns every subsystem. Lifecycle is
//! `new -> run -> shutdown`; there is one per process. Inbound events enter
//! through [`FleetEngine::apply`], the four long-lived loops run on their
//! configured cadences, and event-triggered route optimizations drain
//! through a bounded worker pool.

use crate::batching::BatchingEngine;
use crate::config::FleetConfig;
use crate::dispatch::{DispatchEngine, DispatchOutcome};
use crate::distance::DistanceEstimating;
use crate::escalation::EscalationEngine;
use crate::events::{
    DriverStatusEventKind, EventBus, InboundEvent, NewOrder, OutboundEvent,
};
use crate::metrics::FleetMetrics;
use crate::models::{
    Batch, BatchStatus, DriverStatus, IncidentStatus, Order, OrderStatus, TrafficIncident,
};
use crate::routing::{optimize_channel, OptimizeHandle, OptimizeReason, OptimizeRequest, RouteOptimizer};
use crate::state_machine::DriverStateMachine;
use crate::store::{
    Availability, BatchRepository as _, DriverLockRegistry, DriverRepository as _, InMemoryStore,
    IncidentRepository as _, OrderRepository as _, StoreError,
};
use crate::util::{AsyncSleep, AsyncSleeping, Now};
use anyhow::{anyhow, bail, Context as _, Result};
use futures::channel::mpsc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub struct FleetEngine {
    config: FleetConfig,
    store: Arc<InMemoryStore>,
    bus: Arc<EventBus>,
    state_machine: Arc<DriverStateMachine>,
    dispatch: Arc<DispatchEngine>,
    batching: Arc<BatchingEngine>,
    optimizer: Arc<RouteOptimizer>,
    escalation: Arc<EscalationEngine>,
    optimize: OptimizeHandle,
    optimize_rx: Mutex<Option<mpsc::UnboundedReceiver<OptimizeRequest>>>,
    availability: Arc<Availability>,
    sleep: Arc<dyn AsyncSleeping>,
    now: Arc<dyn Now>,
    stopping: AtomicBool,
}

impl FleetEngine {
    /// Builds the engine with the production clock and sleeper.
    pub fn new(
        config: FleetConfig,
        store: Arc<InMemoryStore>,
        distance: Arc<dyn DistanceEstimating>,
        metrics: Arc<FleetMetrics>,
    ) -> Result<Arc<Self>> {
        Self::with_clock(
            config,
            store,
            distance,
            metrics,
            Arc::new(AsyncSleep),
            Arc::new(crate::util::default_now()),
        )
    }

    /// Builds the engine with an explicit clock and sleeper; tests pin time
    /// with this.
    pub fn with_clock(
        config: FleetConfig,
        store: Arc<InMemoryStore>,
        distance: Arc<dyn DistanceEstimating>,
        metrics: Arc<FleetMetrics>,
        sleep: Arc<dyn AsyncSleeping>,
        now: Arc<dyn Now>,
    ) -> Result<Arc<Self>> {
        config.validate().context("invalid configuration")?;

        let bus = Arc::new(EventBus::new());
        let availability = Arc::new(Availability::new(config.unavailable_threshold));
        let locks = Arc::new(DriverLockRegistry::new());
        let (optimize, optimize_rx) = optimize_channel();

        let state_machine = Arc::new(DriverStateMachine::new(
            store.clone(),
            store.clone(),
            locks,
            bus.clone(),
            config.caps.clone(),
            now.clone(),
        ));
        let dispatch = Arc::new(DispatchEngine::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            state_machine.clone(),
            optimize.clone(),
            bus.clone(),
            metrics.clone(),
            availability.clone(),
            sleep.clone(),
            now.clone(),
            config.dispatch.clone(),
        ));
        let batching = Arc::new(BatchingEngine::new(
            store.clone(),
            store.clone(),
            bus.clone(),
            metrics.clone(),
            availability.clone(),
            sleep.clone(),
            now.clone(),
            config.batching.clone(),
            config.speeds,
            config.route.road_factor,
        ));
        let optimizer = Arc::new(RouteOptimizer::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            distance,
            bus.clone(),
            metrics.clone(),
            availability.clone(),
            sleep.clone(),
            now.clone(),
            config.route.clone(),
        ));
        let escalation = Arc::new(EscalationEngine::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            state_machine.clone(),
            dispatch.clone(),
            optimize.clone(),
            bus.clone(),
            metrics,
            availability.clone(),
            sleep.clone(),
            now.clone(),
            config.escalation.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            store,
            bus,
            state_machine,
            dispatch,
            batching,
            optimizer,
            escalation,
            optimize,
            optimize_rx: Mutex::new(Some(optimize_rx)),
            availability,
            sleep,
            now,
            stopping: AtomicBool::new(false),
        }))
    }

    pub fn store(&self) -> &Arc<InMemoryStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn dispatch(&self) -> &Arc<DispatchEngine> {
        &self.dispatch
    }

    pub fn batching(&self) -> &Arc<BatchingEngine> {
        &self.batching
    }

    pub fn optimizer(&self) -> &Arc<RouteOptimizer> {
        &self.optimizer
    }

    pub fn escalation(&self) -> &Arc<EscalationEngine> {
        &self.escalation
    }

    pub fn state_machine(&self) -> &Arc<DriverStateMachine> {
        &self.state_machine
    }

    pub fn is_degraded(&self) -> bool {
        self.availability.is_degraded()
    }

    /// Signals every loop to wind down after its current iteration.
    pub fn shut_down(&self) {
        log::info!("engine shutting down");
        self.stopping.store(true, Ordering::SeqCst);
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Applies one inbound event. Malformed events and unknown entity ids
    /// are rejected here with no state change.
    pub async fn apply(&self, event: InboundEvent) -> Result<()> {
        match event {
            InboundEvent::OrderCreated { order } => self.on_order_created(order).await,
            InboundEvent::OrderCancelled { id } => self.on_order_cancelled(id).await,
            InboundEvent::DriverLocation {
                driver_id,
                location,
                at,
            } => {
                if !(-90.0..=90.0).contains(&location.lat)
                    || !(-180.0..=180.0).contains(&location.lng)
                {
                    bail!("driver {} sent an out-of-range location", driver_id);
                }
                match self.store.update_location(driver_id, location, at).await {
                    Ok(()) => Ok(()),
                    Err(StoreError::NotFound(what)) => Err(anyhow!("unknown {}", what)),
                    Err(err) => Err(err.into()),
                }
            }
            InboundEvent::DriverStatusEvent { driver_id, kind } => {
                let (target, reason) = match kind {
                    DriverStatusEventKind::ShiftStart => (DriverStatus::Available, "shift_start"),
                    DriverStatusEventKind::ShiftEnd => (DriverStatus::Offline, "shift_end"),
                    DriverStatusEventKind::BreakStart => (DriverStatus::OnBreak, "break_started"),
                    DriverStatusEventKind::BreakEnd => (DriverStatus::Available, "break_ended"),
                    DriverStatusEventKind::ArrivedAtBase => {
                        (DriverStatus::Available, "arrived_at_base")
                    }
                };
                self.state_machine
                    .try_transition(driver_id, target, reason, "driver")
                    .await?;
                Ok(())
            }
            InboundEvent::OfferResponse {
                order_id,
                driver_id,
                accepted,
            } => {
                self.dispatch
                    .handle_offer_response(order_id, driver_id, accepted)
                    .await?;
                Ok(())
            }
            InboundEvent::DeliveryPickup { order_id } => {
                let now = self.now.utc_now();
                let order = self.store.mark_picked_up(order_id, now).await?;
                if let Some(driver) = order.driver_id {
                    self.optimize.request(driver, OptimizeReason::StopsChanged);
                }
                Ok(())
            }
            InboundEvent::DeliveryCompleted { order_id, on_time } => {
                self.on_delivery_completed(order_id, on_time).await
            }
            InboundEvent::DeliveryFailed {
                order_id,
                category,
                notes,
            } => {
                self.escalation
                    .handle_failed_delivery(order_id, category, notes)
                    .await
            }
            InboundEvent::TrafficIncidentReported {
                location,
                severity,
                kind,
                radius_m,
            } => {
                if radius_m <= 0.0 {
                    bail!("incident radius must be positive");
                }
                let incident = self
                    .store
                    .report_incident(TrafficIncident {
                        id: Default::default(),
                        location,
                        radius_m,
                        severity,
                        kind,
                        status: IncidentStatus::Active,
                        reported_at: self.now.utc_now(),
                    })
                    .await?;
                if incident.blocks_routing() {
                    for driver in self.optimizer.affected_drivers(&incident).await? {
                        self.optimize.request(driver, OptimizeReason::Traffic);
                    }
                }
                Ok(())
            }
            InboundEvent::TrafficResolved { incident_id } => {
                self.store.resolve_incident(incident_id).await?;
                Ok(())
            }
        }
    }

    async fn on_order_created(&self, new: NewOrder) -> Result<()> {
        if new.load_kg <= 0.0 {
            bail!("order {} has a non-positive load", new.id);
        }
        for coordinate in &[new.pickup, new.dropoff] {
            if !(-90.0..=90.0).contains(&coordinate.lat)
                || !(-180.0..=180.0).contains(&coordinate.lng)
            {
                bail!("order {} has an out-of-range coordinate", new.id);
            }
        }
        let created_at = new.created_at.unwrap_or_else(|| self.now.utc_now());
        let sla_deadline = new.sla_deadline.unwrap_or_else(|| {
            created_at
                + chrono::Duration::from_std(self.config.slas.for_tier(new.service_tier))
                    .unwrap_or_else(|_| chrono::Duration::hours(1))
        });
        let order = Order {
            id: new.id,
            service_tier: new.service_tier,
            pickup: new.pickup,
            dropoff: new.dropoff,
            load_kg: new.load_kg,
            priority: new.priority,
            created_at,
            sla_deadline,
            status: OrderStatus::Pending,
            driver_id: None,
            batch_id: None,
            pickup_at: None,
            delivered_at: None,
            sla_breached: false,
            reassignment_count: 0,
        };
        let id = order.id;
        self.store.create_order(order).await?;
        log::info!("accepted {} for dispatch", id);
        let outcome = self.dispatch.dispatch_order(id).await?;
        if outcome == DispatchOutcome::Degraded {
            log::warn!("{} accepted while degraded; waiting for recovery", id);
        }
        Ok(())
    }

    async fn on_order_cancelled(&self, id: crate::models::OrderId) -> Result<()> {
        let order = match self.store.order(id).await {
            Ok(order) => order,
            Err(StoreError::NotFound(what)) => return Err(anyhow!("unknown {}", what)),
            Err(err) => return Err(err.into()),
        };
        if order.is_terminal() {
            return Ok(());
        }
        // Void any in-flight offer; the lease never changed order state.
        self.dispatch.void_order(id);

        let cancelled = self.store.terminate(id, OrderStatus::Cancelled).await?;
        if let Some(driver) = order.driver_id {
            let _ = self
                .state_machine
                .release_assignment(driver, &[id], order.load_kg, "order_cancelled")
                .await;
            self.optimize.request(driver, OptimizeReason::StopsChanged);
        }
        self.escalation.record_breach_if_late(&cancelled).await?;
        if let Some(batch_id) = order.batch_id {
            self.settle_batch(batch_id).await?;
        }
        log::info!("cancelled {}", id);
        Ok(())
    }

    async fn on_delivery_completed(
        &self,
        id: crate::models::OrderId,
        on_time: Option<bool>,
    ) -> Result<()> {
        let order = match self.store.order(id).await {
            Ok(order) => order,
            Err(StoreError::NotFound(what)) => return Err(anyhow!("unknown {}", what)),
            Err(err) => return Err(err.into()),
        };
        let driver = order
            .driver_id
            .ok_or_else(|| anyhow!("{} completed without a driver binding", id))?;
        let now = self.now.utc_now();

        // Tolerate a missed pickup event.
        if order.status == OrderStatus::Assigned {
            let _ = self.store.mark_picked_up(id, now).await;
        }
        let delivered = self.store.mark_delivered(id, now).await?;
        let on_time = on_time.unwrap_or(delivered.delivered_at.unwrap_or(now) <= delivered.sla_deadline);

        self.state_machine
            .complete_delivery(driver, id, order.load_kg, order.dropoff, on_time)
            .await?;
        self.bus.publish(OutboundEvent::OrderDelivered {
            order_id: id,
            on_time,
        });
        self.escalation.record_breach_if_late(&delivered).await?;
        if let Some(batch_id) = order.batch_id {
            self.settle_batch(batch_id).await?;
        }
        self.optimize.request(driver, OptimizeReason::StopsChanged);
        log::info!("{} delivered by {} (on time: {})", id, driver, on_time);
        Ok(())
    }

    /// Batch lifecycle maintenance at the order-status boundary: first
    /// delivery moves a batch IN_PROGRESS; once every member terminated the
    /// batch completes (or cancels when nothing was delivered).
    async fn settle_batch(&self, id: crate::models::BatchId) -> Result<()> {
        let batch: Batch = match self.store.batch(id).await {
            Ok(batch) => batch,
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if batch.status.is_terminal() {
            return Ok(());
        }
        let mut all_terminal = true;
        let mut any_delivered = false;
        for order_id in &batch.order_ids {
            match self.store.order(*order_id).await {
                Ok(order) => {
                    match order.status {
                        OrderStatus::Delivered => any_delivered = true,
                        OrderStatus::Cancelled | OrderStatus::Failed => {}
                        _ => all_terminal = false,
                    }
                }
                Err(_) => {}
            }
        }
        let next = if all_terminal {
            if any_delivered {
                Some(BatchStatus::Completed)
            } else {
                Some(BatchStatus::Cancelled)
            }
        } else if any_delivered && batch.status != BatchStatus::InProgress {
            Some(BatchStatus::InProgress)
        } else {
            None
        };
        if let Some(status) = next {
            self.store.set_batch_status(id, status).await?;
            if status == BatchStatus::Completed {
                self.bus
                    .publish(OutboundEvent::BatchCompleted { batch_id: id });
            }
            log::info!("batch {} is now {:?}", id, status);
        }
        Ok(())
    }

    /// Dispatch loop: one tick per `dispatch.tick_s`.
    pub async fn run_dispatch_loop(self: Arc<Self>) {
        while !self.is_stopping() {
            if let Err(err) = self.dispatch.tick().await {
                log::error!("dispatch tick failed: {:?}", err);
            }
            self.sleep.sleep(self.config.dispatch.tick).await;
        }
    }

    /// Batching loop: one tick per `batching.tick_s`.
    pub async fn run_batching_loop(self: Arc<Self>) {
        while !self.is_stopping() {
            if let Err(err) = self.batching.tick().await {
                log::error!("batching tick failed: {:?}", err);
            }
            self.sleep.sleep(self.config.batching.tick).await;
        }
    }

    /// Escalation loop: one tick per `escalation.tick_s`.
    pub async fn run_escalation_loop(self: Arc<Self>) {
        while !self.is_stopping() {
            if let Err(err) = self.escalation.tick().await {
                log::error!("escalation tick failed: {:?}", err);
            }
            self.sleep.sleep(self.config.escalation.tick).await;
        }
    }

    /// Periodic per-driver re-optimization loop.
    pub async fn run_route_periodic_loop(self: Arc<Self>) {
        while !self.is_stopping() {
            if let Err(err) = self.optimizer.periodic_pass().await {
                log::error!("periodic route pass failed: {:?}", err);
            }
            self.sleep.sleep(self.config.route.periodic_tick).await;
        }
    }

    /// Drains event-triggered optimization requests on the bounded worker
    /// pool. May be started once; later calls return immediately.
    pub async fn run_optimizer_workers(self: Arc<Self>) {
        let receiver = self.optimize_rx.lock().unwrap().take();
        match receiver {
            Some(receiver) => self.optimizer.clone().run_queue(receiver).await,
            None => log::warn!("optimizer workers already running"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierSpeeds;
    use crate::distance::HaversineEstimator;
    use crate::models::driver::test_util::create_driver_for_test;
    use crate::models::{Coordinate, DriverId, IncidentSeverity, OrderId, ServiceTier};
    use crate::util::test_util::{FakeNow, InstantSleep};
    use crate::util::{FutureWaitExt as _, Now as _};

    struct Fixture {
        engine: Arc<FleetEngine>,
        store: Arc<InMemoryStore>,
        now: Arc<FakeNow>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let now = Arc::new(FakeNow::default());
        let engine = FleetEngine::with_clock(
            FleetConfig::default(),
            store.clone(),
            Arc::new(HaversineEstimator::new(1.3, TierSpeeds::default())),
            Arc::new(FleetMetrics::default()),
            Arc::new(InstantSleep),
            now.clone(),
        )
        .unwrap();
        Fixture { engine, store, now }
    }

    fn new_order(id: u64) -> NewOrder {
        NewOrder {
            id: OrderId(id),
            service_tier: ServiceTier::Barq,
            pickup: Coordinate::new(24.7140, 46.6760),
            dropoff: Coordinate::new(24.7200, 46.6800),
            load_kg: 20.0,
            priority: 0,
            created_at: None,
            sla_deadline: None,
        }
    }

    #[test]
    fn order_created_is_dispatched_and_deadline_derived() {
        let fixture = fixture();
        fixture
            .store
            .upsert_driver(create_driver_for_test(1))
            .wait()
            .unwrap();

        fixture
            .engine
            .apply(InboundEvent::OrderCreated {
                order: new_order(1),
            })
            .wait()
            .unwrap();

        let order = fixture.store.order(OrderId(1)).wait().unwrap();
        assert_eq!(order.status, OrderStatus::Assigned);
        assert_eq!(order.driver_id, Some(DriverId(1)));
        // BARQ default SLA of one hour.
        assert_eq!(order.sla_deadline, order.created_at + chrono::Duration::hours(1));
    }

    #[test]
    fn malformed_order_is_rejected_without_state_change() {
        let fixture = fixture();
        let mut bad = new_order(1);
        bad.load_kg = -3.0;
        assert!(fixture
            .engine
            .apply(InboundEvent::OrderCreated { order: bad })
            .wait()
            .is_err());
        assert!(fixture.store.order(OrderId(1)).wait().is_err());

        let mut bad = new_order(2);
        bad.pickup = Coordinate::new(124.0, 46.0);
        assert!(fixture
            .engine
            .apply(InboundEvent::OrderCreated { order: bad })
            .wait()
            .is_err());
    }

    #[test]
    fn unknown_ids_are_rejected_at_the_boundary() {
        let fixture = fixture();
        assert!(fixture
            .engine
            .apply(InboundEvent::OrderCancelled { id: OrderId(9) })
            .wait()
            .is_err());
        assert!(fixture
            .engine
            .apply(InboundEvent::DriverLocation {
                driver_id: DriverId(9),
                location: Coordinate::new(24.7, 46.6),
                at: fixture.now.utc_now(),
            })
            .wait()
            .is_err());
    }

    #[test]
    fn delivery_completion_updates_driver_and_emits_event() {
        let fixture = fixture();
        fixture
            .store
            .upsert_driver(create_driver_for_test(1))
            .wait()
            .unwrap();
        let mut events = fixture.engine.bus().subscribe();

        fixture
            .engine
            .apply(InboundEvent::OrderCreated {
                order: new_order(1),
            })
            .wait()
            .unwrap();
        fixture
            .engine
            .apply(InboundEvent::DeliveryPickup {
                order_id: OrderId(1),
            })
            .wait()
            .unwrap();
        fixture
            .engine
            .apply(InboundEvent::DeliveryCompleted {
                order_id: OrderId(1),
                on_time: None,
            })
            .wait()
            .unwrap();

        let order = fixture.store.order(OrderId(1)).wait().unwrap();
        assert_eq!(order.status, OrderStatus::Delivered);
        assert_eq!(order.driver_id, None);
        let driver = fixture.store.driver(DriverId(1)).wait().unwrap();
        assert_eq!(driver.status, DriverStatus::Available);
        assert_eq!(driver.completed_today, 1);

        let mut saw_delivered = false;
        while let Ok(Some(event)) = events.try_next() {
            if let OutboundEvent::OrderDelivered { order_id, on_time } = event {
                assert_eq!(order_id, OrderId(1));
                assert!(on_time);
                saw_delivered = true;
            }
        }
        assert!(saw_delivered);
    }

    #[test]
    fn cancellation_releases_the_driver_and_settles_the_batch() {
        let fixture = fixture();
        fixture
            .store
            .upsert_driver(create_driver_for_test(1))
            .wait()
            .unwrap();
        fixture
            .engine
            .apply(InboundEvent::OrderCreated {
                order: new_order(1),
            })
            .wait()
            .unwrap();

        fixture
            .engine
            .apply(InboundEvent::OrderCancelled { id: OrderId(1) })
            .wait()
            .unwrap();

        let order = fixture.store.order(OrderId(1)).wait().unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.driver_id, None);
        let driver = fixture.store.driver(DriverId(1)).wait().unwrap();
        assert_eq!(driver.status, DriverStatus::Available);
        assert!(driver.active_order_ids.is_empty());
        // Idempotent.
        fixture
            .engine
            .apply(InboundEvent::OrderCancelled { id: OrderId(1) })
            .wait()
            .unwrap();
    }

    #[test]
    fn batch_lifecycle_follows_member_orders() {
        let fixture = fixture();
        // Two orders in a batch, no drivers so they stay pending.
        for id in 1..=2 {
            fixture
                .engine
                .apply(InboundEvent::OrderCreated {
                    order: new_order(id),
                })
                .wait()
                .unwrap();
        }
        let batch = fixture
            .store
            .create_batch(
                vec![OrderId(1), OrderId(2)],
                ServiceTier::Barq,
                fixture.now.utc_now(),
            )
            .wait()
            .unwrap();
        for id in 1..=2 {
            fixture.store.set_batch(OrderId(id), batch.id).wait().unwrap();
        }
        // A driver shows up and takes the batch.
        fixture
            .store
            .upsert_driver(create_driver_for_test(1))
            .wait()
            .unwrap();
        fixture.engine.dispatch().tick().wait().unwrap();
        assert_eq!(
            fixture.store.batch(batch.id).wait().unwrap().status,
            BatchStatus::Assigned
        );

        // First delivery moves the batch in progress.
        fixture
            .engine
            .apply(InboundEvent::DeliveryPickup {
                order_id: OrderId(1),
            })
            .wait()
            .unwrap();
        fixture
            .engine
            .apply(InboundEvent::DeliveryCompleted {
                order_id: OrderId(1),
                on_time: Some(true),
            })
            .wait()
            .unwrap();
        assert_eq!(
            fixture.store.batch(batch.id).wait().unwrap().status,
            BatchStatus::InProgress
        );

        // Cancelling the remaining member completes the batch.
        fixture
            .engine
            .apply(InboundEvent::OrderCancelled { id: OrderId(2) })
            .wait()
            .unwrap();
        assert_eq!(
            fixture.store.batch(batch.id).wait().unwrap().status,
            BatchStatus::Completed
        );
    }

    #[test]
    fn shift_events_drive_the_state_machine() {
        let fixture = fixture();
        let mut driver = create_driver_for_test(1);
        driver.status = DriverStatus::Offline;
        fixture.store.upsert_driver(driver).wait().unwrap();

        fixture
            .engine
            .apply(InboundEvent::DriverStatusEvent {
                driver_id: DriverId(1),
                kind: DriverStatusEventKind::ShiftStart,
            })
            .wait()
            .unwrap();
        assert_eq!(
            fixture.store.driver(DriverId(1)).wait().unwrap().status,
            DriverStatus::Available
        );

        // Break end while available is an invalid transition and is
        // reported, not silently applied.
        assert!(fixture
            .engine
            .apply(InboundEvent::DriverStatusEvent {
                driver_id: DriverId(1),
                kind: DriverStatusEventKind::BreakEnd,
            })
            .wait()
            .is_err());
    }

    #[test]
    fn traffic_incident_is_stored_and_resolvable() {
        let fixture = fixture();
        fixture
            .engine
            .apply(InboundEvent::TrafficIncidentReported {
                location: Coordinate::new(24.71, 46.67),
                severity: IncidentSeverity::High,
                kind: "accident".to_owned(),
                radius_m: 500.0,
            })
            .wait()
            .unwrap();
        let active = fixture.store.active_incidents().wait().unwrap();
        assert_eq!(active.len(), 1);

        fixture
            .engine
            .apply(InboundEvent::TrafficResolved {
                incident_id: active[0].id,
            })
            .wait()
            .unwrap();
        assert!(fixture.store.active_incidents().wait().unwrap().is_empty());

        // Zero radius is malformed.
        assert!(fixture
            .engine
            .apply(InboundEvent::TrafficIncidentReported {
                location: Coordinate::new(24.71, 46.67),
                severity: IncidentSeverity::Low,
                kind: "spill".to_owned(),
                radius_m: 0.0,
            })
            .wait()
            .is_err());
    }
}
