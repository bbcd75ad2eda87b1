//! The dispatch engine: matches pending orders (and pre-clustered batches)
//! to ready drivers with weighted scoring, offer leases, adaptive radius
//! widening and an SLA force-assign escape hatch.

pub mod offers;
pub mod scoring;

use self::offers::OfferBook;
use self::scoring::{rank_candidates, score_candidate, ScoreBreakdown};
use crate::config::{DispatchConfig, ScoreWeights};
use crate::events::{EventBus, OutboundEvent};
use crate::metrics::FleetMetrics;
use crate::models::{
    AssignmentKind, AssignmentLog, Batch, BatchId, BatchStatus, Coordinate, DispatchAlert,
    DispatchAlertType, Driver, DriverId, Order, OrderId, OrderStatus, ServiceTier, Severity,
};
use crate::routing::{OptimizeHandle, OptimizeReason};
use crate::state_machine::DriverStateMachine;
use crate::store::{
    with_retry, AuditJournal, Availability, BatchRepository, DriverRepository, OrderRepository,
    StoreError, StoreResult,
};
use crate::util::{AsyncSleeping, Now};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;

/// Terminal result of one dispatch attempt for a work item.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DispatchOutcome {
    Assigned {
        driver: DriverId,
    },
    /// An offer lease is open; resolution comes via event or expiry.
    OfferOpen {
        driver: DriverId,
    },
    /// No qualifying candidate; the order waits for the next tick.
    PendingDriver,
    /// The offer budget is exhausted.
    AllBusy,
    /// Another writer won the assignment race.
    Lost,
    /// The engine is in degraded read-only mode.
    Degraded,
    /// Nothing to do (stale work item or duplicate attempt).
    Skipped,
}

/// A unit of dispatch: either one order or a whole pending batch treated as a
/// single work item anchored at its first pickup.
#[derive(Clone, Debug)]
pub enum WorkItem {
    Single(Order),
    Batched { batch: Batch, orders: Vec<Order> },
}

impl WorkItem {
    /// The lead order, used as the key for offers and attempt counting.
    pub fn lead_order(&self) -> OrderId {
        match self {
            WorkItem::Single(order) => order.id,
            WorkItem::Batched { orders, .. } => orders[0].id,
        }
    }

    pub fn anchor(&self) -> Coordinate {
        match self {
            WorkItem::Single(order) => order.pickup,
            WorkItem::Batched { orders, .. } => orders[0].pickup,
        }
    }

    pub fn tier(&self) -> ServiceTier {
        match self {
            WorkItem::Single(order) => order.service_tier,
            WorkItem::Batched { batch, .. } => batch.service_tier,
        }
    }

    pub fn total_load_kg(&self) -> f64 {
        match self {
            WorkItem::Single(order) => order.load_kg,
            WorkItem::Batched { orders, .. } => orders.iter().map(|order| order.load_kg).sum(),
        }
    }

    pub fn order_ids(&self) -> Vec<OrderId> {
        match self {
            WorkItem::Single(order) => vec![order.id],
            WorkItem::Batched { orders, .. } => orders.iter().map(|order| order.id).collect(),
        }
    }

    pub fn earliest_deadline(&self) -> DateTime<Utc> {
        match self {
            WorkItem::Single(order) => order.sla_deadline,
            WorkItem::Batched { orders, .. } => orders
                .iter()
                .map(|order| order.sla_deadline)
                .min()
                .expect("batches are never empty"),
        }
    }

    pub fn batch_id(&self) -> Option<BatchId> {
        match self {
            WorkItem::Single(_) => None,
            WorkItem::Batched { batch, .. } => Some(batch.id),
        }
    }
}

pub struct DispatchEngine {
    orders: Arc<dyn OrderRepository>,
    drivers: Arc<dyn DriverRepository>,
    batches: Arc<dyn BatchRepository>,
    journal: Arc<dyn AuditJournal>,
    state_machine: Arc<DriverStateMachine>,
    offers: OfferBook,
    optimize: OptimizeHandle,
    bus: Arc<EventBus>,
    metrics: Arc<FleetMetrics>,
    availability: Arc<Availability>,
    sleep: Arc<dyn AsyncSleeping>,
    now: Arc<dyn Now>,
    config: DispatchConfig,
}

impl DispatchEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        drivers: Arc<dyn DriverRepository>,
        batches: Arc<dyn BatchRepository>,
        journal: Arc<dyn AuditJournal>,
        state_machine: Arc<DriverStateMachine>,
        optimize: OptimizeHandle,
        bus: Arc<EventBus>,
        metrics: Arc<FleetMetrics>,
        availability: Arc<Availability>,
        sleep: Arc<dyn AsyncSleeping>,
        now: Arc<dyn Now>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            orders,
            drivers,
            batches,
            journal,
            state_machine,
            offers: OfferBook::new(),
            optimize,
            bus,
            metrics,
            availability,
            sleep,
            now,
            config,
        }
    }

    pub fn offers(&self) -> &OfferBook {
        &self.offers
    }

    /// The scoring weights in effect, for callers that derive boosted
    /// variants (reassignment).
    pub fn weights(&self) -> ScoreWeights {
        self.config.weights
    }

    /// One dispatch pass: expires due offers, gathers pending work (batches
    /// first, then loose orders) and attempts each item once.
    pub async fn tick(&self) -> Result<()> {
        if self.availability.is_degraded() {
            self.metrics.dispatch_outcome("degraded");
            return Ok(());
        }
        let now = self.now.utc_now();
        self.offers.prune(now);
        for offer in self.offers.expire_due(now) {
            log::info!(
                "offer for {} to {} expired, cooling the driver down",
                offer.order,
                offer.driver,
            );
            self.metrics.offer_resolved("expired");
            self.offers.set_cooldown(
                offer.order,
                offer.driver,
                now + chrono::Duration::from_std(self.config.offer_cooldown).unwrap_or_else(
                    |_| chrono::Duration::seconds(60),
                ),
            );
        }

        let items = self.pending_work().await?;
        self.metrics.set_pending_orders(
            items
                .iter()
                .map(|item| item.order_ids().len())
                .sum::<usize>(),
        );
        for item in items {
            if let Err(err) = self.dispatch_work(&item).await {
                log::error!(
                    "dispatch of {} failed fatally: {:?}",
                    item.lead_order(),
                    err
                );
            }
        }
        Ok(())
    }

    /// Collects dispatchable work. Orders already claimed by a pending batch
    /// ride along with the batch; orders with open offers are skipped.
    async fn pending_work(&self) -> Result<Vec<WorkItem>> {
        let mut items = Vec::new();
        let mut covered: HashSet<OrderId> = HashSet::new();

        let batches = self
            .retry(|| self.batches.pending_batches())
            .await?;
        for batch in batches {
            let mut members = Vec::new();
            for id in &batch.order_ids {
                if let Ok(order) = self.orders.order(*id).await {
                    if order.is_unassigned() {
                        members.push(order);
                    }
                }
            }
            if members.is_empty() {
                continue;
            }
            covered.extend(members.iter().map(|order| order.id));
            items.push(WorkItem::Batched {
                batch,
                orders: members,
            });
        }

        let orders = self
            .retry(|| {
                self.orders
                    .orders_with_status(vec![OrderStatus::Pending, OrderStatus::PendingDriver])
            })
            .await?;
        for order in orders {
            // Orders riding in a pending batch are handled above; a stale
            // link to a finished batch falls through to single dispatch.
            if covered.contains(&order.id) || self.offers.open_offer(order.id).is_some() {
                continue;
            }
            items.push(WorkItem::Single(order));
        }
        Ok(items)
    }

    /// Builds the work item for one order and dispatches it. Entry point for
    /// the `order.created` event.
    pub async fn dispatch_order(&self, id: OrderId) -> Result<DispatchOutcome> {
        if self.availability.is_degraded() {
            return Ok(DispatchOutcome::Degraded);
        }
        let order = match self.retry(|| self.orders.order(id)).await {
            Ok(order) => order,
            Err(StoreError::NotFound(_)) => return Ok(DispatchOutcome::Skipped),
            Err(err) => return Err(err.into()),
        };
        if !order.is_unassigned() {
            return Ok(DispatchOutcome::Skipped);
        }
        let item = match order.batch_id {
            Some(batch_id) => match self.batch_work_item(batch_id).await? {
                Some(item) => item,
                None => WorkItem::Single(order),
            },
            None => WorkItem::Single(order),
        };
        self.dispatch_work(&item).await
    }

    /// Force-assign entry point used by the escalation engine when the SLA
    /// window is nearly closed: `min_score` is bypassed.
    pub async fn force_assign(&self, id: OrderId) -> Result<DispatchOutcome> {
        if self.availability.is_degraded() {
            return Ok(DispatchOutcome::Degraded);
        }
        let order = match self.retry(|| self.orders.order(id)).await {
            Ok(order) => order,
            Err(StoreError::NotFound(_)) => return Ok(DispatchOutcome::Skipped),
            Err(err) => return Err(err.into()),
        };
        if !order.is_unassigned() {
            return Ok(DispatchOutcome::Skipped);
        }
        self.offers.clear_order(id);
        self.attempt(&WorkItem::Single(order), true).await
    }

    /// Picks the best candidate for arbitrary work with custom weights.
    /// Shared with the escalation engine for reassignment selection.
    pub async fn best_candidate(
        &self,
        anchor: Coordinate,
        tier: ServiceTier,
        load_kg: f64,
        exclude: Option<DriverId>,
        weights: &ScoreWeights,
    ) -> Result<Option<(Driver, ScoreBreakdown)>> {
        let drivers = self.retry(|| self.drivers.drivers()).await?;
        Ok(self.select(
            &drivers,
            anchor,
            tier,
            load_kg,
            None,
            exclude,
            weights,
            true,
        ))
    }

    async fn batch_work_item(&self, id: BatchId) -> Result<Option<WorkItem>> {
        let batch = match self.batches.batch(id).await {
            Ok(batch) => batch,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if batch.status != BatchStatus::Pending {
            return Ok(None);
        }
        let mut members = Vec::new();
        for order_id in &batch.order_ids {
            if let Ok(order) = self.orders.order(*order_id).await {
                if order.is_unassigned() {
                    members.push(order);
                }
            }
        }
        if members.is_empty() {
            return Ok(None);
        }
        Ok(Some(WorkItem::Batched {
            batch,
            orders: members,
        }))
    }

    async fn dispatch_work(&self, item: &WorkItem) -> Result<DispatchOutcome> {
        let now = self.now.utc_now();
        let force = item.earliest_deadline() - now
            < chrono::Duration::from_std(self.config.force_threshold)
                .unwrap_or_else(|_| chrono::Duration::minutes(15));
        self.attempt(item, force).await
    }

    /// One offer attempt: candidate selection with radius widening, then an
    /// offer lease (committed immediately under auto-accept).
    async fn attempt(&self, item: &WorkItem, force: bool) -> Result<DispatchOutcome> {
        if self.offers.open_offer(item.lead_order()).is_some() {
            return Ok(DispatchOutcome::Skipped);
        }

        let drivers = self.retry(|| self.drivers.drivers()).await?;
        let selected = self.select(
            &drivers,
            item.anchor(),
            item.tier(),
            item.total_load_kg(),
            Some(item.lead_order()),
            None,
            &self.config.weights,
            force,
        );
        let (driver, breakdown) = match selected {
            Some(found) => found,
            None => return self.park_pending(item).await,
        };

        let attempts = self.offers.record_attempt(item.lead_order());
        if attempts > self.config.max_offers_per_order {
            return self.give_up_all_busy(item).await;
        }

        let now = self.now.utc_now();
        if !self.offers.try_hold(
            item.lead_order(),
            driver.id,
            breakdown,
            now,
            self.config.offer_timeout,
        ) {
            return Ok(DispatchOutcome::Skipped);
        }
        log::info!(
            "offering {} to {} (score {:.3}{})",
            item.lead_order(),
            driver.id,
            breakdown.total,
            if force { ", forced" } else { "" },
        );

        if self.config.auto_accept_offers {
            self.accept_offer(item, driver.id, force).await
        } else {
            Ok(DispatchOutcome::OfferOpen { driver: driver.id })
        }
    }

    /// Candidate filter plus scoring at growing radii. Returns the ranked
    /// best qualifying candidate, or with `force` the best candidate at the
    /// widest radius regardless of `min_score`.
    #[allow(clippy::too_many_arguments)]
    fn select(
        &self,
        drivers: &[Driver],
        anchor: Coordinate,
        tier: ServiceTier,
        load_kg: f64,
        offer_key: Option<OrderId>,
        exclude: Option<DriverId>,
        weights: &ScoreWeights,
        force: bool,
    ) -> Option<(Driver, ScoreBreakdown)> {
        let now = self.now.utc_now();
        let max_radius = self.config.radius_km * 3.0;
        let mut radius = self.config.radius_km;

        loop {
            let mut candidates: Vec<(Driver, ScoreBreakdown)> = drivers
                .iter()
                .filter(|driver| Some(driver.id) != exclude)
                .filter(|driver| self.state_machine.can_accept(driver))
                .filter(|driver| driver.serves(tier))
                .filter(|driver| driver.remaining_capacity_kg() >= load_kg)
                .filter(|driver| !self.offers.driver_held(driver.id))
                .filter(|driver| match offer_key {
                    Some(order) => !self.offers.in_cooldown(order, driver.id, now),
                    None => true,
                })
                .filter_map(|driver| {
                    let distance = anchor.haversine_km(&driver.current_location);
                    if distance > radius {
                        return None;
                    }
                    let breakdown = score_candidate(
                        driver,
                        anchor,
                        distance,
                        radius,
                        self.config.zone_radius_km,
                        weights,
                    );
                    Some((driver.clone(), breakdown))
                })
                .collect();
            rank_candidates(&mut candidates);

            if let Some((_, breakdown)) = candidates.first() {
                if breakdown.total >= self.config.min_score {
                    return candidates.into_iter().next();
                }
            }

            if radius >= max_radius {
                if force {
                    return candidates.into_iter().next();
                }
                log::debug!(
                    "radius widening exhausted at {:.1}km with no qualifying candidate",
                    radius,
                );
                return None;
            }
            radius = (radius * 1.5).min(max_radius);
            self.metrics.radius_widened();
        }
    }

    /// Resolves an open offer into a committed assignment.
    async fn accept_offer(
        &self,
        item: &WorkItem,
        driver: DriverId,
        force: bool,
    ) -> Result<DispatchOutcome> {
        let offer = match self.offers.resolve(item.lead_order(), driver) {
            Some(offer) => offer,
            None => return Ok(DispatchOutcome::Skipped),
        };
        self.metrics.offer_resolved("accepted");
        let kind = if force {
            AssignmentKind::ForceAssigned
        } else {
            AssignmentKind::Normal
        };
        self.commit(item, driver, offer.score, kind).await
    }

    /// All-or-nothing assignment commit: order CAS writes, the driver state
    /// transition, batch bookkeeping and the audit rows either all land or
    /// are compensated.
    async fn commit(
        &self,
        item: &WorkItem,
        driver: DriverId,
        score: ScoreBreakdown,
        kind: AssignmentKind,
    ) -> Result<DispatchOutcome> {
        let now = self.now.utc_now();
        let ids = item.order_ids();

        let mut claimed: Vec<OrderId> = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.retry(|| self.orders.try_assign(*id, driver, now)).await {
                Ok(_) => claimed.push(*id),
                Err(err) => {
                    self.roll_back_orders(&claimed).await;
                    if err.is_conflict() {
                        log::info!("lost the assignment race for {}: {}", id, err);
                        return Ok(DispatchOutcome::Lost);
                    }
                    return Err(err.into());
                }
            }
        }

        let reason = match kind {
            AssignmentKind::ForceAssigned => "force_assigned: SLA window nearly closed",
            _ => "order_assigned",
        };
        if let Err(err) = self
            .state_machine
            .commit_assignment(driver, &ids, item.total_load_kg(), reason)
            .await
        {
            log::warn!(
                "driver {} could not take {}; rolling back: {:?}",
                driver,
                item.lead_order(),
                err
            );
            self.roll_back_orders(&claimed).await;
            return Ok(DispatchOutcome::Lost);
        }

        if let Some(batch_id) = item.batch_id() {
            let _ = self.batches.set_batch_driver(batch_id, Some(driver)).await;
            let _ = self
                .batches
                .set_batch_status(batch_id, BatchStatus::Assigned)
                .await;
        }

        for id in &ids {
            let log_row = AssignmentLog {
                order_id: *id,
                driver_id: driver,
                kind,
                proximity_score: score.proximity,
                performance_score: score.performance,
                capacity_score: score.capacity,
                zone_score: score.zone,
                total_score: score.total,
                reason: reason.to_owned(),
                at: now,
            };
            if let Err(err) = self.journal.record_assignment(log_row).await {
                log::warn!("failed to append assignment log for {}: {:?}", id, err);
            }
            self.bus.publish(OutboundEvent::OrderAssigned {
                order_id: *id,
                driver_id: driver,
                score: score.total,
            });
            self.offers.clear_order(*id);
        }
        self.offers.clear_order(item.lead_order());
        self.metrics.assignment_committed(kind);
        self.metrics.dispatch_outcome("assigned");
        self.optimize.request(driver, OptimizeReason::StopsChanged);

        log::info!(
            "assigned {} order(s) led by {} to {} with score {:.3} ({:?})",
            ids.len(),
            item.lead_order(),
            driver,
            score.total,
            kind,
        );
        Ok(DispatchOutcome::Assigned { driver })
    }

    async fn roll_back_orders(&self, claimed: &[OrderId]) {
        for id in claimed {
            if let Err(err) = self.orders.return_to_pool(*id).await {
                log::error!("failed to roll back assignment of {}: {:?}", id, err);
            }
        }
    }

    /// Marks the work item `pending_driver` and raises the NO_DRIVERS alert.
    async fn park_pending(&self, item: &WorkItem) -> Result<DispatchOutcome> {
        for id in item.order_ids() {
            let _ = self.retry(|| self.orders.set_pending_driver(id)).await;
            self.bus
                .publish(OutboundEvent::OrderPendingDriver { order_id: id });
        }
        self.metrics.dispatch_outcome("pending_driver");
        self.raise_alert(
            Severity::High,
            DispatchAlertType::NoDrivers,
            Some(item.lead_order()),
            format!(
                "no qualifying driver for {} within {:.0}km",
                item.lead_order(),
                self.config.radius_km * 3.0,
            ),
        )
        .await;
        Ok(DispatchOutcome::PendingDriver)
    }

    async fn give_up_all_busy(&self, item: &WorkItem) -> Result<DispatchOutcome> {
        for id in item.order_ids() {
            let _ = self.retry(|| self.orders.set_pending_driver(id)).await;
        }
        self.metrics.dispatch_outcome("all_busy");
        self.raise_alert(
            Severity::High,
            DispatchAlertType::AllBusy,
            Some(item.lead_order()),
            format!(
                "{} offers for {} were rejected or expired",
                self.config.max_offers_per_order,
                item.lead_order(),
            ),
        )
        .await;
        Ok(DispatchOutcome::AllBusy)
    }

    /// Resolves an inbound offer response. Rejection cools the driver down
    /// and immediately retries dispatch.
    pub async fn handle_offer_response(
        &self,
        order: OrderId,
        driver: DriverId,
        accepted: bool,
    ) -> Result<DispatchOutcome> {
        if accepted {
            let item = match self.work_item_for(order).await? {
                Some(item) => item,
                None => return Ok(DispatchOutcome::Skipped),
            };
            let now = self.now.utc_now();
            let force = item.earliest_deadline() - now
                < chrono::Duration::from_std(self.config.force_threshold)
                    .unwrap_or_else(|_| chrono::Duration::minutes(15));
            self.accept_offer(&item, driver, force).await
        } else {
            if self.offers.resolve(order, driver).is_none() {
                return Ok(DispatchOutcome::Skipped);
            }
            self.metrics.offer_resolved("rejected");
            let now = self.now.utc_now();
            self.offers.set_cooldown(
                order,
                driver,
                now + chrono::Duration::from_std(self.config.offer_cooldown)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            );
            self.dispatch_order(order).await
        }
    }

    /// Voids any offer state for an order that terminated externally.
    pub fn void_order(&self, order: OrderId) {
        self.offers.clear_order(order);
    }

    async fn work_item_for(&self, order: OrderId) -> Result<Option<WorkItem>> {
        let order = match self.orders.order(order).await {
            Ok(order) => order,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if !order.is_unassigned() {
            return Ok(None);
        }
        if let Some(batch_id) = order.batch_id {
            if let Some(item) = self.batch_work_item(batch_id).await? {
                return Ok(Some(item));
            }
        }
        Ok(Some(WorkItem::Single(order)))
    }

    async fn raise_alert(
        &self,
        severity: Severity,
        alert_type: DispatchAlertType,
        order: Option<OrderId>,
        message: String,
    ) {
        log::warn!("dispatch alert {} ({}): {}", alert_type, severity, message);
        let alert = DispatchAlert {
            severity,
            alert_type,
            order_id: order,
            message,
            at: self.now.utc_now(),
        };
        if let Err(err) = self.journal.record_dispatch_alert(alert).await {
            log::warn!("failed to append dispatch alert: {:?}", err);
        }
        self.bus.publish(OutboundEvent::DispatchAlertRaised {
            severity,
            alert_type,
            order_id: order,
        });
    }

    async fn retry<T, Fut>(&self, operation: impl FnMut() -> Fut) -> StoreResult<T>
    where
        Fut: std::future::Future<Output = StoreResult<T>>,
    {
        let result = with_retry(self.sleep.as_ref(), &self.availability, operation).await;
        self.metrics.set_degraded(self.availability.is_degraded());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriverCaps, FleetConfig};
    use crate::models::driver::test_util::create_driver_for_test;
    use crate::models::order::test_util::create_order_for_test;
    use crate::routing::optimize_channel;
    use crate::store::{DriverLockRegistry, InMemoryStore};
    use crate::util::test_util::{FakeNow, InstantSleep};
    use crate::util::{FutureWaitExt as _, Now as _};
    use futures::channel::mpsc::UnboundedReceiver;
    use crate::routing::OptimizeRequest;

    struct Fixture {
        engine: DispatchEngine,
        store: Arc<InMemoryStore>,
        now: Arc<FakeNow>,
        optimize_rx: UnboundedReceiver<OptimizeRequest>,
    }

    fn fixture() -> Fixture {
        fixture_with(DispatchConfig::default())
    }

    fn fixture_with(config: DispatchConfig) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let now = Arc::new(FakeNow::default());
        let bus = Arc::new(EventBus::new());
        let machine = Arc::new(DriverStateMachine::new(
            store.clone(),
            store.clone(),
            Arc::new(DriverLockRegistry::new()),
            bus.clone(),
            DriverCaps::default(),
            now.clone(),
        ));
        let (optimize, optimize_rx) = optimize_channel();
        let engine = DispatchEngine::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            machine,
            optimize,
            bus,
            Arc::new(FleetMetrics::default()),
            Arc::new(Availability::new(FleetConfig::default().unavailable_threshold)),
            Arc::new(InstantSleep),
            now.clone(),
            config,
        );
        Fixture {
            engine,
            store,
            now,
            optimize_rx,
        }
    }

    fn seed_order(store: &InMemoryStore, order: Order) {
        store.create_order(order).wait().unwrap();
    }

    fn seed_driver(store: &InMemoryStore, driver: Driver) {
        store.upsert_driver(driver).wait().unwrap();
    }

    #[test]
    fn happy_path_assigns_best_driver() {
        let mut fixture = fixture();
        let mut order = create_order_for_test(1);
        order.load_kg = 20.0;
        fixture.now.set(order.created_at);
        seed_order(&fixture.store, order);
        let mut driver = create_driver_for_test(1);
        driver.completed_today = 3;
        seed_driver(&fixture.store, driver);

        let outcome = fixture.engine.dispatch_order(OrderId(1)).wait().unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Assigned {
                driver: DriverId(1)
            }
        );

        let order = fixture.store.order(OrderId(1)).wait().unwrap();
        assert_eq!(order.status, OrderStatus::Assigned);
        assert_eq!(order.driver_id, Some(DriverId(1)));

        let driver = fixture.store.driver(DriverId(1)).wait().unwrap();
        assert_eq!(driver.active_order_ids, vec![OrderId(1)]);

        let logs = fixture.store.assignments().wait();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, AssignmentKind::Normal);
        assert!(logs[0].total_score >= 0.85 && logs[0].total_score <= 1.0);

        // The route optimizer was triggered for the driver.
        let request = fixture.optimize_rx.try_next().unwrap().unwrap();
        assert_eq!(request.driver, DriverId(1));
        assert_eq!(request.reason, OptimizeReason::StopsChanged);
    }

    #[test]
    fn empty_pool_parks_order_with_high_alert() {
        let fixture = fixture();
        let order = create_order_for_test(1);
        fixture.now.set(order.created_at);
        seed_order(&fixture.store, order);

        let outcome = fixture.engine.dispatch_order(OrderId(1)).wait().unwrap();
        assert_eq!(outcome, DispatchOutcome::PendingDriver);

        let order = fixture.store.order(OrderId(1)).wait().unwrap();
        assert_eq!(order.status, OrderStatus::PendingDriver);
        assert_eq!(order.driver_id, None);

        let alerts = fixture.store.dispatch_alerts().wait();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, DispatchAlertType::NoDrivers);
        assert_eq!(alerts[0].severity, Severity::High);
        // No driver rows were touched.
        assert!(fixture.store.state_changes().wait().is_empty());
    }

    #[test]
    fn score_exactly_min_score_is_assigned() {
        let mut config = DispatchConfig::default();
        // Weights concentrated on performance make the total easy to pin:
        // total == on_time_rate == 0.90 == min_score.
        config.weights = ScoreWeights {
            proximity: 0.0,
            performance: 1.0,
            capacity: 0.0,
            zone: 0.0,
        };
        config.min_score = 0.90;
        let fixture = fixture_with(config);
        let order = create_order_for_test(1);
        fixture.now.set(order.created_at);
        seed_order(&fixture.store, order);
        let mut driver = create_driver_for_test(1);
        driver.on_time_rate = 0.90;
        seed_driver(&fixture.store, driver);

        // Assignment happens on >=, not >.
        let outcome = fixture.engine.dispatch_order(OrderId(1)).wait().unwrap();
        assert!(matches!(outcome, DispatchOutcome::Assigned { .. }));
    }

    #[test]
    fn force_assign_bypasses_min_score() {
        let mut config = DispatchConfig::default();
        config.weights = ScoreWeights {
            proximity: 0.0,
            performance: 1.0,
            capacity: 0.0,
            zone: 0.0,
        };
        // Above any achievable total, so only force mode can assign.
        config.min_score = 0.95;
        let fixture = fixture_with(config);
        let mut order = create_order_for_test(1);
        // Ten minutes of SLA left puts the order in the force window.
        order.sla_deadline = order.created_at + chrono::Duration::minutes(10);
        fixture.now.set(order.created_at);
        seed_order(&fixture.store, order);
        let mut driver = create_driver_for_test(1);
        driver.on_time_rate = 0.91;
        seed_driver(&fixture.store, driver);

        let outcome = fixture.engine.dispatch_order(OrderId(1)).wait().unwrap();
        assert!(matches!(outcome, DispatchOutcome::Assigned { .. }));

        let logs = fixture.store.assignments().wait();
        assert_eq!(logs[0].kind, AssignmentKind::ForceAssigned);
        assert!(logs[0].reason.contains("SLA"));
    }

    #[test]
    fn degraded_mode_makes_no_assignments() {
        let fixture = fixture();
        let availability = Availability::new(1);
        availability.observe::<()>(&Err(StoreError::Unavailable("down".into())));
        assert!(availability.is_degraded());

        let engine = DispatchEngine {
            availability: Arc::new(availability),
            ..fixture.engine
        };
        seed_order(&fixture.store, create_order_for_test(1));
        let outcome = engine.dispatch_order(OrderId(1)).wait().unwrap();
        assert_eq!(outcome, DispatchOutcome::Degraded);
    }

    #[test]
    fn duplicate_dispatch_is_idempotent() {
        let fixture = fixture();
        let order = create_order_for_test(1);
        fixture.now.set(order.created_at);
        seed_order(&fixture.store, order);
        seed_driver(&fixture.store, create_driver_for_test(1));

        let first = fixture.engine.dispatch_order(OrderId(1)).wait().unwrap();
        assert!(matches!(first, DispatchOutcome::Assigned { .. }));
        // Replaying the event does not double-assign.
        let second = fixture.engine.dispatch_order(OrderId(1)).wait().unwrap();
        assert_eq!(second, DispatchOutcome::Skipped);
        assert_eq!(fixture.store.assignments().wait().len(), 1);
    }

    #[test]
    fn offer_flow_without_auto_accept_rejection_cools_driver() {
        let mut config = DispatchConfig::default();
        config.auto_accept_offers = false;
        let fixture = fixture_with(config);
        let order = create_order_for_test(1);
        fixture.now.set(order.created_at);
        seed_order(&fixture.store, order);
        seed_driver(&fixture.store, create_driver_for_test(1));
        seed_driver(&fixture.store, {
            let mut far = create_driver_for_test(2);
            far.current_location = Coordinate::new(24.76, 46.72);
            far
        });

        let outcome = fixture.engine.dispatch_order(OrderId(1)).wait().unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::OfferOpen {
                driver: DriverId(1)
            }
        );
        // The order is leased: nothing else may be offered to driver 1.
        assert!(fixture.engine.offers().driver_held(DriverId(1)));

        // Driver rejects; the next best candidate gets the follow-up offer.
        let outcome = fixture
            .engine
            .handle_offer_response(OrderId(1), DriverId(1), false)
            .wait()
            .unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::OfferOpen {
                driver: DriverId(2)
            }
        );
        assert!(fixture
            .engine
            .offers()
            .in_cooldown(OrderId(1), DriverId(1), fixture.now.utc_now()));
    }

    #[test]
    fn expired_offer_is_treated_as_rejection() {
        let mut config = DispatchConfig::default();
        config.auto_accept_offers = false;
        let fixture = fixture_with(config);
        let order = create_order_for_test(1);
        fixture.now.set(order.created_at);
        seed_order(&fixture.store, order);
        seed_driver(&fixture.store, create_driver_for_test(1));

        fixture.engine.dispatch_order(OrderId(1)).wait().unwrap();
        // Exactly the timeout elapses.
        fixture.now.advance(chrono::Duration::seconds(30));
        fixture.engine.tick().wait().unwrap();

        assert!(!fixture.engine.offers().driver_held(DriverId(1)));
        assert!(fixture
            .engine
            .offers()
            .in_cooldown(OrderId(1), DriverId(1), fixture.now.utc_now()));
        // The driver was never charged a consecutive delivery.
        let driver = fixture.store.driver(DriverId(1)).wait().unwrap();
        assert_eq!(driver.consecutive_deliveries, 0);
    }

    #[test]
    fn offer_budget_exhaustion_raises_all_busy() {
        let mut config = DispatchConfig::default();
        config.auto_accept_offers = false;
        config.max_offers_per_order = 2;
        // Cooldown longer than the test horizon keeps rejecting drivers out.
        config.offer_cooldown = std::time::Duration::from_secs(3600);
        let fixture = fixture_with(config);
        let order = create_order_for_test(1);
        fixture.now.set(order.created_at);
        seed_order(&fixture.store, order);
        for id in 1..=3 {
            seed_driver(&fixture.store, create_driver_for_test(id));
        }

        fixture.engine.dispatch_order(OrderId(1)).wait().unwrap();
        fixture
            .engine
            .handle_offer_response(OrderId(1), DriverId(1), false)
            .wait()
            .unwrap();
        let outcome = fixture
            .engine
            .handle_offer_response(OrderId(1), DriverId(2), false)
            .wait()
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::AllBusy);

        let alerts = fixture.store.dispatch_alerts().wait();
        assert!(alerts
            .iter()
            .any(|alert| alert.alert_type == DispatchAlertType::AllBusy));
    }

    #[test]
    fn batch_dispatches_as_single_unit() {
        let fixture = fixture();
        let mut ids = Vec::new();
        for id in 1..=3 {
            let mut order = create_order_for_test(id);
            order.load_kg = 60.0;
            fixture.now.set(order.created_at);
            seed_order(&fixture.store, order);
            ids.push(OrderId(id));
        }
        let batch = fixture
            .store
            .create_batch(ids.clone(), ServiceTier::Barq, fixture.now.utc_now())
            .wait()
            .unwrap();
        for id in &ids {
            fixture.store.set_batch(*id, batch.id).wait().unwrap();
        }
        seed_driver(&fixture.store, create_driver_for_test(1));

        fixture.engine.tick().wait().unwrap();

        for id in &ids {
            let order = fixture.store.order(*id).wait().unwrap();
            assert_eq!(order.status, OrderStatus::Assigned);
            assert_eq!(order.driver_id, Some(DriverId(1)));
        }
        let stored = fixture.store.batch(batch.id).wait().unwrap();
        assert_eq!(stored.status, BatchStatus::Assigned);
        assert_eq!(stored.driver_id, Some(DriverId(1)));
        let driver = fixture.store.driver(DriverId(1)).wait().unwrap();
        assert_eq!(driver.active_order_ids.len(), 3);
        assert!((driver.assigned_load_kg - 180.0).abs() < 1e-9);
    }

    #[test]
    fn capacity_filter_excludes_overloaded_drivers() {
        let fixture = fixture();
        let mut order = create_order_for_test(1);
        order.load_kg = 500.0;
        fixture.now.set(order.created_at);
        seed_order(&fixture.store, order);
        let mut small = create_driver_for_test(1);
        small.capacity_kg = 100.0;
        seed_driver(&fixture.store, small);

        let outcome = fixture.engine.dispatch_order(OrderId(1)).wait().unwrap();
        assert_eq!(outcome, DispatchOutcome::PendingDriver);
    }
}
