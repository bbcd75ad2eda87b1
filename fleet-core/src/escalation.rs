//! Autonomous monitoring and recovery of at-risk orders: SLA risk
//! escalation, stuck and unresponsive driver detection, reassignment with a
//! per-order cap, failed-delivery recovery and breach penalty accounting.
//! Every (order, type) pair is debounced so storms do not duplicate.

use crate::config::EscalationConfig;
use crate::dispatch::scoring::boosted_weights;
use crate::dispatch::{DispatchEngine, DispatchOutcome};
use crate::events::{EventBus, OutboundEvent};
use crate::metrics::FleetMetrics;
use crate::models::{
    DispatchAlert, DispatchAlertType, DriverId, EscalationLog, EscalationType, FailureCategory,
    Order, OrderAlert, OrderId, OrderStatus, ReassignmentEvent, Severity, SlaBreach,
};
use crate::routing::{OptimizeHandle, OptimizeReason};
use crate::state_machine::DriverStateMachine;
use crate::store::{
    with_retry, AuditJournal, Availability, DriverRepository, IncidentRepository, OrderRepository,
    RouteRepository, StoreError, StoreResult,
};
use crate::util::{AsyncSleeping, Now};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

/// What the engine does about a failed delivery, chosen by failure category.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecoveryAction {
    /// The driver retries on the spot.
    ImmediateRetry,
    /// The order goes back into the dispatch pool for a later attempt.
    ScheduleRetry,
    /// Operations reach out before anything else happens.
    ContactCustomer,
}

/// Failure category to recovery action mapping.
pub fn recovery_for(category: FailureCategory) -> RecoveryAction {
    match category {
        FailureCategory::CustomerUnavailable => RecoveryAction::ImmediateRetry,
        FailureCategory::WrongAddress => RecoveryAction::ContactCustomer,
        FailureCategory::AccessRestricted => RecoveryAction::ScheduleRetry,
        FailureCategory::DamagedParcel => RecoveryAction::ContactCustomer,
        FailureCategory::Other => RecoveryAction::ScheduleRetry,
    }
}

/// Penalty for terminating `breach_min` minutes past the deadline: one base
/// unit per started 15 minutes, capped at ten units.
pub fn breach_penalty(base: f64, breach_min: f64) -> f64 {
    let units = (breach_min / 15.0).ceil().max(1.0);
    (base * units).min(base * 10.0)
}

pub struct EscalationEngine {
    orders: Arc<dyn OrderRepository>,
    drivers: Arc<dyn DriverRepository>,
    routes: Arc<dyn RouteRepository>,
    incidents: Arc<dyn IncidentRepository>,
    journal: Arc<dyn AuditJournal>,
    state_machine: Arc<DriverStateMachine>,
    dispatch: Arc<DispatchEngine>,
    optimize: OptimizeHandle,
    bus: Arc<EventBus>,
    metrics: Arc<FleetMetrics>,
    availability: Arc<Availability>,
    sleep: Arc<dyn AsyncSleeping>,
    now: Arc<dyn Now>,
    config: EscalationConfig,
    /// Last firing time per (order, type); repeats inside the window are
    /// suppressed.
    debounce: Mutex<HashMap<(OrderId, EscalationType), DateTime<Utc>>>,
    /// Whether a candidate existed at the last SLA risk firing, feeding the
    /// `preventable` flag of a later breach record.
    risk_opportunity: Mutex<HashMap<OrderId, bool>>,
}

impl EscalationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        drivers: Arc<dyn DriverRepository>,
        routes: Arc<dyn RouteRepository>,
        incidents: Arc<dyn IncidentRepository>,
        journal: Arc<dyn AuditJournal>,
        state_machine: Arc<DriverStateMachine>,
        dispatch: Arc<DispatchEngine>,
        optimize: OptimizeHandle,
        bus: Arc<EventBus>,
        metrics: Arc<FleetMetrics>,
        availability: Arc<Availability>,
        sleep: Arc<dyn AsyncSleeping>,
        now: Arc<dyn Now>,
        config: EscalationConfig,
    ) -> Self {
        Self {
            orders,
            drivers,
            routes,
            incidents,
            journal,
            state_machine,
            dispatch,
            optimize,
            bus,
            metrics,
            availability,
            sleep,
            now,
            config,
            debounce: Mutex::new(HashMap::new()),
            risk_opportunity: Mutex::new(HashMap::new()),
        }
    }

    /// One escalation pass over every non-terminal order, plus the fleet
    /// consistency sweep. In degraded mode only alerts are raised; no
    /// reassignment or force-assignment happens.
    pub async fn tick(&self) -> Result<()> {
        let orders = self
            .retry(|| {
                self.orders.orders_with_status(vec![
                    OrderStatus::Pending,
                    OrderStatus::PendingDriver,
                    OrderStatus::Assigned,
                    OrderStatus::PickedUp,
                ])
            })
            .await?;

        for order in orders {
            if let Err(err) = self.evaluate(&order).await {
                log::error!("escalation evaluation for {} failed: {:?}", order.id, err);
            }
        }

        self.expire_stale_incidents().await;
        self.consistency_sweep().await;
        self.publish_state_gauges().await;
        Ok(())
    }

    async fn evaluate(&self, order: &Order) -> Result<()> {
        let now = self.now.utc_now();
        let remaining = order.remaining_sla(now);

        if remaining < Duration::zero() {
            if self.retry(|| self.orders.latch_sla_breach(order.id)).await? {
                self.bus.publish(OutboundEvent::SlaAlert {
                    order_id: order.id,
                    level: Severity::Critical,
                });
            }
        }

        match order.status {
            OrderStatus::Pending | OrderStatus::PendingDriver => {
                let critical =
                    Duration::from_std(self.config.critical_window).unwrap_or_else(|_| Duration::minutes(15));
                if remaining < critical {
                    self.escalate_unassigned_at_risk(order).await?;
                }
            }
            OrderStatus::Assigned => {
                if self.driver_unresponsive(order, now).await? {
                    self.escalate_unresponsive(order).await?;
                } else {
                    let window = Duration::from_std(self.config.assigned_window)
                        .unwrap_or_else(|_| Duration::minutes(10));
                    if remaining < window && self.eta_misses_deadline(order).await? {
                        self.escalate_assigned_at_risk(order).await?;
                    }
                }
            }
            OrderStatus::PickedUp => {
                if self.driver_unresponsive(order, now).await? {
                    self.escalate_stuck(order).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// `time_to_sla < 15 min` while unassigned: force-assign.
    async fn escalate_unassigned_at_risk(&self, order: &Order) -> Result<()> {
        if self.debounced(order.id, EscalationType::SlaRiskCritical) {
            return Ok(());
        }
        self.fire(
            order.id,
            EscalationType::SlaRiskCritical,
            Severity::Critical,
            format!(
                "{} unassigned with {}min to SLA; forcing assignment",
                order.id,
                order.remaining_sla(self.now.utc_now()).num_minutes(),
            ),
        )
        .await;

        if self.availability.is_degraded() {
            self.note_opportunity(order.id, false);
            return Ok(());
        }
        let outcome = self.dispatch.force_assign(order.id).await?;
        let had_candidate = matches!(outcome, DispatchOutcome::Assigned { .. });
        self.note_opportunity(order.id, had_candidate);
        Ok(())
    }

    /// Assigned, close to deadline, and the route ETA misses it: reassign to
    /// a faster candidate.
    async fn escalate_assigned_at_risk(&self, order: &Order) -> Result<()> {
        if self.debounced(order.id, EscalationType::SlaRiskAssigned) {
            return Ok(());
        }
        self.fire(
            order.id,
            EscalationType::SlaRiskAssigned,
            Severity::High,
            format!(
                "{} at SLA risk on its current driver; trying a faster candidate",
                order.id,
            ),
        )
        .await;
        if self.availability.is_degraded() {
            self.note_opportunity(order.id, false);
            return Ok(());
        }
        let reassigned = self.reassign(order, "sla_risk").await?;
        self.note_opportunity(order.id, reassigned);
        Ok(())
    }

    /// Assigned but the driver has gone dark: reassign, or alert when no
    /// candidate exists.
    async fn escalate_unresponsive(&self, order: &Order) -> Result<()> {
        if self.debounced(order.id, EscalationType::DriverUnresponsive) {
            return Ok(());
        }
        self.fire(
            order.id,
            EscalationType::DriverUnresponsive,
            Severity::High,
            format!(
                "driver {} has sent no update for {}; reassigning {}",
                order
                    .driver_id
                    .map(|driver| driver.to_string())
                    .unwrap_or_else(|| "?".to_owned()),
                humanize(self.config.stuck_threshold),
                order.id,
            ),
        )
        .await;
        if self.availability.is_degraded() {
            return Ok(());
        }
        if !self.reassign(order, "driver_unresponsive").await? {
            self.raise_alert(
                Severity::High,
                DispatchAlertType::DriverUnresponsive,
                Some(order.id),
                format!("no candidate available to take {} over", order.id),
            )
            .await;
        }
        Ok(())
    }

    /// Picked up but not moving: the parcel is on board, reassignment is not
    /// possible, so operators get a HIGH alert.
    async fn escalate_stuck(&self, order: &Order) -> Result<()> {
        if self.debounced(order.id, EscalationType::StuckOrder) {
            return Ok(());
        }
        self.fire(
            order.id,
            EscalationType::StuckOrder,
            Severity::High,
            format!("{} is picked up but has not moved", order.id),
        )
        .await;
        self.raise_alert(
            Severity::High,
            DispatchAlertType::StuckOrder,
            Some(order.id),
            format!(
                "{} stuck in transit with driver {}",
                order.id,
                order
                    .driver_id
                    .map(|driver| driver.to_string())
                    .unwrap_or_else(|| "?".to_owned()),
            ),
        )
        .await;
        Ok(())
    }

    /// Recovery for a recorded delivery failure. The order is already back
    /// in `assigned` or still `picked_up`; the chosen action depends on the
    /// failure category.
    pub async fn handle_failed_delivery(
        &self,
        order_id: OrderId,
        category: FailureCategory,
        notes: Option<String>,
    ) -> Result<()> {
        let order = match self.orders.order(order_id).await {
            Ok(order) => order,
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if !self.debounced(order_id, EscalationType::FailedDelivery) {
            self.fire(
                order_id,
                EscalationType::FailedDelivery,
                Severity::High,
                format!(
                    "delivery of {} failed ({:?}){}",
                    order_id,
                    category,
                    notes
                        .as_deref()
                        .map(|notes| format!(": {}", notes))
                        .unwrap_or_default(),
                ),
            )
            .await;
        }

        match recovery_for(category) {
            RecoveryAction::ImmediateRetry => {
                self.order_alert(
                    order_id,
                    Severity::Low,
                    "delivery retry in progress".to_owned(),
                )
                .await;
            }
            RecoveryAction::ScheduleRetry => {
                if order.status == OrderStatus::Assigned {
                    if let Some(driver) = order.driver_id {
                        let _ = self.retry(|| self.orders.return_to_pool(order_id)).await;
                        let _ = self
                            .state_machine
                            .release_assignment(
                                driver,
                                &[order_id],
                                order.load_kg,
                                "delivery_failed",
                            )
                            .await;
                        self.optimize.request(driver, OptimizeReason::StopsChanged);
                    }
                }
                self.order_alert(
                    order_id,
                    Severity::Medium,
                    "delivery rescheduled after a failed attempt".to_owned(),
                )
                .await;
            }
            RecoveryAction::ContactCustomer => {
                self.order_alert(
                    order_id,
                    Severity::Medium,
                    "we could not deliver; customer service will reach out".to_owned(),
                )
                .await;
                self.raise_alert(
                    Severity::Medium,
                    DispatchAlertType::DeliveryFailed,
                    Some(order_id),
                    format!("{} needs customer contact ({:?})", order_id, category),
                )
                .await;
            }
        }
        Ok(())
    }

    /// Writes the breach record when an order terminates past its deadline.
    /// `preventable` reflects whether the engine had a candidate at the last
    /// SLA risk firing.
    pub async fn record_breach_if_late(&self, order: &Order) -> Result<()> {
        let now = self.now.utc_now();
        let terminated_at = order.delivered_at.unwrap_or(now);
        if terminated_at <= order.sla_deadline && !order.sla_breached {
            self.risk_opportunity.lock().unwrap().remove(&order.id);
            return Ok(());
        }
        let breach_min = (terminated_at - order.sla_deadline)
            .num_seconds()
            .max(0) as f64
            / 60.0;
        let preventable = self
            .risk_opportunity
            .lock()
            .unwrap()
            .remove(&order.id)
            .unwrap_or(false);
        let penalty = breach_penalty(
            self.config.base_penalty(order.service_tier),
            breach_min.max(1.0),
        );
        let breach = SlaBreach {
            order_id: order.id,
            breach_min,
            penalty,
            preventable,
            at: now,
        };
        log::warn!(
            "{} breached its SLA by {:.0}min (penalty {:.2}, preventable: {})",
            order.id,
            breach_min,
            penalty,
            preventable,
        );
        if let Err(err) = self.journal.record_sla_breach(breach).await {
            log::warn!("failed to append SLA breach: {:?}", err);
        }
        self.metrics.sla_breached(preventable);
        self.order_alert(
            order.id,
            Severity::High,
            "delivery missed its promised window; compensation applies".to_owned(),
        )
        .await;
        Ok(())
    }

    /// Moves an assigned order to the best excluded-current candidate with
    /// boosted performance/zone weights. Both drivers and the order commit
    /// together; on any failure the already-applied steps are compensated.
    async fn reassign(&self, order: &Order, why: &str) -> Result<bool> {
        if order.reassignment_count >= self.config.max_reassignments {
            self.raise_alert(
                Severity::High,
                DispatchAlertType::AllBusy,
                Some(order.id),
                format!(
                    "{} exhausted its {} reassignments",
                    order.id, self.config.max_reassignments,
                ),
            )
            .await;
            return Ok(false);
        }
        let from = match order.driver_id {
            Some(driver) => driver,
            None => return Ok(false),
        };
        let weights = boosted_weights(&self.dispatch.weights());
        let candidate = self
            .dispatch
            .best_candidate(
                order.pickup,
                order.service_tier,
                order.load_kg,
                Some(from),
                &weights,
            )
            .await?;
        let (to_driver, _score) = match candidate {
            Some(found) => found,
            None => return Ok(false),
        };
        let to = to_driver.id;

        // New driver first; the CAS on the order decides the race, and a
        // failure after that point releases the new driver again.
        if self
            .state_machine
            .commit_assignment(to, &[order.id], order.load_kg, "reassignment")
            .await
            .is_err()
        {
            return Ok(false);
        }
        if let Err(err) = self
            .retry(|| self.orders.reassign(order.id, from, to))
            .await
        {
            log::info!("reassignment of {} lost its race: {}", order.id, err);
            let _ = self
                .state_machine
                .release_assignment(to, &[order.id], order.load_kg, "reassignment_reverted")
                .await;
            return Ok(false);
        }
        let _ = self
            .state_machine
            .release_assignment(from, &[order.id], order.load_kg, "reassigned_away")
            .await;

        let event = ReassignmentEvent {
            order_id: order.id,
            from_driver: from,
            to_driver: to,
            reason: why.to_owned(),
            at: self.now.utc_now(),
        };
        if let Err(err) = self.journal.record_reassignment(event).await {
            log::warn!("failed to append reassignment event: {:?}", err);
        }
        self.bus.publish(OutboundEvent::OrderReassigned {
            order_id: order.id,
            from_driver: from,
            to_driver: to,
        });
        self.metrics.reassignment_committed();
        self.metrics
            .assignment_committed(crate::models::AssignmentKind::Reassigned);
        self.optimize.request(from, OptimizeReason::Reassignment);
        self.optimize.request(to, OptimizeReason::Reassignment);
        log::info!("reassigned {} from {} to {} ({})", order.id, from, to, why);
        Ok(true)
    }

    /// Detects the fatal contradiction between a driver's active order list
    /// and the orders' own driver bindings; affected drivers are
    /// quarantined, the rest of the fleet keeps operating.
    async fn consistency_sweep(&self) {
        let drivers = match self.drivers.drivers().await {
            Ok(drivers) => drivers,
            Err(err) => {
                log::warn!("consistency sweep could not list drivers: {:?}", err);
                return;
            }
        };
        for driver in drivers {
            if driver.quarantined {
                continue;
            }
            for order_id in &driver.active_order_ids {
                let order = match self.orders.order(*order_id).await {
                    Ok(order) => order,
                    Err(_) => continue,
                };
                let consistent = match order.status {
                    OrderStatus::Assigned | OrderStatus::PickedUp => {
                        order.driver_id == Some(driver.id)
                    }
                    _ => false,
                };
                if !consistent {
                    let _ = self
                        .state_machine
                        .quarantine(
                            driver.id,
                            &format!(
                                "active order {} is {} and bound to {:?}",
                                order.id, order.status, order.driver_id,
                            ),
                        )
                        .await;
                    break;
                }
            }
        }
    }

    /// Ages out traffic incidents that were never explicitly resolved.
    async fn expire_stale_incidents(&self) {
        let ttl = Duration::from_std(self.config.incident_ttl).unwrap_or_else(|_| Duration::hours(2));
        match self.incidents.expire_incidents(self.now.utc_now() - ttl).await {
            Ok(0) => {}
            Ok(expired) => log::info!("{} traffic incidents aged out", expired),
            Err(err) => log::warn!("failed to expire traffic incidents: {:?}", err),
        }
    }

    async fn publish_state_gauges(&self) {
        if let Ok(drivers) = self.drivers.drivers().await {
            let mut counts: HashMap<String, usize> = HashMap::new();
            for driver in &drivers {
                *counts.entry(driver.status.to_string()).or_insert(0) += 1;
            }
            for (state, count) in counts {
                self.metrics.set_driver_state_count(&state, count);
            }
        }
    }

    async fn driver_unresponsive(&self, order: &Order, now: DateTime<Utc>) -> Result<bool> {
        let driver_id = match order.driver_id {
            Some(driver) => driver,
            None => return Ok(false),
        };
        let driver = match self.drivers.driver(driver_id).await {
            Ok(driver) => driver,
            Err(StoreError::NotFound(_)) => return Ok(true),
            Err(err) => return Err(err.into()),
        };
        let threshold =
            Duration::from_std(self.config.stuck_threshold).unwrap_or_else(|_| Duration::minutes(15));
        Ok(match driver.last_location_update {
            Some(at) => now - at > threshold,
            None => now - driver.state_changed_at > threshold,
        })
    }

    async fn eta_misses_deadline(&self, order: &Order) -> Result<bool> {
        let driver_id = match order.driver_id {
            Some(driver) => driver,
            None => return Ok(false),
        };
        let route = self.retry(|| self.routes.active_route(driver_id)).await?;
        let eta = route.and_then(|route| route.delivery_eta(order.id));
        let margin =
            Duration::from_std(self.config.eta_margin).unwrap_or_else(|_| Duration::minutes(2));
        Ok(match eta {
            Some(eta) => eta > order.sla_deadline - margin,
            // No route ETA for an assigned order counts as at risk.
            None => true,
        })
    }

    /// Returns true (and keeps the previous stamp) while inside the
    /// per-(order, type) suppression window; stamps and returns false
    /// otherwise.
    fn debounced(&self, order: OrderId, escalation: EscalationType) -> bool {
        let now = self.now.utc_now();
        let window =
            Duration::from_std(self.config.debounce).unwrap_or_else(|_| Duration::minutes(5));
        let mut debounce = self.debounce.lock().unwrap();
        if let Some(last) = debounce.get(&(order, escalation)) {
            if now - *last < window {
                return true;
            }
        }
        debounce.insert((order, escalation), now);
        false
    }

    fn note_opportunity(&self, order: OrderId, had_candidate: bool) {
        self.risk_opportunity
            .lock()
            .unwrap()
            .insert(order, had_candidate);
    }

    async fn fire(
        &self,
        order: OrderId,
        escalation: EscalationType,
        severity: Severity,
        message: String,
    ) {
        log::warn!("escalation {} for {}: {}", escalation, order, message);
        self.metrics.escalation_fired(escalation);
        let row = EscalationLog {
            order_id: order,
            escalation,
            severity,
            message,
            at: self.now.utc_now(),
            acknowledged: false,
            resolved: false,
        };
        if let Err(err) = self.journal.record_escalation(row).await {
            log::warn!("failed to append escalation: {:?}", err);
        }
        self.bus.publish(OutboundEvent::SlaAlert {
            order_id: order,
            level: severity,
        });
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

    async fn order_alert(&self, order: OrderId, severity: Severity, message: String) {
        let alert = OrderAlert {
            order_id: order,
            severity,
            message,
            at: self.now.utc_now(),
        };
        if let Err(err) = self.journal.record_order_alert(alert).await {
            log::warn!("failed to append order alert: {:?}", err);
        }
    }

    async fn retry<T, Fut>(&self, operation: impl FnMut() -> Fut) -> StoreResult<T>
    where
        Fut: std::future::Future<Output = StoreResult<T>>,
    {
        with_retry(self.sleep.as_ref(), &self.availability, operation).await
    }
}

fn humanize(duration: std::time::Duration) -> String {
    format!("{}min", duration.as_secs() / 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DispatchConfig, DriverCaps};
    use crate::models::driver::test_util::create_driver_for_test;
    use crate::models::order::test_util::create_order_for_test;
    use crate::models::{AssignmentKind, Driver, DriverStatus};
    use crate::routing::optimize_channel;
    use crate::store::{DriverLockRegistry, InMemoryStore};
    use crate::util::test_util::{FakeNow, InstantSleep};
    use crate::util::{FutureWaitExt as _, Now as _};

    struct Fixture {
        engine: EscalationEngine,
        store: Arc<InMemoryStore>,
        now: Arc<FakeNow>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let now = Arc::new(FakeNow::default());
        let bus = Arc::new(EventBus::new());
        let availability = Arc::new(Availability::new(5));
        let machine = Arc::new(DriverStateMachine::new(
            store.clone(),
            store.clone(),
            Arc::new(DriverLockRegistry::new()),
            bus.clone(),
            DriverCaps::default(),
            now.clone(),
        ));
        let (optimize, _optimize_rx) = optimize_channel();
        let dispatch = Arc::new(DispatchEngine::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            machine.clone(),
            optimize.clone(),
            bus.clone(),
            Arc::new(FleetMetrics::default()),
            availability.clone(),
            Arc::new(InstantSleep),
            now.clone(),
            DispatchConfig::default(),
        ));
        let engine = EscalationEngine::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            machine,
            dispatch,
            optimize,
            bus,
            Arc::new(FleetMetrics::default()),
            availability,
            Arc::new(InstantSleep),
            now.clone(),
            EscalationConfig::default(),
        );
        Fixture { engine, store, now }
    }

    fn seed_assigned(fixture: &Fixture, order_id: u64, driver_id: u64) {
        let order = create_order_for_test(order_id);
        fixture.now.set(order.created_at);
        fixture.store.create_order(order.clone()).wait().unwrap();
        let mut driver = create_driver_for_test(driver_id);
        driver.status = DriverStatus::Busy;
        driver.previous_status = DriverStatus::Available;
        driver.active_order_ids = vec![order.id];
        driver.assigned_load_kg = order.load_kg;
        fixture.store.upsert_driver(driver).wait().unwrap();
        fixture
            .store
            .try_assign(order.id, DriverId(driver_id), order.created_at)
            .wait()
            .unwrap();
    }

    fn seed_available(fixture: &Fixture, driver_id: u64) -> Driver {
        let driver = create_driver_for_test(driver_id);
        fixture.store.upsert_driver(driver.clone()).wait().unwrap();
        driver
    }

    #[test]
    fn unassigned_order_in_critical_window_is_force_assigned() {
        let fixture = fixture();
        let order = create_order_for_test(1);
        fixture.now.set(order.created_at);
        fixture.store.create_order(order.clone()).wait().unwrap();
        seed_available(&fixture, 1);

        // Fifty minutes pass: ten minutes of SLA remain.
        fixture.now.advance(Duration::minutes(50));
        fixture.engine.tick().wait().unwrap();

        let order = fixture.store.order(OrderId(1)).wait().unwrap();
        assert_eq!(order.status, OrderStatus::Assigned);
        let escalations = fixture.store.escalations().wait();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].escalation, EscalationType::SlaRiskCritical);
        let logs = fixture.store.assignments().wait();
        assert_eq!(logs[0].kind, AssignmentKind::ForceAssigned);
    }

    #[test]
    fn repeated_ticks_inside_debounce_window_fire_once() {
        let fixture = fixture();
        let order = create_order_for_test(1);
        fixture.now.set(order.created_at);
        fixture.store.create_order(order).wait().unwrap();
        // No drivers: the escalation cannot resolve, so it would re-fire
        // every tick without debounce.
        fixture.now.advance(Duration::minutes(50));
        fixture.engine.tick().wait().unwrap();
        fixture.now.advance(Duration::minutes(1));
        fixture.engine.tick().wait().unwrap();

        let escalations = fixture.store.escalations().wait();
        assert_eq!(escalations.len(), 1);

        // Past the five minute window it fires again.
        fixture.now.advance(Duration::minutes(5));
        fixture.engine.tick().wait().unwrap();
        assert_eq!(fixture.store.escalations().wait().len(), 2);
    }

    #[test]
    fn unresponsive_driver_triggers_reassignment() {
        let fixture = fixture();
        seed_assigned(&fixture, 1, 1);
        // Second driver nearby, fresh and available.
        let mut second = create_driver_for_test(2);
        second.last_location_update = Some(fixture.now.utc_now() + Duration::minutes(16));
        fixture.store.upsert_driver(second).wait().unwrap();

        // Sixteen minutes with no update from driver 1 (their last update
        // predates assignment time).
        fixture.now.advance(Duration::minutes(16));
        fixture.engine.tick().wait().unwrap();

        let order = fixture.store.order(OrderId(1)).wait().unwrap();
        assert_eq!(order.driver_id, Some(DriverId(2)));
        assert_eq!(order.reassignment_count, 1);

        let d1 = fixture.store.driver(DriverId(1)).wait().unwrap();
        assert_eq!(d1.status, DriverStatus::Available);
        assert!(d1.active_order_ids.is_empty());
        let d2 = fixture.store.driver(DriverId(2)).wait().unwrap();
        assert_eq!(d2.status, DriverStatus::Busy);
        assert_eq!(d2.active_order_ids, vec![OrderId(1)]);

        let events = fixture.store.reassignments().wait();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].from_driver, DriverId(1));
        assert_eq!(events[0].to_driver, DriverId(2));
    }

    #[test]
    fn unresponsive_driver_without_candidate_raises_alert() {
        let fixture = fixture();
        seed_assigned(&fixture, 1, 1);

        fixture.now.advance(Duration::minutes(16));
        fixture.engine.tick().wait().unwrap();

        let order = fixture.store.order(OrderId(1)).wait().unwrap();
        assert_eq!(order.driver_id, Some(DriverId(1)));
        let alerts = fixture.store.dispatch_alerts().wait();
        assert!(alerts
            .iter()
            .any(|alert| alert.alert_type == DispatchAlertType::DriverUnresponsive));
    }

    #[test]
    fn stuck_picked_up_order_alerts_without_reassignment() {
        let fixture = fixture();
        seed_assigned(&fixture, 1, 1);
        fixture
            .store
            .mark_picked_up(OrderId(1), fixture.now.utc_now())
            .wait()
            .unwrap();
        seed_available(&fixture, 2);

        fixture.now.advance(Duration::minutes(16));
        fixture.engine.tick().wait().unwrap();

        let order = fixture.store.order(OrderId(1)).wait().unwrap();
        // Still with the original driver; the parcel is on board.
        assert_eq!(order.driver_id, Some(DriverId(1)));
        let escalations = fixture.store.escalations().wait();
        assert!(escalations
            .iter()
            .any(|log| log.escalation == EscalationType::StuckOrder));
        let alerts = fixture.store.dispatch_alerts().wait();
        assert!(alerts
            .iter()
            .any(|alert| alert.alert_type == DispatchAlertType::StuckOrder));
    }

    #[test]
    fn reassignment_cap_is_enforced() {
        let fixture = fixture();
        seed_assigned(&fixture, 1, 1);
        seed_available(&fixture, 2);
        // Exhaust the cap.
        for _ in 0..3 {
            let order = fixture.store.order(OrderId(1)).wait().unwrap();
            let from = order.driver_id.unwrap();
            let to = if from == DriverId(1) { DriverId(2) } else { DriverId(1) };
            fixture.store.reassign(OrderId(1), from, to).wait().unwrap();
        }

        let order = fixture.store.order(OrderId(1)).wait().unwrap();
        assert_eq!(order.reassignment_count, 3);
        let reassigned = fixture.engine.reassign(&order, "test").wait().unwrap();
        assert!(!reassigned);
        assert_eq!(order.reassignment_count, 3);
    }

    #[test]
    fn failed_delivery_schedule_retry_returns_order_to_pool() {
        let fixture = fixture();
        seed_assigned(&fixture, 1, 1);

        fixture
            .engine
            .handle_failed_delivery(
                OrderId(1),
                FailureCategory::AccessRestricted,
                Some("gate locked".to_owned()),
            )
            .wait()
            .unwrap();

        let order = fixture.store.order(OrderId(1)).wait().unwrap();
        assert_eq!(order.status, OrderStatus::PendingDriver);
        assert_eq!(order.driver_id, None);
        let driver = fixture.store.driver(DriverId(1)).wait().unwrap();
        assert_eq!(driver.status, DriverStatus::Available);
        let escalations = fixture.store.escalations().wait();
        assert!(escalations
            .iter()
            .any(|log| log.escalation == EscalationType::FailedDelivery));
    }

    #[test]
    fn breach_record_carries_penalty_and_preventability() {
        let fixture = fixture();
        let mut order = create_order_for_test(1);
        fixture.now.set(order.created_at);
        fixture.store.create_order(order.clone()).wait().unwrap();

        // The engine noted a missed opportunity at the last risk tick.
        fixture.engine.note_opportunity(OrderId(1), true);

        // Terminated 20 minutes late.
        order.status = OrderStatus::Delivered;
        order.delivered_at = Some(order.sla_deadline + Duration::minutes(20));
        order.sla_breached = true;
        fixture.engine.record_breach_if_late(&order).wait().unwrap();

        let breaches = fixture.store.sla_breaches().wait();
        assert_eq!(breaches.len(), 1);
        assert!((breaches[0].breach_min - 20.0).abs() < 1e-6);
        // Two started 15-minute units at the BARQ base of 25.0.
        assert!((breaches[0].penalty - 50.0).abs() < 1e-6);
        assert!(breaches[0].preventable);
    }

    #[test]
    fn on_time_termination_writes_no_breach() {
        let fixture = fixture();
        let mut order = create_order_for_test(1);
        fixture.now.set(order.created_at);
        fixture.store.create_order(order.clone()).wait().unwrap();
        order.status = OrderStatus::Delivered;
        order.delivered_at = Some(order.sla_deadline - Duration::minutes(5));
        fixture.engine.record_breach_if_late(&order).wait().unwrap();
        assert!(fixture.store.sla_breaches().wait().is_empty());
    }

    #[test]
    fn penalty_function_caps_at_ten_units() {
        assert!((breach_penalty(25.0, 1.0) - 25.0).abs() < 1e-9);
        assert!((breach_penalty(25.0, 16.0) - 50.0).abs() < 1e-9);
        assert!((breach_penalty(25.0, 1000.0) - 250.0).abs() < 1e-9);
    }

    #[test]
    fn consistency_sweep_quarantines_contradicting_driver() {
        let fixture = fixture();
        seed_assigned(&fixture, 1, 1);
        // Corrupt the state: the order is re-pointed at another driver while
        // driver 1 still lists it as active.
        seed_available(&fixture, 2);
        fixture
            .store
            .reassign(OrderId(1), DriverId(1), DriverId(2))
            .wait()
            .unwrap();

        fixture.engine.tick().wait().unwrap();

        let driver = fixture.store.driver(DriverId(1)).wait().unwrap();
        assert!(driver.quarantined);
        // The healthy driver is untouched.
        assert!(!fixture.store.driver(DriverId(2)).wait().unwrap().quarantined);
    }
}
