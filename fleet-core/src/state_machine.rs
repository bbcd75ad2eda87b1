//! The driver state machine. This is the only path by which a driver's
//! status changes: dispatch, batching and escalation all call into it, and
//! every accepted transition is appended to the state change audit stream.

use crate::config::DriverCaps;
use crate::events::{EventBus, OutboundEvent};
use crate::models::{
    Coordinate, DispatchAlert, DispatchAlertType, Driver, DriverId, DriverStatus, OrderId,
    Severity, StateChange,
};
use crate::store::{AuditJournal, DriverLockRegistry, DriverRepository, StoreError};
use crate::util::Now;
use std::sync::Arc;
use thiserror::Error;

/// Reason string for the automatic break after too many back-to-back
/// deliveries.
pub const MANDATORY_BREAK: &str = "mandatory_break";

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: DriverStatus,
        to: DriverStatus,
    },
    #[error("driver {0} not found")]
    DriverNotFound(DriverId),
    #[error("driver {0} is quarantined")]
    Quarantined(DriverId),
    #[error("store failure: {0}")]
    Store(StoreError),
}

impl From<StoreError> for TransitionError {
    fn from(err: StoreError) -> Self {
        TransitionError::Store(err)
    }
}

/// The allowed transition table. Pure and deterministic so identical inputs
/// always produce identical verdicts.
pub fn transition_allowed(from: DriverStatus, to: DriverStatus) -> bool {
    use DriverStatus::*;
    matches!(
        (from, to),
        (Offline, Available)
            | (Available, Busy)
            | (Available, OnBreak)
            | (Available, Offline)
            | (Busy, Returning)
            | (Busy, Available)
            | (Busy, Offline)
            | (Returning, Available)
            | (Returning, OnBreak)
            | (Returning, Offline)
            | (OnBreak, Available)
            | (OnBreak, Offline)
    )
}

/// Whether a driver may be offered new work. Derived from state plus the
/// quantitative caps; quarantined drivers never qualify.
pub fn can_accept(driver: &Driver, caps: &DriverCaps) -> bool {
    driver.status == DriverStatus::Available
        && !driver.quarantined
        && driver.hours_worked_today < caps.max_working_hours.min(driver.max_working_hours)
        && driver.consecutive_deliveries < caps.max_consecutive_deliveries
        && driver.on_time_rate >= caps.min_on_time_rate
        && driver.active_order_ids.len() < caps.max_concurrent_orders
}

pub struct DriverStateMachine {
    drivers: Arc<dyn DriverRepository>,
    journal: Arc<dyn AuditJournal>,
    locks: Arc<DriverLockRegistry>,
    bus: Arc<EventBus>,
    caps: DriverCaps,
    now: Arc<dyn Now>,
}

impl DriverStateMachine {
    pub fn new(
        drivers: Arc<dyn DriverRepository>,
        journal: Arc<dyn AuditJournal>,
        locks: Arc<DriverLockRegistry>,
        bus: Arc<EventBus>,
        caps: DriverCaps,
        now: Arc<dyn Now>,
    ) -> Self {
        Self {
            drivers,
            journal,
            locks,
            bus,
            caps,
            now,
        }
    }

    pub fn caps(&self) -> &DriverCaps {
        &self.caps
    }

    pub fn can_accept(&self, driver: &Driver) -> bool {
        can_accept(driver, &self.caps)
    }

    /// Validates and applies one transition. Either the whole update commits
    /// (state, audit row, event) or nothing does.
    pub async fn try_transition(
        &self,
        id: DriverId,
        target: DriverStatus,
        reason: &str,
        actor: &str,
    ) -> Result<DriverStatus, TransitionError> {
        let lock = self.locks.acquire(id).await;
        let _guard = lock.lock().await;

        let mut driver = self.load(id).await?;
        self.transition_locked(&mut driver, target, reason, actor)
            .await?;
        self.drivers.store_driver(driver).await?;
        Ok(target)
    }

    /// Binds accepted work to a driver: verifies `can_accept`, appends the
    /// orders, adds their load, and moves the driver to BUSY. The caller
    /// holds no driver lock; this method serializes itself.
    pub async fn commit_assignment(
        &self,
        id: DriverId,
        orders: &[OrderId],
        total_load_kg: f64,
        reason: &str,
    ) -> Result<(), TransitionError> {
        let lock = self.locks.acquire(id).await;
        let _guard = lock.lock().await;

        let mut driver = self.load(id).await?;
        if !self.can_accept(&driver) {
            return Err(TransitionError::InvalidTransition {
                from: driver.status,
                to: DriverStatus::Busy,
            });
        }
        driver.active_order_ids.extend_from_slice(orders);
        driver.assigned_load_kg += total_load_kg;
        self.transition_locked(&mut driver, DriverStatus::Busy, reason, "dispatch")
            .await?;
        self.drivers.store_driver(driver).await?;
        Ok(())
    }

    /// Detaches orders from a driver without a delivery, as happens on
    /// reassignment or cancellation. Returns the driver to AVAILABLE when
    /// nothing active remains.
    pub async fn release_assignment(
        &self,
        id: DriverId,
        orders: &[OrderId],
        total_load_kg: f64,
        reason: &str,
    ) -> Result<DriverStatus, TransitionError> {
        let lock = self.locks.acquire(id).await;
        let _guard = lock.lock().await;

        let mut driver = self.load(id).await?;
        driver
            .active_order_ids
            .retain(|active| !orders.contains(active));
        driver.assigned_load_kg = (driver.assigned_load_kg - total_load_kg).max(0.0);
        if driver.active_order_ids.is_empty() && driver.status == DriverStatus::Busy {
            self.transition_locked(&mut driver, DriverStatus::Available, reason, "dispatch")
                .await?;
        }
        let status = driver.status;
        self.drivers.store_driver(driver).await?;
        Ok(status)
    }

    /// Updates the driver after a completed delivery: counters, rolling
    /// on-time rate, zone memory, and the follow-up transition. When the
    /// consecutive-delivery cap is reached the driver is forced ON_BREAK.
    pub async fn complete_delivery(
        &self,
        id: DriverId,
        order: OrderId,
        load_kg: f64,
        dropoff: Coordinate,
        on_time: bool,
    ) -> Result<DriverStatus, TransitionError> {
        /// Smoothing factor of the rolling on-time rate.
        const ON_TIME_ALPHA: f64 = 0.1;

        let lock = self.locks.acquire(id).await;
        let _guard = lock.lock().await;

        let mut driver = self.load(id).await?;
        driver.active_order_ids.retain(|active| *active != order);
        driver.assigned_load_kg = (driver.assigned_load_kg - load_kg).max(0.0);
        driver.completed_today += 1;
        driver.consecutive_deliveries += 1;
        driver.on_time_rate = (1.0 - ON_TIME_ALPHA) * driver.on_time_rate
            + ON_TIME_ALPHA * if on_time { 1.0 } else { 0.0 };
        driver.push_recent_dropoff(dropoff);

        if driver.active_order_ids.is_empty() && driver.status == DriverStatus::Busy {
            self.transition_locked(
                &mut driver,
                DriverStatus::Available,
                "delivery_completed",
                "dispatch",
            )
            .await?;

            if driver.consecutive_deliveries >= self.caps.max_consecutive_deliveries {
                self.transition_locked(
                    &mut driver,
                    DriverStatus::OnBreak,
                    MANDATORY_BREAK,
                    "state_machine",
                )
                .await?;
                driver.consecutive_deliveries = 0;
            }
        }

        let status = driver.status;
        self.drivers.store_driver(driver).await?;
        Ok(status)
    }

    /// Quarantines a driver after a fatal precondition contradiction. All
    /// further transitions fail until an operator clears the flag.
    pub async fn quarantine(&self, id: DriverId, why: &str) -> Result<(), TransitionError> {
        let lock = self.locks.acquire(id).await;
        let _guard = lock.lock().await;

        let mut driver = self.load_even_quarantined(id).await?;
        if driver.quarantined {
            return Ok(());
        }
        driver.quarantined = true;
        self.drivers.store_driver(driver).await?;

        log::error!("quarantining driver {}: {}", id, why);
        self.journal
            .record_dispatch_alert(DispatchAlert {
                severity: Severity::Critical,
                alert_type: DispatchAlertType::DriverQuarantined,
                order_id: None,
                message: format!("driver {} quarantined: {}", id, why),
                at: self.now.utc_now(),
            })
            .await?;
        self.bus.publish(OutboundEvent::DispatchAlertRaised {
            severity: Severity::Critical,
            alert_type: DispatchAlertType::DriverQuarantined,
            order_id: None,
        });
        Ok(())
    }

    async fn load(&self, id: DriverId) -> Result<Driver, TransitionError> {
        let driver = self.load_even_quarantined(id).await?;
        if driver.quarantined {
            return Err(TransitionError::Quarantined(id));
        }
        Ok(driver)
    }

    async fn load_even_quarantined(&self, id: DriverId) -> Result<Driver, TransitionError> {
        match self.drivers.driver(id).await {
            Ok(driver) => Ok(driver),
            Err(StoreError::NotFound(_)) => Err(TransitionError::DriverNotFound(id)),
            Err(err) => Err(err.into()),
        }
    }

    /// Validates and applies a transition on an already-locked driver row.
    /// The audit row and event fire here; the caller persists the row.
    async fn transition_locked(
        &self,
        driver: &mut Driver,
        target: DriverStatus,
        reason: &str,
        actor: &str,
    ) -> Result<(), TransitionError> {
        let from = driver.status;
        if !transition_allowed(from, target) {
            return Err(TransitionError::InvalidTransition { from, to: target });
        }
        let now = self.now.utc_now();

        // Working hours accrue for all time spent on shift.
        if from != DriverStatus::Offline {
            let elapsed = now - driver.state_changed_at;
            driver.hours_worked_today += (elapsed.num_seconds().max(0) as f64) / 3600.0;
        }

        // Coming online on a new calendar day resets the daily counters.
        if from == DriverStatus::Offline
            && target == DriverStatus::Available
            && driver.state_changed_at.date() < now.date()
        {
            driver.completed_today = 0;
            driver.hours_worked_today = 0.0;
            driver.consecutive_deliveries = 0;
            driver.recent_dropoffs.clear();
        }

        driver.previous_status = from;
        driver.status = target;
        driver.state_changed_at = now;
        if target == DriverStatus::OnBreak {
            driver.last_break_at = Some(now);
        }

        let change = StateChange {
            driver_id: driver.id,
            from,
            to: target,
            reason: reason.to_owned(),
            actor: actor.to_owned(),
            at: now,
        };
        log::info!(
            "driver {} {} -> {} ({})",
            driver.id,
            from,
            target,
            reason
        );
        // The audit stream is best effort; a failed append must not undo a
        // transition that already validated.
        if let Err(err) = self.journal.record_state_change(change).await {
            log::warn!("failed to append state change: {:?}", err);
        }
        self.bus.publish(OutboundEvent::DriverStateChanged {
            driver_id: driver.id,
            from,
            to: target,
            reason: reason.to_owned(),
        });
        Ok(())
    }
}
