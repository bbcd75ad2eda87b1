//! The offer ledger. An offer is a time-bounded lease giving one driver
//! exclusive right of first refusal on one work item: while it is open no
//! other order may be offered to that driver and no other driver may be
//! offered that order. Expiry counts as rejection; no rollback is needed
//! because nothing beyond this bookkeeping changed.

use crate::dispatch::scoring::ScoreBreakdown;
use crate::models::{DriverId, OrderId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Offer {
    /// The lead order of the work item (first order for batches).
    pub order: OrderId,
    pub driver: DriverId,
    pub score: ScoreBreakdown,
    pub offered_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Ledger {
    by_order: HashMap<OrderId, Offer>,
    by_driver: HashMap<DriverId, OrderId>,
    cooldowns: HashMap<(OrderId, DriverId), DateTime<Utc>>,
    attempts: HashMap<OrderId, u32>,
}

/// In-memory offer bookkeeping. The mutex is never held across await points.
#[derive(Default)]
pub struct OfferBook {
    ledger: Mutex<Ledger>,
}

impl OfferBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens an offer lease when both the order and the driver are free.
    pub fn try_hold(
        &self,
        order: OrderId,
        driver: DriverId,
        score: ScoreBreakdown,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> bool {
        let mut ledger = self.ledger.lock().unwrap();
        if ledger.by_order.contains_key(&order) || ledger.by_driver.contains_key(&driver) {
            return false;
        }
        ledger.by_driver.insert(driver, order);
        ledger.by_order.insert(
            order,
            Offer {
                order,
                driver,
                score,
                offered_at: now,
                expires_at: now + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(30)),
            },
        );
        true
    }

    /// Closes the offer if it is still the one described. Returns it so the
    /// caller can commit or discard with the recorded score.
    pub fn resolve(&self, order: OrderId, driver: DriverId) -> Option<Offer> {
        let mut ledger = self.ledger.lock().unwrap();
        match ledger.by_order.get(&order) {
            Some(offer) if offer.driver == driver => {}
            _ => return None,
        }
        let offer = ledger.by_order.remove(&order);
        ledger.by_driver.remove(&driver);
        offer
    }

    /// The open offer for an order, if any.
    pub fn open_offer(&self, order: OrderId) -> Option<Offer> {
        self.ledger.lock().unwrap().by_order.get(&order).cloned()
    }

    /// Whether the driver currently holds any offer.
    pub fn driver_held(&self, driver: DriverId) -> bool {
        self.ledger.lock().unwrap().by_driver.contains_key(&driver)
    }

    /// Removes and returns every offer past its expiry. An offer expiring
    /// exactly at the timeout boundary is treated as rejected.
    pub fn expire_due(&self, now: DateTime<Utc>) -> Vec<Offer> {
        let mut ledger = self.ledger.lock().unwrap();
        let expired: Vec<OrderId> = ledger
            .by_order
            .values()
            .filter(|offer| now >= offer.expires_at)
            .map(|offer| offer.order)
            .collect();
        let mut result = Vec::with_capacity(expired.len());
        for order in expired {
            if let Some(offer) = ledger.by_order.remove(&order) {
                ledger.by_driver.remove(&offer.driver);
                result.push(offer);
            }
        }
        result
    }

    /// Excludes the driver from the order's candidates until `until`.
    pub fn set_cooldown(&self, order: OrderId, driver: DriverId, until: DateTime<Utc>) {
        self.ledger
            .lock()
            .unwrap()
            .cooldowns
            .insert((order, driver), until);
    }

    pub fn in_cooldown(&self, order: OrderId, driver: DriverId, now: DateTime<Utc>) -> bool {
        self.ledger
            .lock()
            .unwrap()
            .cooldowns
            .get(&(order, driver))
            .map(|until| now < *until)
            .unwrap_or(false)
    }

    /// Counts one more offer attempt for the order and returns the total.
    pub fn record_attempt(&self, order: OrderId) -> u32 {
        let mut ledger = self.ledger.lock().unwrap();
        let attempts = ledger.attempts.entry(order).or_insert(0);
        *attempts += 1;
        *attempts
    }

    /// Drops every trace of an order, voiding any open offer. Used when an
    /// order is cancelled or finally assigned.
    pub fn clear_order(&self, order: OrderId) {
        let mut ledger = self.ledger.lock().unwrap();
        if let Some(offer) = ledger.by_order.remove(&order) {
            ledger.by_driver.remove(&offer.driver);
        }
        ledger.attempts.remove(&order);
        ledger.cooldowns.retain(|(o, _), _| *o != order);
    }

    /// Drops cooldown entries that already lapsed.
    pub fn prune(&self, now: DateTime<Utc>) {
        let mut ledger = self.ledger.lock().unwrap();
        ledger.cooldowns.retain(|_, until| now < *until);
    }
}
