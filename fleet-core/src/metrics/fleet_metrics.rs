use crate::models::{AssignmentKind, EscalationType};
use anyhow::Result;
use prometheus::{CounterVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

/// Metrics over every engine in the control plane. One instance is shared by
/// dispatch, batching, routing and escalation.
pub struct FleetMetrics {
    assignments: IntCounterVec,
    dispatch_outcomes: IntCounterVec,
    radius_widenings: IntCounter,
    offers: IntCounterVec,
    pending_orders: IntGauge,
    batches_created: IntCounter,
    orders_batched: IntCounter,
    route_optimizations: IntCounterVec,
    route_savings: CounterVec,
    escalations: IntCounterVec,
    reassignments: IntCounter,
    sla_breaches: IntCounterVec,
    driver_states: IntGaugeVec,
    degraded: IntGauge,
}

impl FleetMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let assignments = IntCounterVec::new(
            Opts::new("fleet_dispatch_assignments", "orders bound to drivers"),
            &["kind"],
        )?;
        for kind in &["NORMAL", "FORCE_ASSIGNED", "REASSIGNED"] {
            let _ = assignments.with_label_values(&[kind]);
        }
        registry.register(Box::new(assignments.clone()))?;

        let dispatch_outcomes = IntCounterVec::new(
            Opts::new(
                "fleet_dispatch_outcomes",
                "dispatch attempts by final outcome",
            ),
            &["outcome"],
        )?;
        for outcome in &["assigned", "pending_driver", "all_busy", "offer_open", "degraded"] {
            let _ = dispatch_outcomes.with_label_values(&[outcome]);
        }
        registry.register(Box::new(dispatch_outcomes.clone()))?;

        let radius_widenings = IntCounter::new(
            "fleet_dispatch_radius_widenings",
            "times the candidate radius had to grow",
        )?;
        registry.register(Box::new(radius_widenings.clone()))?;

        let offers = IntCounterVec::new(
            Opts::new("fleet_dispatch_offers", "driver offers by resolution"),
            &["result"],
        )?;
        for result in &["accepted", "rejected", "expired"] {
            let _ = offers.with_label_values(&[result]);
        }
        registry.register(Box::new(offers.clone()))?;

        let pending_orders = IntGauge::new(
            "fleet_dispatch_pending_orders",
            "orders currently waiting for a driver",
        )?;
        registry.register(Box::new(pending_orders.clone()))?;

        let batches_created =
            IntCounter::new("fleet_batching_batches_created", "batches emitted")?;
        registry.register(Box::new(batches_created.clone()))?;

        let orders_batched =
            IntCounter::new("fleet_batching_orders_batched", "orders put into batches")?;
        registry.register(Box::new(orders_batched.clone()))?;

        let route_optimizations = IntCounterVec::new(
            Opts::new("fleet_route_optimizations", "optimizer runs by outcome"),
            &["outcome"],
        )?;
        for outcome in &["accepted", "discarded", "failed", "emptied"] {
            let _ = route_optimizations.with_label_values(&[outcome]);
        }
        registry.register(Box::new(route_optimizations.clone()))?;

        let route_savings = CounterVec::new(
            Opts::new(
                "fleet_route_savings",
                "cumulative distance and time saved by accepted routes",
            ),
            &["unit"],
        )?;
        for unit in &["km", "min"] {
            let _ = route_savings.with_label_values(&[unit]);
        }
        registry.register(Box::new(route_savings.clone()))?;

        let escalations = IntCounterVec::new(
            Opts::new("fleet_escalations", "escalation firings by type"),
            &["type"],
        )?;
        registry.register(Box::new(escalations.clone()))?;

        let reassignments =
            IntCounter::new("fleet_reassignments", "orders moved between drivers")?;
        registry.register(Box::new(reassignments.clone()))?;

        let sla_breaches = IntCounterVec::new(
            Opts::new("fleet_sla_breaches", "orders terminated past deadline"),
            &["preventable"],
        )?;
        for value in &["true", "false"] {
            let _ = sla_breaches.with_label_values(&[value]);
        }
        registry.register(Box::new(sla_breaches.clone()))?;

        let driver_states = IntGaugeVec::new(
            Opts::new("fleet_driver_states", "drivers per state"),
            &["state"],
        )?;
        registry.register(Box::new(driver_states.clone()))?;

        let degraded = IntGauge::new(
            "fleet_store_degraded",
            "1 while the engine is in read-only degraded mode",
        )?;
        registry.register(Box::new(degraded.clone()))?;

        Ok(Self {
            assignments,
            dispatch_outcomes,
            radius_widenings,
            offers,
            pending_orders,
            batches_created,
            orders_batched,
            route_optimizations,
            route_savings,
            escalations,
            reassignments,
            sla_breaches,
            driver_states,
            degraded,
        })
    }

    pub fn assignment_committed(&self, kind: AssignmentKind) {
        let label = match kind {
            AssignmentKind::Normal => "NORMAL",
            AssignmentKind::ForceAssigned => "FORCE_ASSIGNED",
            AssignmentKind::Reassigned => "REASSIGNED",
        };
        self.assignments.with_label_values(&[label]).inc();
    }

    pub fn dispatch_outcome(&self, outcome: &str) {
        self.dispatch_outcomes.with_label_values(&[outcome]).inc();
    }

    pub fn radius_widened(&self) {
        self.radius_widenings.inc();
    }

    pub fn offer_resolved(&self, result: &str) {
        self.offers.with_label_values(&[result]).inc();
    }

    pub fn set_pending_orders(&self, count: usize) {
        self.pending_orders.set(count as i64);
    }

    pub fn batch_created(&self, size: usize) {
        self.batches_created.inc();
        self.orders_batched.inc_by(size as u64);
    }

    pub fn route_outcome(&self, outcome: &str) {
        self.route_optimizations
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn route_saved(&self, km: f64, minutes: f64) {
        self.route_savings.with_label_values(&["km"]).inc_by(km);
        self.route_savings.with_label_values(&["min"]).inc_by(minutes);
    }

    pub fn escalation_fired(&self, escalation: EscalationType) {
        self.escalations
            .with_label_values(&[&escalation.to_string()])
            .inc();
    }

    pub fn reassignment_committed(&self) {
        self.reassignments.inc();
    }

    pub fn sla_breached(&self, preventable: bool) {
        let label = if preventable { "true" } else { "false" };
        self.sla_breaches.with_label_values(&[label]).inc();
    }

    pub fn set_driver_state_count(&self, state: &str, count: usize) {
        self.driver_states
            .with_label_values(&[state])
            .set(count as i64);
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.degraded.set(degraded as i64);
    }
}

impl Default for FleetMetrics {
    fn default() -> Self {
        Self::new(&Registry::new()).unwrap()
    }
}
