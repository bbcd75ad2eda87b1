//! The smart batching engine: bundles compatible unassigned orders so one
//! driver can serve them in one route. Runs greedy single-link clustering
//! over a pairwise compatibility predicate; clusters of one are discarded.

use crate::config::{BatchingConfig, TierSpeeds};
use crate::events::{EventBus, OutboundEvent};
use crate::metrics::FleetMetrics;
use crate::models::{BatchStatus, BoundingBox, Coordinate, Order, ServiceTier, VehicleType};
use crate::store::{
    with_retry, Availability, BatchRepository, OrderRepository, StoreResult,
};
use crate::util::{AsyncSleeping, Now};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Capacity of the smallest vehicle class that serves batches of a tier.
fn batch_capacity_cap(tier: ServiceTier) -> f64 {
    match tier {
        ServiceTier::Barq => VehicleType::Car.default_capacity_kg(),
        ServiceTier::Bullet => VehicleType::Van.default_capacity_kg(),
    }
}

/// Whether orders `a` and `b` may share a batch.
pub fn compatible(
    a: &Order,
    b: &Order,
    config: &BatchingConfig,
    speeds: &TierSpeeds,
    road_factor: f64,
    now: DateTime<Utc>,
) -> bool {
    if a.service_tier != b.service_tier {
        return false;
    }
    if a.pickup.haversine_km(&b.pickup) > config.pickup_cluster_km {
        return false;
    }
    let span = BoundingBox::from_points([a.pickup, a.dropoff, b.pickup, b.dropoff].iter())
        .map(|bbox| bbox.diagonal_km())
        .unwrap_or(0.0);
    if span > config.drop_span_km {
        return false;
    }
    if a.load_kg + b.load_kg > batch_capacity_cap(a.service_tier) {
        return false;
    }

    // Conservative serve-both estimate: chain the four stops naively and
    // apply the road correction; the earliest deadline must absorb it.
    let tour_km = a.pickup.haversine_km(&b.pickup)
        + b.pickup.haversine_km(&a.dropoff)
        + a.dropoff.haversine_km(&b.dropoff);
    let duration_min = tour_km * road_factor / speeds.for_tier(a.service_tier) * 60.0;
    let earliest = a.sla_deadline.min(b.sla_deadline);
    let budget_min = (earliest - now).num_seconds() as f64 / 60.0;
    duration_min <= budget_min
}

/// Greedy single-link clustering: orders sorted by deadline attach to the
/// cluster with the closest pickup centroid that stays compatible with
/// every member, else start their own.
pub fn cluster_orders<'a>(
    orders: &'a [Order],
    config: &BatchingConfig,
    speeds: &TierSpeeds,
    road_factor: f64,
    now: DateTime<Utc>,
) -> Vec<Vec<&'a Order>> {
    let mut sorted: Vec<&Order> = orders.iter().collect();
    sorted.sort_by_key(|order| (order.sla_deadline, order.id));

    let mut clusters: Vec<Vec<&Order>> = Vec::new();
    for order in sorted {
        let mut best: Option<(usize, f64)> = None;
        for (index, cluster) in clusters.iter().enumerate() {
            if cluster.len() >= config.max_batch_size {
                continue;
            }
            if !cluster
                .iter()
                .all(|member| compatible(member, order, config, speeds, road_factor, now))
            {
                continue;
            }
            let centroid = pickup_centroid(cluster);
            let distance = centroid.haversine_km(&order.pickup);
            let better = match best {
                None => true,
                Some((_, best_distance)) => distance < best_distance,
            };
            if better {
                best = Some((index, distance));
            }
        }
        match best {
            Some((index, _)) => clusters[index].push(order),
            None => clusters.push(vec![order]),
        }
    }
    clusters
}

fn pickup_centroid(cluster: &[&Order]) -> Coordinate {
    let count = cluster.len() as f64;
    Coordinate::new(
        cluster.iter().map(|order| order.pickup.lat).sum::<f64>() / count,
        cluster.iter().map(|order| order.pickup.lng).sum::<f64>() / count,
    )
}

pub struct BatchingEngine {
    orders: Arc<dyn OrderRepository>,
    batches: Arc<dyn BatchRepository>,
    bus: Arc<EventBus>,
    metrics: Arc<FleetMetrics>,
    availability: Arc<Availability>,
    sleep: Arc<dyn AsyncSleeping>,
    now: Arc<dyn Now>,
    config: BatchingConfig,
    speeds: TierSpeeds,
    road_factor: f64,
}

impl BatchingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        batches: Arc<dyn BatchRepository>,
        bus: Arc<EventBus>,
        metrics: Arc<FleetMetrics>,
        availability: Arc<Availability>,
        sleep: Arc<dyn AsyncSleeping>,
        now: Arc<dyn Now>,
        config: BatchingConfig,
        speeds: TierSpeeds,
        road_factor: f64,
    ) -> Self {
        Self {
            orders,
            batches,
            bus,
            metrics,
            availability,
            sleep,
            now,
            config,
            speeds,
            road_factor,
        }
    }

    /// One batching pass: clusters unassigned, unbatched orders and emits a
    /// PENDING batch per cluster of two or more. Returns the number of
    /// batches created.
    pub async fn tick(&self) -> Result<usize> {
        if self.availability.is_degraded() {
            return Ok(0);
        }
        let now = self.now.utc_now();
        let orders = self
            .retry(|| {
                self.orders.orders_with_status(vec![
                    crate::models::OrderStatus::Pending,
                    crate::models::OrderStatus::PendingDriver,
                ])
            })
            .await?;
        let unbatched: Vec<Order> = orders
            .into_iter()
            .filter(|order| order.batch_id.is_none())
            .collect();
        if unbatched.len() < 2 {
            return Ok(0);
        }

        let clusters = cluster_orders(&unbatched, &self.config, &self.speeds, self.road_factor, now);
        let mut created = 0;
        for cluster in clusters {
            if cluster.len() < 2 {
                continue;
            }
            let tier = cluster[0].service_tier;
            let ids: Vec<_> = cluster.iter().map(|order| order.id).collect();
            let batch = self
                .retry(|| self.batches.create_batch(ids.clone(), tier, now))
                .await?;

            let mut linked = Vec::with_capacity(ids.len());
            for id in &ids {
                match self.orders.set_batch(*id, batch.id).await {
                    Ok(true) => linked.push(*id),
                    // Claimed by dispatch or another batch since the scan.
                    Ok(false) => log::debug!("{} no longer batchable, leaving it out", id),
                    Err(err) => log::warn!("failed to link {} to {}: {:?}", id, batch.id, err),
                }
            }
            if linked.len() < 2 {
                for id in &linked {
                    let _ = self.orders.clear_batch(*id).await;
                }
                let _ = self
                    .batches
                    .set_batch_status(batch.id, BatchStatus::Cancelled)
                    .await;
                continue;
            }

            log::info!(
                "created batch {} with {} {} orders",
                batch.id,
                linked.len(),
                tier,
            );
            self.metrics.batch_created(linked.len());
            self.bus.publish(OutboundEvent::BatchCreated {
                batch_id: batch.id,
                order_ids: linked,
            });
            created += 1;
        }
        Ok(created)
    }

    async fn retry<T, Fut>(&self, operation: impl FnMut() -> Fut) -> StoreResult<T>
    where
        Fut: std::future::Future<Output = StoreResult<T>>,
    {
        with_retry(self.sleep.as_ref(), &self.availability, operation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::order::test_util::create_order_for_test;
    use crate::models::{OrderId, OrderStatus};
    use crate::store::InMemoryStore;
    use crate::util::test_util::{FakeNow, InstantSleep};
    use crate::util::{FutureWaitExt as _, Now as _};

    fn engine(store: &Arc<InMemoryStore>, now: &Arc<FakeNow>) -> BatchingEngine {
        BatchingEngine::new(
            store.clone(),
            store.clone(),
            Arc::new(EventBus::new()),
            Arc::new(FleetMetrics::default()),
            Arc::new(Availability::new(5)),
            Arc::new(InstantSleep),
            now.clone(),
            BatchingConfig::default(),
            TierSpeeds::default(),
            1.3,
        )
    }

    /// Order with pickups spread inside one km and dropoffs inside a 6km
    /// box, 60kg each (combined 180kg for three).
    fn clusterable_order(id: u64, offset: f64) -> Order {
        let mut order = create_order_for_test(id);
        order.pickup = Coordinate::new(24.7136 + offset * 0.004, 46.6753);
        order.dropoff = Coordinate::new(24.7300 + offset * 0.01, 46.6900);
        order.load_kg = 60.0;
        order
    }

    #[test]
    fn compatible_orders_form_one_pending_batch() {
        let store = Arc::new(InMemoryStore::new());
        let now = Arc::new(FakeNow::default());
        for id in 0..3 {
            let mut order = clusterable_order(id + 1, id as f64);
            order.created_at = now.utc_now();
            order.sla_deadline = now.utc_now() + chrono::Duration::minutes(60);
            store.create_order(order).wait().unwrap();
        }

        let created = engine(&store, &now).tick().wait().unwrap();
        assert_eq!(created, 1);

        let batches = store.pending_batches().wait().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].order_ids.len(), 3);
        assert_eq!(batches[0].status, BatchStatus::Pending);
        for id in 1..=3 {
            let order = store.order(OrderId(id)).wait().unwrap();
            assert_eq!(order.batch_id, Some(batches[0].id));
        }
    }

    #[test]
    fn different_tiers_never_share_a_batch() {
        let store = Arc::new(InMemoryStore::new());
        let now = Arc::new(FakeNow::default());
        let mut express = clusterable_order(1, 0.0);
        express.created_at = now.utc_now();
        express.sla_deadline = now.utc_now() + chrono::Duration::minutes(60);
        let mut standard = clusterable_order(2, 0.1);
        standard.service_tier = ServiceTier::Bullet;
        standard.created_at = now.utc_now();
        standard.sla_deadline = now.utc_now() + chrono::Duration::hours(4);
        store.create_order(express).wait().unwrap();
        store.create_order(standard).wait().unwrap();

        let created = engine(&store, &now).tick().wait().unwrap();
        assert_eq!(created, 0);
        assert!(store.pending_batches().wait().unwrap().is_empty());
    }

    #[test]
    fn distant_pickups_stay_separate() {
        let store = Arc::new(InMemoryStore::new());
        let now = Arc::new(FakeNow::default());
        let mut near = clusterable_order(1, 0.0);
        near.created_at = now.utc_now();
        near.sla_deadline = now.utc_now() + chrono::Duration::minutes(60);
        let mut far = clusterable_order(2, 0.0);
        // ~8km north.
        far.pickup = Coordinate::new(24.79, 46.6753);
        far.created_at = now.utc_now();
        far.sla_deadline = now.utc_now() + chrono::Duration::minutes(60);
        store.create_order(near).wait().unwrap();
        store.create_order(far).wait().unwrap();

        assert_eq!(engine(&store, &now).tick().wait().unwrap(), 0);
    }

    #[test]
    fn tight_deadline_excludes_an_order_from_batching() {
        let now = FakeNow::default();
        let config = BatchingConfig::default();
        let speeds = TierSpeeds::default();
        let mut a = clusterable_order(1, 0.0);
        a.sla_deadline = now.utc_now() + chrono::Duration::minutes(60);
        let mut b = clusterable_order(2, 0.2);
        // Two minutes cannot absorb the conservative tour estimate.
        b.sla_deadline = now.utc_now() + chrono::Duration::minutes(2);
        assert!(!compatible(&a, &b, &config, &speeds, 1.3, now.utc_now()));
    }

    #[test]
    fn combined_load_over_the_tier_cap_is_incompatible() {
        let now = FakeNow::default();
        let config = BatchingConfig::default();
        let speeds = TierSpeeds::default();
        let mut a = clusterable_order(1, 0.0);
        a.load_kg = 200.0;
        let mut b = clusterable_order(2, 0.2);
        b.load_kg = 150.0;
        // 350kg exceeds the BARQ car cap of 300kg.
        assert!(!compatible(&a, &b, &config, &speeds, 1.3, now.utc_now()));
    }

    #[test]
    fn cluster_size_is_capped() {
        let now = FakeNow::default();
        let mut config = BatchingConfig::default();
        config.max_batch_size = 2;
        let orders: Vec<Order> = (0..4)
            .map(|id| {
                let mut order = clusterable_order(id + 1, id as f64 * 0.05);
                order.load_kg = 10.0;
                order.sla_deadline = now.utc_now() + chrono::Duration::minutes(60);
                order
            })
            .collect();
        let clusters = cluster_orders(&orders, &config, &TierSpeeds::default(), 1.3, now.utc_now());
        assert!(clusters.iter().all(|cluster| cluster.len() <= 2));
        assert_eq!(clusters.iter().map(|cluster| cluster.len()).sum::<usize>(), 4);
    }

    #[test]
    fn already_batched_or_assigned_orders_are_ignored() {
        let store = Arc::new(InMemoryStore::new());
        let now = Arc::new(FakeNow::default());
        for id in 0..2 {
            let mut order = clusterable_order(id + 1, id as f64 * 0.1);
            order.created_at = now.utc_now();
            order.sla_deadline = now.utc_now() + chrono::Duration::minutes(60);
            store.create_order(order).wait().unwrap();
        }
        // Order 1 already belongs to a pending batch.
        let existing = store
            .create_batch(vec![OrderId(1)], ServiceTier::Barq, now.utc_now())
            .wait()
            .unwrap();
        store.set_batch(OrderId(1), existing.id).wait().unwrap();

        assert_eq!(engine(&store, &now).tick().wait().unwrap(), 0);
        let order = store.order(OrderId(2)).wait().unwrap();
        assert_eq!(order.batch_id, None);
        assert_eq!(order.status, OrderStatus::Pending);
    }
}
