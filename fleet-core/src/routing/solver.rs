//! Tour construction and improvement over a fixed distance matrix. All
//! functions are pure and deterministic: ties break on the lower stop index
//! so identical inputs always produce identical tours.

use crate::distance::Leg;
use crate::models::{Coordinate, OrderId, StopKind, TrafficIncident};

/// A stop as the solver sees it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SolverStop {
    pub order: OrderId,
    pub kind: StopKind,
    pub location: Coordinate,
}

/// Distance matrix over `[start, stop_0, .., stop_n-1]`. Index 0 is the
/// driver's current location.
pub struct Matrix {
    legs: Vec<Vec<Leg>>,
}

impl Matrix {
    pub fn new(legs: Vec<Vec<Leg>>) -> Self {
        Self { legs }
    }

    /// Leg between matrix nodes (0 = start, `i + 1` = stop `i`).
    pub fn leg(&self, from: usize, to: usize) -> Leg {
        self.legs[from][to]
    }

    pub fn len(&self) -> usize {
        self.legs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.legs.is_empty()
    }
}

/// Whether visiting `candidate` now is legal given the already-sequenced
/// stops: a PICKUP is always legal, a DELIVERY only once its order's PICKUP
/// is behind us (or was never part of the stop set, i.e. already on board).
fn is_legal(candidate: usize, visited: &[usize], stops: &[SolverStop]) -> bool {
    match stops[candidate].kind {
        StopKind::Pickup => true,
        StopKind::Delivery => {
            let pickup = stops.iter().position(|stop| {
                stop.order == stops[candidate].order && stop.kind == StopKind::Pickup
            });
            match pickup {
                Some(pickup_index) => visited.contains(&pickup_index),
                None => true,
            }
        }
    }
}

/// Whether the whole sequence respects pickup-before-delivery.
pub fn precedence_ok(sequence: &[usize], stops: &[SolverStop]) -> bool {
    for (position, &index) in sequence.iter().enumerate() {
        if !is_legal(index, &sequence[..position], stops) {
            return false;
        }
    }
    true
}

/// Greedy nearest-neighbor construction from the start node, constrained to
/// legal stops. Returns `None` when no legal continuation exists, which only
/// happens on a contradictory stop set.
pub fn nearest_neighbor(stops: &[SolverStop], matrix: &Matrix) -> Option<Vec<usize>> {
    let mut sequence: Vec<usize> = Vec::with_capacity(stops.len());
    let mut current = 0usize; // matrix node of the driver location

    while sequence.len() < stops.len() {
        let mut best: Option<(usize, f64)> = None;
        for candidate in 0..stops.len() {
            if sequence.contains(&candidate) || !is_legal(candidate, &sequence, stops) {
                continue;
            }
            let distance = matrix.leg(current, candidate + 1).distance_km;
            let better = match best {
                None => true,
                Some((_, best_distance)) => distance < best_distance,
            };
            if better {
                best = Some((candidate, distance));
            }
        }
        let (next, _) = best?;
        sequence.push(next);
        current = next + 1;
    }
    Some(sequence)
}

/// Cheapest-insertion construction for larger stop sets: repeatedly insert
/// the currently-legal stop whose best position increases the tour least.
pub fn cheapest_insertion(stops: &[SolverStop], matrix: &Matrix) -> Option<Vec<usize>> {
    let mut sequence: Vec<usize> = Vec::with_capacity(stops.len());

    while sequence.len() < stops.len() {
        let mut best: Option<(usize, usize, f64)> = None;
        for candidate in 0..stops.len() {
            if sequence.contains(&candidate) {
                continue;
            }
            // The earliest admissible position keeps precedence: a delivery
            // may only go after its pickup.
            let earliest = match stops[candidate].kind {
                StopKind::Pickup => 0,
                StopKind::Delivery => {
                    let pickup = stops.iter().position(|stop| {
                        stop.order == stops[candidate].order && stop.kind == StopKind::Pickup
                    });
                    match pickup {
                        Some(pickup_index) => match sequence
                            .iter()
                            .position(|&sequenced| sequenced == pickup_index)
                        {
                            Some(position) => position + 1,
                            // Pickup not yet routed; try this one later.
                            None => continue,
                        },
                        None => 0,
                    }
                }
            };
            for position in earliest..=sequence.len() {
                let cost = insertion_cost(&sequence, candidate, position, matrix);
                let better = match best {
                    None => true,
                    Some((_, _, best_cost)) => cost < best_cost,
                };
                if better {
                    best = Some((candidate, position, cost));
                }
            }
        }
        let (candidate, position, _) = best?;
        sequence.insert(position, candidate);
    }
    Some(sequence)
}

/// Added distance of inserting `candidate` at `position`.
fn insertion_cost(sequence: &[usize], candidate: usize, position: usize, matrix: &Matrix) -> f64 {
    let node = candidate + 1;
    let before = if position == 0 {
        0
    } else {
        sequence[position - 1] + 1
    };
    let added_in = matrix.leg(before, node).distance_km;
    match sequence.get(position) {
        Some(&after) => {
            let after_node = after + 1;
            added_in + matrix.leg(node, after_node).distance_km
                - matrix.leg(before, after_node).distance_km
        }
        None => added_in,
    }
}

/// Total tour distance in kilometers, starting at the driver location.
pub fn tour_distance(sequence: &[usize], matrix: &Matrix) -> f64 {
    let mut total = 0.0;
    let mut current = 0usize;
    for &index in sequence {
        total += matrix.leg(current, index + 1).distance_km;
        current = index + 1;
    }
    total
}

/// Total travel duration in minutes, starting at the driver location.
pub fn tour_duration(sequence: &[usize], matrix: &Matrix) -> f64 {
    let mut total = 0.0;
    let mut current = 0usize;
    for &index in sequence {
        total += matrix.leg(current, index + 1).duration_min;
        current = index + 1;
    }
    total
}

/// Number of tour edges that cut through a blocking incident.
fn blocked_edges(
    sequence: &[usize],
    stops: &[SolverStop],
    start: Coordinate,
    incidents: &[TrafficIncident],
) -> usize {
    let mut blocked = 0;
    let mut from = start;
    for &index in sequence {
        let to = stops[index].location;
        if incidents.iter().any(|incident| incident.crosses(&from, &to)) {
            blocked += 1;
        }
        from = to;
    }
    blocked
}

/// 2-opt improvement constrained by precedence and by blocking traffic
/// incidents: a swap is rejected when it violates pickup-before-delivery or
/// routes more edges through an incident than before.
pub fn two_opt(
    mut sequence: Vec<usize>,
    stops: &[SolverStop],
    matrix: &Matrix,
    start: Coordinate,
    incidents: &[TrafficIncident],
    max_passes: usize,
) -> Vec<usize> {
    if sequence.len() < 3 {
        return sequence;
    }
    let mut current_distance = tour_distance(&sequence, matrix);
    let mut current_blocked = blocked_edges(&sequence, stops, start, incidents);

    for _ in 0..max_passes {
        let mut improved = false;
        for i in 0..sequence.len() - 1 {
            for j in i + 1..sequence.len() {
                let mut candidate = sequence.clone();
                candidate[i..=j].reverse();

                if !precedence_ok(&candidate, stops) {
                    continue;
                }
                let candidate_distance = tour_distance(&candidate, matrix);
                if candidate_distance + 1e-9 >= current_distance {
                    continue;
                }
                let candidate_blocked = blocked_edges(&candidate, stops, start, incidents);
                if candidate_blocked > current_blocked {
                    continue;
                }
                sequence = candidate;
                current_distance = candidate_distance;
                current_blocked = candidate_blocked;
                improved = true;
            }
        }
        if !improved {
            break;
        }
    }
    sequence
}
