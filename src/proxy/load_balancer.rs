use std::sync::Arc;

use tracing::debug;

use super::upstream::{Backend, ServerPool};
use crate::config::Strategy;

/// Selects a backend for the pool, or `None` when no healthy backend exists.
pub fn select(pool: &ServerPool) -> Option<Arc<Backend>> {
    match pool.strategy() {
        Strategy::RoundRobin => round_robin(pool),
        Strategy::LeastConn => least_conn(pool),
    }
}

/// Cycles through the currently healthy backends in configuration order.
/// The healthy set is recomputed per call, so selections may skip or revisit
/// a backend when health changes mid-cycle.
fn round_robin(pool: &ServerPool) -> Option<Arc<Backend>> {
    let healthy: Vec<&Arc<Backend>> = pool
        .backends()
        .iter()
        .filter(|backend| backend.is_healthy())
        .collect();

    if healthy.is_empty() {
        return None;
    }

    let index = pool.next_rr_index() % healthy.len();
    debug!(backend = %healthy[index].url(), index, "round robin selection");
    Some(Arc::clone(healthy[index]))
}

/// Picks the healthy backend with the fewest active connections. Each
/// counter is read once; the snapshot is advisory, not a correctness
/// primitive. Ties go to the first backend in configuration order.
fn least_conn(pool: &ServerPool) -> Option<Arc<Backend>> {
    let mut candidate: Option<&Arc<Backend>> = None;
    let mut min_conns = i64::MAX;

    for backend in pool.backends() {
        if !backend.is_healthy() {
            continue;
        }

        let conns = backend.active_conns();
        if conns < min_conns {
            min_conns = conns;
            candidate = Some(backend);
        }
    }

    if let Some(backend) = candidate {
        debug!(backend = %backend.url(), connections = min_conns, "least connections selection");
    }

    candidate.cloned()
}
