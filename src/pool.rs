//! Outbound connection pool selection and pruning.

use crate::registry::{PeerRecord, PeerRegistry};
use std::cmp::Ordering;

/// Pool is left alone below this share of `max_peers`.
const OPTIMIZE_FILL: f64 = 0.8;
/// Above this share of `max_peers` the slowest peers are evicted.
const PRUNE_FILL: f64 = 0.9;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct PoolDecision {
    /// Pool was below the optimization threshold; nothing was ranked.
    pub skipped: bool,
    pub preferred: Vec<String>,
    pub evicted: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PoolOptimizer {
    preferred_latency_ms: f64,
}

impl Default for PoolOptimizer {
    fn default() -> Self {
        Self { preferred_latency_ms: 100.0 }
    }
}

impl PoolOptimizer {
    pub fn new(preferred_latency_ms: f64) -> Self {
        Self { preferred_latency_ms }
    }

    pub fn optimize(&self, registry: &mut PeerRegistry, max_peers: usize, max_outbound: usize) -> PoolDecision {
        let count = registry.active_count();
        if (count as f64) < max_peers as f64 * OPTIMIZE_FILL {
            return PoolDecision { skipped: true, ..PoolDecision::default() };
        }

        let mut ranked: Vec<&PeerRecord> = registry.active().collect();
        ranked.sort_by(|a, b| by_latency(a, b));

        let preferred = ranked
            .iter()
            .take_while(|p| p.latency_ms.is_some_and(|l| l < self.preferred_latency_ms))
            .take(max_outbound)
            .map(|p| p.peer_id.clone())
            .collect();

        let evicted: Vec<String> = if count as f64 > max_peers as f64 * PRUNE_FILL {
            ranked.iter().skip(max_outbound).map(|p| p.peer_id.clone()).collect()
        } else {
            Vec::new()
        };
        for peer_id in &evicted {
            registry.evict(peer_id);
        }

        PoolDecision { skipped: false, preferred, evicted }
    }
}

/// Ascending latency, unmeasured peers last, ties broken by peer id.
fn by_latency(a: &PeerRecord, b: &PeerRecord) -> Ordering {
    match (a.latency_ms, b.latency_ms) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.peer_id.cmp(&b.peer_id))
}
