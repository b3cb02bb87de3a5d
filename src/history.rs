use std::collections::VecDeque;
use std::time::SystemTime;

/// Point-in-time view of the node's network health, taken once per health cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSnapshot {
    pub timestamp: SystemTime,
    pub connected_peers: usize,
    /// Sum of peer throughput, Mbps.
    pub total_bandwidth: f64,
    pub avg_latency: f64,
    /// Blocks per minute, from the resource sampler.
    pub block_rate: f64,
    pub failed_conn: u64,
    pub succeeded_conn: u64,
    pub mem_pct: f64,
    pub disk_pct: f64,
}

/// Bounded FIFO of snapshots; the oldest entry goes first.
#[derive(Debug)]
pub struct MetricsHistory {
    snapshots: VecDeque<NetworkSnapshot>,
    capacity: usize,
}

impl MetricsHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { snapshots: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn push(&mut self, snapshot: NetworkSnapshot) {
        while self.snapshots.len() >= self.capacity {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(snapshot);
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn latest(&self) -> Option<&NetworkSnapshot> {
        self.snapshots.back()
    }

    /// The newest `n` snapshots, oldest first. `None` if fewer exist.
    pub fn last_n(&self, n: usize) -> Option<impl Iterator<Item = &NetworkSnapshot>> {
        if n == 0 || self.snapshots.len() < n {
            return None;
        }
        Some(self.snapshots.iter().skip(self.snapshots.len() - n))
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetworkSnapshot> {
        self.snapshots.iter()
    }
}

impl Default for MetricsHistory {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
pub(crate) fn snapshot_with_latency(secs: u64, avg_latency: f64) -> NetworkSnapshot {
    NetworkSnapshot {
        timestamp: SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(secs),
        connected_peers: 10,
        total_bandwidth: 20.0,
        avg_latency,
        block_rate: 0.0,
        failed_conn: 0,
        succeeded_conn: 10,
        mem_pct: 0.0,
        disk_pct: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_exceeds_capacity_and_evicts_oldest() {
        let mut history = MetricsHistory::default();
        for i in 0..250 {
            history.push(snapshot_with_latency(i, i as f64));
            assert!(history.len() <= 100);
        }
        assert_eq!(history.len(), 100);
        assert_eq!(history.iter().next().unwrap().avg_latency, 150.0);
        assert_eq!(history.latest().unwrap().avg_latency, 249.0);
    }

    #[test]
    fn last_n_requires_enough_entries() {
        let mut history = MetricsHistory::new(10);
        for i in 0..4 {
            history.push(snapshot_with_latency(i, i as f64));
        }
        assert!(history.last_n(5).is_none());
        history.push(snapshot_with_latency(4, 4.0));
        history.push(snapshot_with_latency(5, 5.0));
        let window: Vec<f64> = history.last_n(5).unwrap().map(|s| s.avg_latency).collect();
        assert_eq!(window, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }
}
