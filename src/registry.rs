//! Peer registry: the authoritative per-peer reputation and link-quality state.
//!
//! Every mutation takes the current time explicitly so the reputation model can
//! be driven deterministically; callers on the live path pass `SystemTime::now()`.

use crate::error::{GuardError, Result};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

pub const INITIAL_TRUST: f64 = 0.5;
/// Trust assigned when a temporary block lapses; below the default admission bar.
pub const POST_BLOCK_TRUST: f64 = 0.3;
const FAILURE_PENALTY: f64 = 0.8;
const SUCCESS_WEIGHT: f64 = 0.7;
const DOS_WEIGHT: f64 = 0.3;
const DOS_SATURATION: f64 = 10.0;
const IDLE_DECAY: f64 = 0.9;

#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub peer_id: String,
    pub ip_address: String,
    pub trust_score: f64,
    pub successful_blocks: u64,
    pub failed_validations: u64,
    pub dos_attempts: u64,
    pub sybil_flags: u64,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
    pub latency_ms: Option<f64>,
    pub throughput_mbps: Option<f64>,
    pub blocked: bool,
    pub block_reason: String,
    /// `None` while `blocked` means a permanent ban.
    pub block_until: Option<SystemTime>,
    /// Part of the active outbound-consideration set. Pruning clears it.
    pub active: bool,
}

impl PeerRecord {
    fn new(peer_id: &str, ip: &str, now: SystemTime) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            ip_address: ip.to_string(),
            trust_score: INITIAL_TRUST,
            successful_blocks: 0,
            failed_validations: 0,
            dos_attempts: 0,
            sybil_flags: 0,
            first_seen: now,
            last_seen: now,
            latency_ms: None,
            throughput_mbps: None,
            blocked: false,
            block_reason: String::new(),
            block_until: None,
            active: true,
        }
    }

    pub fn interactions(&self) -> u64 {
        self.successful_blocks + self.failed_validations
    }

    pub fn idle_for(&self, now: SystemTime) -> Duration {
        now.duration_since(self.last_seen).unwrap_or_default()
    }

    /// Multiply trust by `factor`, keeping it inside [0, 1].
    pub fn scale_trust(&mut self, factor: f64) {
        self.set_trust(self.trust_score * factor);
    }

    pub fn set_trust(&mut self, value: f64) {
        self.trust_score = if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
    }

    fn recompute(&mut self) {
        let n = self.interactions();
        if n == 0 {
            return;
        }
        let success_rate = self.successful_blocks as f64 / n as f64;
        let dos_penalty = (self.dos_attempts as f64 / DOS_SATURATION).min(1.0);
        self.set_trust(SUCCESS_WEIGHT * success_rate - DOS_WEIGHT * dos_penalty);
    }

    fn unblock(&mut self) {
        self.blocked = false;
        self.block_reason.clear();
        self.block_until = None;
        self.set_trust(POST_BLOCK_TRUST);
    }
}

/// Outcome of one reputation pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReputationSweep {
    pub recomputed: usize,
    pub decayed: usize,
    pub unblocked: Vec<String>,
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    // Ordered by peer id so every pass visits peers deterministically.
    peers: BTreeMap<String, PeerRecord>,
    connections_succeeded: u64,
    connections_failed: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer if unknown. Returns `true` when a new record was created.
    pub fn register(&mut self, peer_id: &str, ip: &str, now: SystemTime) -> bool {
        if self.peers.contains_key(peer_id) {
            return false;
        }
        self.peers.insert(peer_id.to_string(), PeerRecord::new(peer_id, ip, now));
        true
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut PeerRecord> {
        self.peers.get_mut(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerRecord> {
        self.peers.values_mut()
    }

    pub fn active(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values().filter(|p| p.active)
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    pub fn blocked_count(&self) -> usize {
        self.peers.values().filter(|p| p.blocked).count()
    }

    pub fn record_success(&mut self, peer_id: &str, now: SystemTime) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.successful_blocks += 1;
            peer.last_seen = now;
        }
    }

    /// Count a failed validation and cut trust immediately; the periodic
    /// recompute settles the final figure.
    pub fn record_failure(&mut self, peer_id: &str, now: SystemTime) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.failed_validations += 1;
            peer.last_seen = now;
            peer.scale_trust(FAILURE_PENALTY);
        }
    }

    /// A fresh latency sample means the peer is reachable, so a pruned peer
    /// rejoins the active set.
    pub fn record_latency(&mut self, peer_id: &str, latency_ms: f64) -> Result<()> {
        check_sample(peer_id, "latency_ms", latency_ms)?;
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.latency_ms = Some(latency_ms);
            peer.active = true;
        }
        Ok(())
    }

    pub fn record_throughput(&mut self, peer_id: &str, mbps: f64) -> Result<()> {
        check_sample(peer_id, "throughput_mbps", mbps)?;
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.throughput_mbps = Some(mbps);
        }
        Ok(())
    }

    /// Overwrite both point samples and reactivate the peer, as
    /// [`PeerRegistry::record_latency`] does. Nothing is written if either
    /// sample is malformed.
    pub fn record_metrics(&mut self, peer_id: &str, latency_ms: f64, throughput_mbps: f64) -> Result<()> {
        check_sample(peer_id, "latency_ms", latency_ms)?;
        check_sample(peer_id, "throughput_mbps", throughput_mbps)?;
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.latency_ms = Some(latency_ms);
            peer.throughput_mbps = Some(throughput_mbps);
            peer.active = true;
        }
        Ok(())
    }

    pub fn record_connection_outcome(&mut self, succeeded: bool) {
        if succeeded {
            self.connections_succeeded += 1;
        } else {
            self.connections_failed += 1;
        }
    }

    pub fn connections_succeeded(&self) -> u64 {
        self.connections_succeeded
    }

    pub fn connections_failed(&self) -> u64 {
        self.connections_failed
    }

    /// Unknown peers are untrusted.
    pub fn is_trusted(&self, peer_id: &str, min_trust: f64) -> bool {
        self.peers
            .get(peer_id)
            .is_some_and(|p| !p.blocked && p.trust_score >= min_trust)
    }

    /// Block a peer until `until`, or permanently when `until` is `None`.
    pub fn block(&mut self, peer_id: &str, reason: &str, until: Option<SystemTime>) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.blocked = true;
                peer.block_reason = reason.to_string();
                peer.block_until = until;
                true
            }
            None => false,
        }
    }

    /// Multiply a peer's trust by `factor`. No-op for unknown peers.
    pub fn penalize(&mut self, peer_id: &str, factor: f64) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.scale_trust(factor);
        }
    }

    /// Drop a peer from the active set without touching its history.
    pub fn evict(&mut self, peer_id: &str) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) if peer.active => {
                peer.active = false;
                true
            }
            _ => false,
        }
    }

    /// Put a known peer back into the active set, e.g. when it reconnects.
    pub fn reactivate(&mut self, peer_id: &str) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.active = true;
        }
    }

    pub fn note_dos_attempt(&mut self, ip: &str) -> usize {
        let mut touched = 0;
        for peer in self.peers.values_mut().filter(|p| p.ip_address == ip) {
            peer.dos_attempts += 1;
            touched += 1;
        }
        touched
    }

    /// Periodic reputation pass.
    ///
    /// Blocked peers are skipped, except that a block whose deadline has
    /// passed is lifted and trust is reset to [`POST_BLOCK_TRUST`]. Every other
    /// peer with at least one interaction gets its score recomputed from its
    /// counters, then peers idle longer than `idle_decay_after` decay by 10%.
    pub fn recompute_reputation(&mut self, now: SystemTime, idle_decay_after: Duration) -> ReputationSweep {
        let mut sweep = ReputationSweep::default();
        for peer in self.peers.values_mut() {
            if peer.blocked {
                if peer.block_until.is_some_and(|until| now > until) {
                    peer.unblock();
                    sweep.unblocked.push(peer.peer_id.clone());
                }
                continue;
            }
            if peer.interactions() > 0 {
                peer.recompute();
                sweep.recomputed += 1;
            }
            if peer.idle_for(now) > idle_decay_after {
                peer.scale_trust(IDLE_DECAY);
                sweep.decayed += 1;
            }
        }
        sweep
    }

    /// Forget peers idle beyond `retention`. Permanently banned peers are kept
    /// so the ban survives.
    pub fn gc_idle(&mut self, now: SystemTime, retention: Duration) -> Vec<String> {
        let stale: Vec<String> = self
            .peers
            .values()
            .filter(|p| p.idle_for(now) > retention && !(p.blocked && p.block_until.is_none()))
            .map(|p| p.peer_id.clone())
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    /// Mean latency over active peers that have a sample, 0 when none do.
    pub fn avg_latency(&self) -> f64 {
        mean(self.active().filter_map(|p| p.latency_ms))
    }

    pub fn avg_throughput(&self) -> f64 {
        mean(self.active().filter_map(|p| p.throughput_mbps))
    }

    pub fn total_bandwidth(&self) -> f64 {
        self.active().filter_map(|p| p.throughput_mbps).sum()
    }
}

fn check_sample(peer_id: &str, field: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(GuardError::InvalidMetric { peer_id: peer_id.to_string(), field, value })
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 { 0.0 } else { sum / n as f64 }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(86_400);

    fn t0() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    #[test]
    fn register_is_idempotent() {
        let mut reg = PeerRegistry::new();
        assert!(reg.register("a", "10.0.0.1", t0()));
        reg.record_success("a", t0());
        assert!(!reg.register("a", "10.0.0.9", t0() + DAY));
        let peer = reg.get("a").unwrap();
        assert_eq!(peer.ip_address, "10.0.0.1");
        assert_eq!(peer.successful_blocks, 1);
        assert_eq!(peer.trust_score, INITIAL_TRUST);
    }

    #[test]
    fn failure_cuts_trust_immediately() {
        let mut reg = PeerRegistry::new();
        reg.register("a", "10.0.0.1", t0());
        reg.record_failure("a", t0());
        let peer = reg.get("a").unwrap();
        assert_eq!(peer.failed_validations, 1);
        assert!((peer.trust_score - 0.4).abs() < 1e-12);
    }

    #[test]
    fn unknown_peers_are_noops_and_untrusted() {
        let mut reg = PeerRegistry::new();
        reg.record_success("ghost", t0());
        reg.record_failure("ghost", t0());
        reg.record_latency("ghost", 10.0).unwrap();
        reg.penalize("ghost", 0.1);
        assert!(!reg.block("ghost", "x", None));
        assert!(reg.is_empty());
        assert!(!reg.is_trusted("ghost", 0.0));
    }

    #[test]
    fn malformed_samples_are_rejected() {
        let mut reg = PeerRegistry::new();
        reg.register("a", "10.0.0.1", t0());
        assert!(reg.record_latency("a", f64::NAN).is_err());
        assert!(reg.record_throughput("a", -1.0).is_err());
        assert!(reg.record_metrics("a", 20.0, f64::INFINITY).is_err());
        assert_eq!(reg.get("a").unwrap().latency_ms, None);
        reg.record_metrics("a", 20.0, 4.0).unwrap();
        assert_eq!(reg.get("a").unwrap().latency_ms, Some(20.0));
        assert_eq!(reg.get("a").unwrap().throughput_mbps, Some(4.0));
    }

    #[test]
    fn trust_threshold_and_block_gate_admission() {
        let mut reg = PeerRegistry::new();
        reg.register("a", "10.0.0.1", t0());
        assert!(!reg.is_trusted("a", 0.6));
        assert!(reg.is_trusted("a", 0.5));
        reg.block("a", "manual", None);
        assert!(!reg.is_trusted("a", 0.0));
    }

    #[test]
    fn recompute_follows_success_rate_and_dos_penalty() {
        let mut reg = PeerRegistry::new();
        reg.register("clean", "10.0.0.1", t0());
        reg.register("noisy", "10.0.0.2", t0());
        for _ in 0..4 {
            reg.record_success("clean", t0());
            reg.record_success("noisy", t0());
        }
        reg.get_mut("noisy").unwrap().dos_attempts = 10;
        let sweep = reg.recompute_reputation(t0(), DAY);
        assert_eq!(sweep.recomputed, 2);
        let clean = reg.get("clean").unwrap().trust_score;
        let noisy = reg.get("noisy").unwrap().trust_score;
        assert!((clean - 0.7).abs() < 1e-12);
        assert!((noisy - 0.4).abs() < 1e-12);
        assert!(clean > noisy);
    }

    #[test]
    fn idle_peers_decay_once_per_pass() {
        let mut reg = PeerRegistry::new();
        reg.register("idle", "10.0.0.1", t0());
        let later = t0() + DAY + Duration::from_secs(1);
        reg.recompute_reputation(later, DAY);
        assert!((reg.get("idle").unwrap().trust_score - 0.45).abs() < 1e-12);
        reg.recompute_reputation(later, DAY);
        assert!((reg.get("idle").unwrap().trust_score - 0.405).abs() < 1e-12);
    }

    #[test]
    fn lapsed_block_resets_trust() {
        let mut reg = PeerRegistry::new();
        reg.register("a", "10.0.0.1", t0());
        for _ in 0..10 {
            reg.record_success("a", t0());
        }
        reg.block("a", "dos", Some(t0() - Duration::from_secs(1)));
        let sweep = reg.recompute_reputation(t0(), DAY);
        assert_eq!(sweep.unblocked, vec!["a".to_string()]);
        assert_eq!(sweep.recomputed, 0);
        let peer = reg.get("a").unwrap();
        assert!(!peer.blocked);
        assert_eq!(peer.block_until, None);
        assert_eq!(peer.trust_score, POST_BLOCK_TRUST);
    }

    #[test]
    fn active_and_permanent_blocks_skip_recompute() {
        let mut reg = PeerRegistry::new();
        reg.register("temp", "10.0.0.1", t0());
        reg.register("perm", "10.0.0.2", t0());
        reg.record_success("temp", t0());
        reg.block("temp", "x", Some(t0() + DAY));
        reg.block("perm", "x", None);
        let sweep = reg.recompute_reputation(t0() + Duration::from_secs(5), DAY);
        assert!(sweep.unblocked.is_empty());
        assert!(reg.get("temp").unwrap().blocked);
        assert_eq!(reg.get("temp").unwrap().trust_score, INITIAL_TRUST);
        assert!(reg.get("perm").unwrap().blocked);
    }

    #[test]
    fn trust_stays_bounded_under_mixed_histories() {
        let mut reg = PeerRegistry::new();
        reg.register("a", "10.0.0.1", t0());
        let mut now = t0();
        for step in 0u64..500 {
            match step % 7 {
                0 | 3 => reg.record_failure("a", now),
                5 => reg.get_mut("a").unwrap().dos_attempts += 3,
                _ => reg.record_success("a", now),
            }
            if step % 11 == 0 {
                now += DAY * 2;
                reg.recompute_reputation(now, DAY);
            }
            let trust = reg.get("a").unwrap().trust_score;
            assert!((0.0..=1.0).contains(&trust), "step {step}: {trust}");
        }
        reg.get_mut("a").unwrap().scale_trust(1e9);
        assert_eq!(reg.get("a").unwrap().trust_score, 1.0);
        reg.get_mut("a").unwrap().set_trust(f64::NAN);
        assert_eq!(reg.get("a").unwrap().trust_score, 0.0);
    }

    #[test]
    fn gc_forgets_idle_peers_but_keeps_permanent_bans() {
        let mut reg = PeerRegistry::new();
        reg.register("old", "10.0.0.1", t0());
        reg.register("banned", "10.0.0.2", t0());
        reg.register("fresh", "10.0.0.3", t0() + DAY * 8);
        reg.block("banned", "sybil", None);
        let removed = reg.gc_idle(t0() + DAY * 8, DAY * 7);
        assert_eq!(removed, vec!["old".to_string()]);
        assert!(reg.contains("banned"));
        assert!(reg.contains("fresh"));
    }

    #[test]
    fn aggregates_only_count_active_peers() {
        let mut reg = PeerRegistry::new();
        reg.register("a", "10.0.0.1", t0());
        reg.register("b", "10.0.0.2", t0());
        reg.register("c", "10.0.0.3", t0());
        reg.record_metrics("a", 100.0, 2.0).unwrap();
        reg.record_metrics("b", 300.0, 6.0).unwrap();
        reg.record_metrics("c", 900.0, 50.0).unwrap();
        assert!(reg.evict("c"));
        assert!(!reg.evict("c"));
        assert_eq!(reg.active_count(), 2);
        assert_eq!(reg.avg_latency(), 200.0);
        assert_eq!(reg.total_bandwidth(), 8.0);
        assert_eq!(reg.avg_throughput(), 4.0);
        reg.reactivate("c");
        assert_eq!(reg.active_count(), 3);
    }

    #[test]
    fn fresh_samples_bring_pruned_peers_back() {
        let mut reg = PeerRegistry::new();
        reg.register("a", "10.0.0.1", t0());
        reg.register("b", "10.0.0.2", t0());
        reg.evict("a");
        reg.evict("b");
        reg.record_latency("a", 5.0).unwrap();
        reg.record_metrics("b", 8.0, 3.0).unwrap();
        assert!(reg.get("a").unwrap().active);
        assert!(reg.get("b").unwrap().active);

        // A rejected sample leaves the peer out.
        reg.evict("a");
        assert!(reg.record_latency("a", f64::NAN).is_err());
        assert!(!reg.get("a").unwrap().active);
        // Throughput alone says nothing about reachability.
        reg.record_throughput("a", 9.0).unwrap();
        assert!(!reg.get("a").unwrap().active);
    }
}
