//! The shared, lock-guarded engine state and the API the transport, relay and
//! admission layers talk to.
//!
//! Everything mutable lives in one [`GuardState`] behind a single mutex. Both
//! periodic cycles and every external call take that lock for one bounded,
//! in-memory step, so a peer's counters and its derived trust always change
//! together.

use crate::config::{self, Config};
use crate::congestion::{BandwidthAdvisory, CongestionController, PropagationPolicy, Transition};
use crate::error::Result;
use crate::events::{EventLog, SecurityEvent};
use crate::firewall::{AttemptLog, BlockedIps, IpBan};
use crate::history::{MetricsHistory, NetworkSnapshot};
use crate::metrics::Metrics;
use crate::pool::{PoolDecision, PoolOptimizer};
use crate::registry::{PeerRecord, PeerRegistry};
use crate::sampler::{FixedSampler, ResourceSampler};
use crate::status::StatusReport;
use crate::threat::{ThreatClassifier, ThreatDetector, ThreatPolicy, ThreatReport};
use crate::transport::{DetachedTransport, PeerTransport};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const RECENT_THREAT_WINDOW: Duration = Duration::from_secs(300);

pub type GuardHandle = Arc<Guard>;

#[derive(Debug)]
pub struct GuardState {
    pub registry: PeerRegistry,
    pub attempts: AttemptLog,
    pub blocked_ips: BlockedIps,
    pub events: EventLog,
    pub history: MetricsHistory,
    pub congestion: CongestionController,
    /// Preferred outbound peers from the last pool optimization.
    pub outbound: Vec<String>,
}

impl GuardState {
    fn new(cfg: &Config) -> Self {
        Self {
            registry: PeerRegistry::new(),
            attempts: AttemptLog::new(),
            blocked_ips: BlockedIps::new(),
            events: EventLog::new(),
            history: MetricsHistory::new(cfg.congestion.history_capacity),
            congestion: CongestionController::new(&cfg.congestion),
            outbound: Vec::new(),
        }
    }
}

/// Verdict for an inbound connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// The source IP is banned.
    Rejected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub snapshot: NetworkSnapshot,
    pub pool: PoolDecision,
    pub transition: Transition,
    /// Mean latency over the congestion window, once enough history exists.
    pub window_latency_ms: Option<f64>,
    pub congested: bool,
    pub advisory: BandwidthAdvisory,
}

pub struct Guard {
    state: Mutex<GuardState>,
    detector: ThreatDetector,
    pool: PoolOptimizer,
    pool_cfg: config::Pool,
    min_trust: f64,
    sampler: Box<dyn ResourceSampler>,
    transport: Box<dyn PeerTransport>,
    metrics: Option<Metrics>,
}

impl Guard {
    pub fn new(cfg: &Config) -> Self {
        Self {
            state: Mutex::new(GuardState::new(cfg)),
            detector: ThreatDetector::new(ThreatPolicy::from(cfg)),
            pool: PoolOptimizer::new(cfg.pool.preferred_latency_ms),
            pool_cfg: cfg.pool.clone(),
            min_trust: cfg.security.minimum_trust_score,
            sampler: Box::new(FixedSampler::from(&cfg.sampler)),
            transport: Box::new(DetachedTransport),
            metrics: None,
        }
    }

    pub fn with_sampler(mut self, sampler: Box<dyn ResourceSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_transport(mut self, transport: Box<dyn PeerTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_classifier(mut self, classifier: Box<dyn ThreatClassifier>) -> Self {
        self.detector = ThreatDetector::new(self.detector.policy().clone()).with_classifier(classifier);
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn into_handle(self) -> GuardHandle {
        Arc::new(self)
    }

    pub fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_ref()
    }

    // A panic inside a cycle must not wedge the other cycle, so a poisoned
    // lock is taken over as-is.
    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read-only access to the whole state under the lock.
    pub fn inspect<R>(&self, f: impl FnOnce(&GuardState) -> R) -> R {
        f(&self.lock())
    }

    // --- transport-facing recorders ---

    pub fn register_peer(&self, peer_id: &str, ip: &str) -> bool {
        self.register_peer_at(peer_id, ip, SystemTime::now())
    }

    pub fn register_peer_at(&self, peer_id: &str, ip: &str, now: SystemTime) -> bool {
        let created = self.lock().registry.register(peer_id, ip, now);
        if created {
            debug!(peer = %peer_id, %ip, "registered peer");
        }
        created
    }

    pub fn record_connection_attempt(&self, ip: &str) -> Admission {
        self.record_connection_attempt_at(ip, SystemTime::now())
    }

    /// Log an attempt for rate limiting unless the IP is already banned, in
    /// which case it is rejected outright.
    pub fn record_connection_attempt_at(&self, ip: &str, at: SystemTime) -> Admission {
        let mut st = self.lock();
        if st.blocked_ips.is_blocked(ip, at) {
            return Admission::Rejected;
        }
        st.attempts.record(ip, at);
        Admission::Accepted
    }

    /// Same as [`Guard::record_connection_attempt_at`] for a transport that
    /// already knows the peer id. An accepted attempt registers the peer if it
    /// is new and puts a pruned peer back into the active set.
    pub fn record_peer_connection_attempt_at(&self, peer_id: &str, ip: &str, at: SystemTime) -> Admission {
        let mut st = self.lock();
        if st.blocked_ips.is_blocked(ip, at) {
            debug!(peer = %peer_id, %ip, "rejected attempt from banned IP");
            return Admission::Rejected;
        }
        if st.registry.register(peer_id, ip, at) {
            debug!(peer = %peer_id, %ip, "registered peer on first attempt");
        } else {
            st.registry.reactivate(peer_id);
        }
        st.attempts.record(ip, at);
        Admission::Accepted
    }

    pub fn record_connection_outcome(&self, succeeded: bool) {
        self.lock().registry.record_connection_outcome(succeeded);
    }

    pub fn record_block_success(&self, peer_id: &str) {
        self.lock().registry.record_success(peer_id, SystemTime::now());
    }

    pub fn record_block_failure(&self, peer_id: &str) {
        self.lock().registry.record_failure(peer_id, SystemTime::now());
    }

    pub fn record_latency(&self, peer_id: &str, latency_ms: f64) -> Result<()> {
        self.lock().registry.record_latency(peer_id, latency_ms)
    }

    pub fn record_throughput(&self, peer_id: &str, mbps: f64) -> Result<()> {
        self.lock().registry.record_throughput(peer_id, mbps)
    }

    pub fn record_metrics(&self, peer_id: &str, latency_ms: f64, throughput_mbps: f64) -> Result<()> {
        self.lock().registry.record_metrics(peer_id, latency_ms, throughput_mbps)
    }

    // --- admission control ---

    /// Trusted means: known, not blocked, above the trust threshold, and not
    /// sitting behind a banned IP.
    pub fn is_peer_trusted(&self, peer_id: &str) -> bool {
        let st = self.lock();
        let Some(peer) = st.registry.get(peer_id) else {
            return false;
        };
        st.registry.is_trusted(peer_id, self.min_trust)
            && !st.blocked_ips.is_blocked(&peer.ip_address, SystemTime::now())
    }

    pub fn ip_is_blocked(&self, ip: &str) -> bool {
        self.lock().blocked_ips.is_blocked(ip, SystemTime::now())
    }

    /// Ban a peer identity. `None` bans permanently.
    pub fn block_peer(&self, peer_id: &str, reason: &str, duration: Option<Duration>) -> bool {
        let until = deadline(SystemTime::now(), duration);
        let blocked = self.lock().registry.block(peer_id, reason, until);
        if blocked {
            warn!(peer = %peer_id, %reason, ?duration, "blocked peer");
        }
        blocked
    }

    pub fn block_ip(&self, ip: &str, reason: &str, duration: Option<Duration>) {
        let until = deadline(SystemTime::now(), duration);
        let mut st = self.lock();
        st.blocked_ips.block(ip, reason, until);
        st.attempts.forget(ip);
        warn!(%ip, %reason, ?duration, "blocked IP");
    }

    /// Lift an IP ban by hand. Returns whether a ban existed.
    pub fn unblock_ip(&self, ip: &str) -> bool {
        let lifted = self.lock().blocked_ips.unblock(ip);
        if lifted {
            info!(%ip, "IP ban lifted by operator");
        }
        lifted
    }

    /// The ban on `ip`, including lapsed bans not yet swept.
    pub fn ip_ban(&self, ip: &str) -> Option<IpBan> {
        self.lock().blocked_ips.get(ip).cloned()
    }

    // --- block relay ---

    pub fn propagation_policy(&self, block_size_kb: usize) -> PropagationPolicy {
        self.lock().congestion.propagation_policy(block_size_kb)
    }

    pub fn is_congested(&self) -> bool {
        self.lock().congestion.is_congested()
    }

    // --- queries ---

    pub fn peer(&self, peer_id: &str) -> Option<PeerRecord> {
        self.lock().registry.get(peer_id).cloned()
    }

    pub fn preferred_outbound(&self) -> Vec<String> {
        self.lock().outbound.clone()
    }

    pub fn recent_events(&self, window: Duration) -> Vec<SecurityEvent> {
        self.lock().events.recent(SystemTime::now(), window).cloned().collect()
    }

    pub fn status(&self, now: SystemTime) -> StatusReport {
        let st = self.lock();
        self.status_locked(&st, now)
    }

    fn status_locked(&self, st: &GuardState, now: SystemTime) -> StatusReport {
        let trusted_peers = st
            .registry
            .iter()
            .filter(|p| {
                !p.blocked && p.trust_score >= self.min_trust && !st.blocked_ips.is_blocked(&p.ip_address, now)
            })
            .count();
        StatusReport {
            peers_total: st.registry.len(),
            peers_active: st.registry.active_count(),
            trusted_peers,
            blocked_peers: st.registry.blocked_count(),
            blocked_ips: st.blocked_ips.len(),
            recent_threats: st.events.recent(now, RECENT_THREAT_WINDOW).count(),
            total_events: st.events.len(),
            preferred_outbound: st.outbound.len(),
            max_peers: self.pool_cfg.max_peers,
            avg_latency_ms: st.registry.avg_latency(),
            bandwidth_mbps: st.registry.total_bandwidth(),
            history_len: st.history.len(),
            congested: st.congestion.is_congested(),
        }
    }

    // --- cycles ---

    /// Detectors, reputation recompute and cleanup, as one step under the lock.
    pub fn security_cycle(&self, now: SystemTime) -> ThreatReport {
        let (report, status) = {
            let mut guard = self.lock();
            let st = &mut *guard;
            let report = self.detector.run_cycle(
                &mut st.registry,
                &mut st.attempts,
                &mut st.blocked_ips,
                &mut st.events,
                now,
            );
            (report, self.status_locked(st, now))
        };
        if let Some(m) = &self.metrics {
            m.observe_events(&report.events);
            m.observe_status(&status);
        }
        info!(
            events = report.events.len(),
            blocked_ips = report.blocked_ips.len(),
            unblocked = report.reputation.unblocked.len(),
            trusted = status.trusted_peers,
            blocked_peers = status.blocked_peers,
            recent_threats = status.recent_threats,
            "security cycle complete"
        );
        report
    }

    /// Snapshot, pool optimization and congestion evaluation. Evicted peers
    /// are handed to the transport after the lock is released.
    pub fn health_cycle(&self, now: SystemTime) -> Result<HealthReport> {
        let usage = self.sampler.sample().check()?;
        let (report, status) = {
            let mut guard = self.lock();
            let st = &mut *guard;
            let snapshot = NetworkSnapshot {
                timestamp: now,
                connected_peers: st.registry.active_count(),
                total_bandwidth: st.registry.total_bandwidth(),
                avg_latency: st.registry.avg_latency(),
                block_rate: usage.block_rate,
                failed_conn: st.registry.connections_failed(),
                succeeded_conn: st.registry.connections_succeeded(),
                mem_pct: usage.mem_pct,
                disk_pct: usage.disk_pct,
            };
            st.history.push(snapshot.clone());

            let pool = self.pool.optimize(
                &mut st.registry,
                self.pool_cfg.max_peers,
                self.pool_cfg.max_outbound_peers,
            );
            if !pool.skipped {
                st.outbound = pool.preferred.clone();
            }

            let transition = st.congestion.evaluate(&st.history);
            let advisory = st.congestion.bandwidth_advisory(st.registry.avg_throughput());
            let report = HealthReport {
                snapshot,
                pool,
                transition,
                window_latency_ms: st.congestion.last_mean_latency(),
                congested: st.congestion.is_congested(),
                advisory,
            };
            (report, self.status_locked(st, now))
        };

        for peer_id in &report.pool.evicted {
            self.transport.disconnect(peer_id, "pruned from connection pool");
        }
        self.log_health(&report);
        if let Some(m) = &self.metrics {
            m.observe_evictions(report.pool.evicted.len());
            m.observe_status(&status);
        }
        info!("\n{status}");
        Ok(report)
    }

    fn log_health(&self, report: &HealthReport) {
        let snap = &report.snapshot;
        debug!(
            peers = snap.connected_peers,
            max_peers = self.pool_cfg.max_peers,
            bandwidth_mbps = snap.total_bandwidth,
            latency_ms = snap.avg_latency,
            block_rate = snap.block_rate,
            "network snapshot"
        );
        if report.pool.skipped {
            debug!(peers = snap.connected_peers, "peer pool healthy, no optimization needed");
        } else {
            info!(
                preferred = report.pool.preferred.len(),
                evicted = report.pool.evicted.len(),
                "optimized peer pool"
            );
        }
        let window_ms = report.window_latency_ms.unwrap_or(snap.avg_latency);
        match report.transition {
            Transition::Entered => warn!(window_latency_ms = window_ms, "network congestion detected"),
            Transition::Cleared => info!(window_latency_ms = window_ms, "network congestion cleared"),
            Transition::Held | Transition::Insufficient => {}
        }
        match report.advisory {
            BandwidthAdvisory::CompressAndBatch => info!("low bandwidth, recommend block compression and batching"),
            BandwidthAdvisory::DisableCompression => info!("high bandwidth, recommend disabling compression"),
            BandwidthAdvisory::Unchanged => {}
        }
    }
}

/// `None` or a deadline past the end of representable time means permanent.
fn deadline(now: SystemTime, duration: Option<Duration>) -> Option<SystemTime> {
    duration.and_then(|d| now.checked_add(d))
}
