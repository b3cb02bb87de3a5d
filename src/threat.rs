//! Threat detection over the peer registry.
//!
//! There is no explicit per-peer state machine. Each detector reads the
//! registry, may lower trust or ban an IP, and records what it did in the event
//! log. A security cycle runs them in a fixed order:
//!
//! DoS -> Sybil -> Eclipse -> VDF timing -> classifier -> reputation -> cleanup
//!
//! DoS runs first so that its `dos_attempts` bumps are already in place when
//! the reputation pass recomputes trust, and so the classifier sees only the
//! attempt rates of IPs that were not just banned.

use crate::config::Config;
use crate::error::GuardError;
use crate::events::{Action, AttackType, EventLog, SecurityEvent, Severity};
use crate::firewall::{AttemptLog, BlockedIps};
use crate::registry::{PeerRegistry, ReputationSweep};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const SYBIL_PENALTY: f64 = 0.5;
const ECLIPSE_PENALTY: f64 = 0.8;
const VDF_PENALTY: f64 = 0.6;

/// Inputs handed to an offline-trained classifier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerFeatures {
    /// Connection attempts per second from the peer's IP over the attempt window.
    pub msg_rate: f64,
    /// Validated plus failed blocks.
    pub history: f64,
    pub reputation: f64,
}

/// A model trained out of band. Returns a threat probability in [0, 1].
pub trait ThreatClassifier: Send + Sync {
    fn classify(&self, features: &PeerFeatures) -> Result<f64, GuardError>;
}

#[derive(Debug, Clone)]
pub struct ThreatPolicy {
    pub rate_limit: usize,
    pub attempt_window: Duration,
    pub blacklist_duration: Duration,
    pub min_trust: f64,
    pub sybil_min_peers: usize,
    pub eclipse_min_blocks: u64,
    pub vdf_min_blocks: u64,
    pub expected_block_delay: Duration,
    pub vdf_anomaly_threshold: Duration,
    pub idle_decay_after: Duration,
    pub peer_retention: Duration,
    pub event_retention: Duration,
    pub classifier_threshold: f64,
}

impl From<&Config> for ThreatPolicy {
    fn from(cfg: &Config) -> Self {
        let sec = &cfg.security;
        Self {
            rate_limit: cfg.dos_protection.rate_limit_requests_per_second,
            attempt_window: cfg.dos_protection.window(),
            blacklist_duration: cfg.dos_protection.blacklist_duration(),
            min_trust: sec.minimum_trust_score,
            sybil_min_peers: sec.sybil_min_peers,
            eclipse_min_blocks: sec.eclipse_min_blocks,
            vdf_min_blocks: sec.vdf_min_blocks,
            expected_block_delay: Duration::from_secs(sec.expected_block_delay_secs),
            vdf_anomaly_threshold: Duration::from_secs(sec.vdf_anomaly_threshold_secs),
            idle_decay_after: sec.idle_decay_after(),
            peer_retention: sec.peer_retention(),
            event_retention: sec.event_retention(),
            classifier_threshold: sec.classifier_threshold,
        }
    }
}

impl Default for ThreatPolicy {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// What one security cycle did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ThreatReport {
    pub events: Vec<SecurityEvent>,
    pub blocked_ips: Vec<String>,
    pub reputation: ReputationSweep,
    pub purged_events: usize,
    pub expired_ip_bans: Vec<String>,
    pub forgotten_peers: Vec<String>,
}

impl ThreatReport {
    pub fn count(&self, attack: AttackType) -> usize {
        self.events.iter().filter(|e| e.attack_type == attack).count()
    }
}

pub struct ThreatDetector {
    policy: ThreatPolicy,
    classifier: Option<Box<dyn ThreatClassifier>>,
}

impl ThreatDetector {
    pub fn new(policy: ThreatPolicy) -> Self {
        Self { policy, classifier: None }
    }

    pub fn with_classifier(mut self, classifier: Box<dyn ThreatClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn policy(&self) -> &ThreatPolicy {
        &self.policy
    }

    /// One full security cycle.
    pub fn run_cycle(
        &self,
        registry: &mut PeerRegistry,
        attempts: &mut AttemptLog,
        blocked_ips: &mut BlockedIps,
        log: &mut EventLog,
        now: SystemTime,
    ) -> ThreatReport {
        let mut report = ThreatReport::default();
        let rates = self.detect_dos(registry, attempts, blocked_ips, now, &mut report);
        self.detect_sybil(registry, now, &mut report);
        self.detect_eclipse(registry, now, &mut report);
        self.detect_vdf_manipulation(registry, now, &mut report);
        self.apply_classifier(registry, &rates, now, &mut report);

        report.reputation = registry.recompute_reputation(now, self.policy.idle_decay_after);
        for peer_id in &report.reputation.unblocked {
            info!(peer = %peer_id, "block lapsed, trust reset");
        }

        for event in &report.events {
            log.push(event.clone());
        }
        self.cleanup(registry, blocked_ips, log, now, &mut report);
        report
    }

    /// Ban every IP whose attempts in the trailing window exceed the rate
    /// limit. Returns the surviving per-IP attempt counts for the classifier.
    pub fn detect_dos(
        &self,
        registry: &mut PeerRegistry,
        attempts: &mut AttemptLog,
        blocked_ips: &mut BlockedIps,
        now: SystemTime,
        report: &mut ThreatReport,
    ) -> HashMap<String, usize> {
        let mut rates = HashMap::new();
        for (ip, count) in attempts.prune(now, self.policy.attempt_window) {
            if count <= self.policy.rate_limit {
                rates.insert(ip, count);
                continue;
            }
            // A deadline past the end of time is a permanent ban.
            let until = now.checked_add(self.policy.blacklist_duration);
            blocked_ips.block(&ip, "DoS attack", until);
            attempts.forget(&ip);
            let peers = registry.note_dos_attempt(&ip);
            warn!(
                %ip, attempts = count, window_secs = self.policy.attempt_window.as_secs(),
                peers, "blocked IP for DoS"
            );
            report.events.push(SecurityEvent {
                timestamp: now,
                attack_type: AttackType::Dos,
                subject: ip.clone(),
                severity: Severity::Critical,
                description: format!(
                    "DoS attempt: {} requests in {}s",
                    count,
                    self.policy.attempt_window.as_secs()
                ),
                action_taken: Action::Blocked,
            });
            report.blocked_ips.push(ip);
        }
        rates
    }

    /// Many low-trust identities behind one IP. The penalty is soft because
    /// NAT can put honest peers behind a shared address.
    pub fn detect_sybil(&self, registry: &mut PeerRegistry, now: SystemTime, report: &mut ThreatReport) {
        let mut by_ip: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for peer in registry.iter().filter(|p| p.trust_score < self.policy.min_trust) {
            by_ip.entry(peer.ip_address.clone()).or_default().push(peer.peer_id.clone());
        }
        for (ip, suspects) in by_ip {
            if suspects.len() < self.policy.sybil_min_peers {
                continue;
            }
            for peer_id in &suspects {
                if let Some(peer) = registry.get_mut(peer_id) {
                    peer.scale_trust(SYBIL_PENALTY);
                    peer.sybil_flags += 1;
                }
            }
            warn!(%ip, suspects = suspects.len(), "sybil cluster detected");
            report.events.push(SecurityEvent {
                timestamp: now,
                attack_type: AttackType::Sybil,
                subject: ip.clone(),
                severity: Severity::Warning,
                description: format!("Sybil attack: {} suspicious peers from {}", suspects.len(), ip),
                action_taken: Action::Penalized,
            });
        }
    }

    /// A long record with zero failed validations is statistically unlikely
    /// for an honest peer.
    pub fn detect_eclipse(&self, registry: &mut PeerRegistry, now: SystemTime, report: &mut ThreatReport) {
        for peer in registry.iter_mut() {
            if peer.successful_blocks <= self.policy.eclipse_min_blocks || peer.failed_validations != 0 {
                continue;
            }
            peer.scale_trust(ECLIPSE_PENALTY);
            debug!(peer = %peer.peer_id, blocks = peer.successful_blocks, "perfect validation record");
            report.events.push(SecurityEvent {
                timestamp: now,
                attack_type: AttackType::Eclipse,
                subject: peer.peer_id.clone(),
                severity: Severity::Caution,
                description: format!(
                    "abnormal validation pattern: {} blocks, no failures",
                    peer.successful_blocks
                ),
                action_taken: Action::Monitored,
            });
        }
    }

    /// Timing heuristic only: blocks arriving faster than the delay function
    /// allows. No proof is checked here.
    pub fn detect_vdf_manipulation(&self, registry: &mut PeerRegistry, now: SystemTime, report: &mut ThreatReport) {
        let threshold = self.policy.vdf_anomaly_threshold.as_secs_f64();
        for peer in registry.iter_mut() {
            if peer.successful_blocks <= self.policy.vdf_min_blocks {
                continue;
            }
            let lifetime = now.duration_since(peer.first_seen).unwrap_or_default().as_secs_f64();
            let per_block = lifetime / peer.successful_blocks as f64;
            if per_block >= threshold {
                continue;
            }
            peer.scale_trust(VDF_PENALTY);
            warn!(peer = %peer.peer_id, per_block_secs = per_block, "block cadence too fast");
            report.events.push(SecurityEvent {
                timestamp: now,
                attack_type: AttackType::VdfManipulation,
                subject: peer.peer_id.clone(),
                severity: Severity::Warning,
                description: format!(
                    "Block time too fast: {:.0}s (expected {}s)",
                    per_block,
                    self.policy.expected_block_delay.as_secs()
                ),
                action_taken: Action::Investigated,
            });
        }
    }

    /// Consult the offline classifier, if one is installed. A flagged peer's
    /// trust is capped at `1 - probability`.
    pub fn apply_classifier(
        &self,
        registry: &mut PeerRegistry,
        rates: &HashMap<String, usize>,
        now: SystemTime,
        report: &mut ThreatReport,
    ) {
        let Some(classifier) = &self.classifier else {
            return;
        };
        let window = self.policy.attempt_window.as_secs_f64().max(1.0);
        for peer in registry.iter_mut().filter(|p| !p.blocked) {
            let features = PeerFeatures {
                msg_rate: rates.get(&peer.ip_address).copied().unwrap_or(0) as f64 / window,
                history: peer.interactions() as f64,
                reputation: peer.trust_score,
            };
            let probability = match classifier.classify(&features) {
                Ok(p) if p.is_finite() => p.clamp(0.0, 1.0),
                Ok(p) => {
                    warn!(peer = %peer.peer_id, probability = p, "classifier returned a non-finite score");
                    continue;
                }
                Err(e) => {
                    warn!(peer = %peer.peer_id, error = %e, "classifier failed, using heuristics only");
                    continue;
                }
            };
            if probability < self.policy.classifier_threshold {
                continue;
            }
            peer.set_trust(peer.trust_score.min(1.0 - probability));
            report.events.push(SecurityEvent {
                timestamp: now,
                attack_type: AttackType::Unknown,
                subject: peer.peer_id.clone(),
                severity: Severity::Warning,
                description: format!("classifier threat probability {:.2}", probability),
                action_taken: Action::Penalized,
            });
        }
    }

    /// Age out events, lapsed IP bans and long-idle peers.
    pub fn cleanup(
        &self,
        registry: &mut PeerRegistry,
        blocked_ips: &mut BlockedIps,
        log: &mut EventLog,
        now: SystemTime,
        report: &mut ThreatReport,
    ) {
        report.purged_events = log.purge_older_than(now, self.policy.event_retention);
        report.expired_ip_bans = blocked_ips.gc_expired(now);
        for ip in &report.expired_ip_bans {
            info!(%ip, "IP ban lapsed");
        }
        report.forgotten_peers = registry.gc_idle(now, self.policy.peer_retention);
        if !report.forgotten_peers.is_empty() {
            debug!(count = report.forgotten_peers.len(), "forgot idle peers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    struct Fixture {
        detector: ThreatDetector,
        registry: PeerRegistry,
        attempts: AttemptLog,
        blocked: BlockedIps,
        log: EventLog,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                detector: ThreatDetector::new(ThreatPolicy::default()),
                registry: PeerRegistry::new(),
                attempts: AttemptLog::new(),
                blocked: BlockedIps::new(),
                log: EventLog::new(),
            }
        }

        fn cycle(&mut self, now: SystemTime) -> ThreatReport {
            self.detector.run_cycle(
                &mut self.registry,
                &mut self.attempts,
                &mut self.blocked,
                &mut self.log,
                now,
            )
        }

        fn hammer(&mut self, ip: &str, n: u64) {
            for i in 0..n {
                self.attempts.record(ip, t0() + Duration::from_millis(i * 100));
            }
        }
    }

    #[test]
    fn dos_burst_blocks_ip_once() {
        let mut fx = Fixture::new();
        fx.registry.register("p", "6.6.6.6", t0());
        fx.hammer("6.6.6.6", 101);
        let now = t0() + Duration::from_secs(20);
        let report = fx.cycle(now);
        assert_eq!(report.blocked_ips, vec!["6.6.6.6".to_string()]);
        assert_eq!(report.count(AttackType::Dos), 1);
        assert_eq!(report.events[0].severity, Severity::Critical);
        assert!(fx.blocked.is_blocked("6.6.6.6", now));
        assert_eq!(fx.registry.get("p").unwrap().dos_attempts, 1);

        let again = fx.cycle(now + Duration::from_secs(10));
        assert_eq!(again.count(AttackType::Dos), 0);
        assert_eq!(fx.log.iter().filter(|e| e.attack_type == AttackType::Dos).count(), 1);
    }

    #[test]
    fn unrepresentable_ban_deadline_becomes_permanent() {
        let mut fx = Fixture::new();
        let policy = ThreatPolicy {
            blacklist_duration: Duration::MAX,
            event_retention: Duration::MAX,
            peer_retention: Duration::MAX,
            ..ThreatPolicy::default()
        };
        fx.detector = ThreatDetector::new(policy);
        fx.hammer("6.6.6.7", 101);
        let now = t0() + Duration::from_secs(20);
        let report = fx.cycle(now);
        assert_eq!(report.blocked_ips, vec!["6.6.6.7".to_string()]);
        assert_eq!(fx.blocked.get("6.6.6.7").unwrap().until, None);
        assert_eq!(fx.attempts.count("6.6.6.7"), 0);
    }

    #[test]
    fn attempts_at_or_below_threshold_do_not_block() {
        let mut fx = Fixture::new();
        fx.hammer("7.7.7.7", 99);
        fx.hammer("8.8.8.8", 100);
        let report = fx.cycle(t0() + Duration::from_secs(20));
        assert!(report.blocked_ips.is_empty());
        assert!(fx.log.is_empty());
        assert_eq!(fx.attempts.count("8.8.8.8"), 100);
    }

    #[test]
    fn stale_attempts_do_not_count() {
        let mut fx = Fixture::new();
        fx.hammer("6.6.6.6", 101);
        let report = fx.cycle(t0() + Duration::from_secs(120));
        assert!(report.blocked_ips.is_empty());
        assert_eq!(fx.attempts.count("6.6.6.6"), 0);
    }

    #[test]
    fn five_low_trust_peers_on_one_ip_are_halved() {
        let mut fx = Fixture::new();
        for i in 0..5 {
            fx.registry.register(&format!("s{i}"), "9.9.9.9", t0());
            fx.registry.get_mut(&format!("s{i}")).unwrap().trust_score = 0.4;
        }
        let mut report = ThreatReport::default();
        fx.detector.detect_sybil(&mut fx.registry, t0(), &mut report);
        assert_eq!(report.count(AttackType::Sybil), 1);
        assert_eq!(report.events[0].severity, Severity::Warning);
        for i in 0..5 {
            let peer = fx.registry.get(&format!("s{i}")).unwrap();
            assert_eq!(peer.trust_score, 0.2);
            assert_eq!(peer.sybil_flags, 1);
        }
    }

    #[test]
    fn four_low_trust_peers_are_tolerated() {
        let mut fx = Fixture::new();
        for i in 0..4 {
            fx.registry.register(&format!("s{i}"), "9.9.9.9", t0());
            fx.registry.get_mut(&format!("s{i}")).unwrap().trust_score = 0.4;
        }
        // Trusted peers on the same IP are not suspects.
        fx.registry.register("honest", "9.9.9.9", t0());
        fx.registry.get_mut("honest").unwrap().trust_score = 0.9;
        let mut report = ThreatReport::default();
        fx.detector.detect_sybil(&mut fx.registry, t0(), &mut report);
        assert!(report.events.is_empty());
        assert_eq!(fx.registry.get("s0").unwrap().trust_score, 0.4);
    }

    #[test]
    fn perfect_long_record_is_flagged_as_eclipse() {
        let mut fx = Fixture::new();
        fx.registry.register("perfect", "1.1.1.1", t0());
        fx.registry.register("noisy", "1.1.1.2", t0());
        for id in ["perfect", "noisy"] {
            let peer = fx.registry.get_mut(id).unwrap();
            peer.successful_blocks = 1_001;
            peer.trust_score = 1.0;
        }
        fx.registry.get_mut("noisy").unwrap().failed_validations = 1;
        let mut report = ThreatReport::default();
        fx.detector.detect_eclipse(&mut fx.registry, t0(), &mut report);
        assert_eq!(report.count(AttackType::Eclipse), 1);
        assert_eq!(report.events[0].subject, "perfect");
        assert_eq!(report.events[0].severity, Severity::Caution);
        assert!((fx.registry.get("perfect").unwrap().trust_score - 0.8).abs() < 1e-12);
        assert_eq!(fx.registry.get("noisy").unwrap().trust_score, 1.0);
    }

    #[test]
    fn fast_block_cadence_is_flagged() {
        let mut fx = Fixture::new();
        fx.registry.register("fast", "1.1.1.1", t0());
        fx.registry.register("paced", "1.1.1.2", t0());
        fx.registry.get_mut("fast").unwrap().successful_blocks = 11;
        fx.registry.get_mut("paced").unwrap().successful_blocks = 11;
        let now = t0() + Duration::from_secs(11 * 1_800);
        fx.registry.get_mut("fast").unwrap().first_seen = now - Duration::from_secs(11 * 60);

        let mut report = ThreatReport::default();
        fx.detector.detect_vdf_manipulation(&mut fx.registry, now, &mut report);
        assert_eq!(report.count(AttackType::VdfManipulation), 1);
        assert_eq!(report.events[0].subject, "fast");
        assert!((fx.registry.get("fast").unwrap().trust_score - 0.3).abs() < 1e-12);
        assert_eq!(fx.registry.get("paced").unwrap().trust_score, 0.5);
    }

    #[test]
    fn ten_blocks_is_not_enough_history_for_timing() {
        let mut fx = Fixture::new();
        fx.registry.register("young", "1.1.1.1", t0());
        fx.registry.get_mut("young").unwrap().successful_blocks = 10;
        let mut report = ThreatReport::default();
        fx.detector.detect_vdf_manipulation(&mut fx.registry, t0(), &mut report);
        assert!(report.events.is_empty());
    }

    struct Fixed(f64);

    impl ThreatClassifier for Fixed {
        fn classify(&self, _features: &PeerFeatures) -> Result<f64, GuardError> {
            Ok(self.0)
        }
    }

    struct Broken;

    impl ThreatClassifier for Broken {
        fn classify(&self, _features: &PeerFeatures) -> Result<f64, GuardError> {
            Err(GuardError::Classifier("model not loaded".into()))
        }
    }

    #[test]
    fn classifier_caps_trust_of_flagged_peers() {
        let mut fx = Fixture::new();
        fx.detector = ThreatDetector::new(ThreatPolicy::default()).with_classifier(Box::new(Fixed(0.9)));
        fx.registry.register("p", "1.1.1.1", t0());
        let mut report = ThreatReport::default();
        fx.detector.apply_classifier(&mut fx.registry, &HashMap::new(), t0(), &mut report);
        assert_eq!(report.count(AttackType::Unknown), 1);
        assert!((fx.registry.get("p").unwrap().trust_score - 0.1).abs() < 1e-12);
    }

    #[test]
    fn classifier_below_threshold_or_failing_changes_nothing() {
        let classifiers: Vec<Box<dyn ThreatClassifier>> = vec![Box::new(Fixed(0.5)), Box::new(Broken)];
        for classifier in classifiers {
            let mut fx = Fixture::new();
            fx.detector = ThreatDetector::new(ThreatPolicy::default()).with_classifier(classifier);
            fx.registry.register("p", "1.1.1.1", t0());
            let mut report = ThreatReport::default();
            fx.detector.apply_classifier(&mut fx.registry, &HashMap::new(), t0(), &mut report);
            assert!(report.events.is_empty());
            assert_eq!(fx.registry.get("p").unwrap().trust_score, 0.5);
        }
    }

    #[test]
    fn cycle_unblocks_lapsed_peers_and_expires_old_state() {
        let mut fx = Fixture::new();
        let now = t0() + Duration::from_secs(40 * 86_400);
        fx.registry.register("p", "1.1.1.1", now);
        fx.registry.block("p", "manual", Some(now - Duration::from_secs(1)));
        fx.blocked.block("2.2.2.2", "DoS attack", Some(now - Duration::from_secs(1)));
        fx.log.push(SecurityEvent {
            timestamp: t0(),
            attack_type: AttackType::Dos,
            subject: "2.2.2.2".into(),
            severity: Severity::Critical,
            description: "old".into(),
            action_taken: Action::Blocked,
        });
        fx.registry.register("gone", "3.3.3.3", t0());

        let report = fx.cycle(now);
        assert_eq!(report.reputation.unblocked, vec!["p".to_string()]);
        assert_eq!(fx.registry.get("p").unwrap().trust_score, 0.3);
        assert_eq!(report.purged_events, 1);
        assert_eq!(report.expired_ip_bans, vec!["2.2.2.2".to_string()]);
        assert_eq!(report.forgotten_peers, vec!["gone".to_string()]);
        assert!(fx.log.is_empty());
    }
}
