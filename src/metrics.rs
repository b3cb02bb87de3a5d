use crate::{events::SecurityEvent, status::StatusReport};
use anyhow::Result;
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::thread;
use tracing::{error, info};

/// Prometheus collectors fed by both cycles.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    peers: IntGauge,
    active_peers: IntGauge,
    trusted_peers: IntGauge,
    blocked_peers: IntGauge,
    blocked_ips: IntGauge,
    avg_latency: Gauge,
    bandwidth: Gauge,
    congested: IntGauge,
    events: IntCounterVec,
    cycle_failures: IntCounterVec,
    evictions: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        // Prefix metrics with `peerguard_` for namespacing.
        let peers = IntGauge::new("peerguard_peers", "Known peers")?;
        let active_peers = IntGauge::new("peerguard_active_peers", "Peers in the active outbound set")?;
        let trusted_peers = IntGauge::new("peerguard_trusted_peers", "Peers above the trust threshold")?;
        let blocked_peers = IntGauge::new("peerguard_blocked_peers", "Blocked peer identities")?;
        let blocked_ips = IntGauge::new("peerguard_blocked_ips", "Banned IP addresses")?;
        let avg_latency = Gauge::new("peerguard_avg_latency_ms", "Mean latency over active peers")?;
        let bandwidth = Gauge::new("peerguard_bandwidth_mbps", "Summed peer throughput")?;
        let congested = IntGauge::new("peerguard_congested", "1 while congestion is declared")?;
        let events = IntCounterVec::new(
            Opts::new("peerguard_security_events_total", "Security events by attack type"),
            &["attack_type", "severity"],
        )?;
        let cycle_failures = IntCounterVec::new(
            Opts::new("peerguard_cycle_failures_total", "Cycle iterations that failed"),
            &["cycle"],
        )?;
        let evictions = IntCounter::new("peerguard_pool_evictions_total", "Peers pruned from the pool")?;

        registry.register(Box::new(peers.clone()))?;
        registry.register(Box::new(active_peers.clone()))?;
        registry.register(Box::new(trusted_peers.clone()))?;
        registry.register(Box::new(blocked_peers.clone()))?;
        registry.register(Box::new(blocked_ips.clone()))?;
        registry.register(Box::new(avg_latency.clone()))?;
        registry.register(Box::new(bandwidth.clone()))?;
        registry.register(Box::new(congested.clone()))?;
        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(cycle_failures.clone()))?;
        registry.register(Box::new(evictions.clone()))?;

        Ok(Self {
            registry,
            peers,
            active_peers,
            trusted_peers,
            blocked_peers,
            blocked_ips,
            avg_latency,
            bandwidth,
            congested,
            events,
            cycle_failures,
            evictions,
        })
    }

    pub fn observe_status(&self, status: &StatusReport) {
        self.peers.set(status.peers_total as i64);
        self.active_peers.set(status.peers_active as i64);
        self.trusted_peers.set(status.trusted_peers as i64);
        self.blocked_peers.set(status.blocked_peers as i64);
        self.blocked_ips.set(status.blocked_ips as i64);
        self.avg_latency.set(status.avg_latency_ms);
        self.bandwidth.set(status.bandwidth_mbps);
        self.congested.set(status.congested as i64);
    }

    pub fn observe_events(&self, events: &[SecurityEvent]) {
        for e in events {
            let severity = e.severity.to_string();
            self.events
                .with_label_values(&[e.attack_type.as_str(), severity.as_str()])
                .inc();
        }
    }

    pub fn observe_evictions(&self, n: usize) {
        self.evictions.inc_by(n as u64);
    }

    pub fn observe_failure(&self, cycle: &str) {
        self.cycle_failures.with_label_values(&[cycle]).inc();
    }

    pub fn gather_text(&self) -> Result<Vec<u8>> {
        let mut buffer = vec![];
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

/// Serve the registry in Prometheus text format on `cfg.bind` from a plain thread.
pub fn serve(cfg: crate::config::Metrics, metrics: Metrics) -> Result<()> {
    let content_type = "Content-Type: text/plain; version=0.0.4; charset=utf-8"
        .parse::<tiny_http::Header>()
        .map_err(|_| anyhow::anyhow!("invalid metrics content-type header"))?;
    let server = tiny_http::Server::http(&cfg.bind)
        .map_err(|e| anyhow::anyhow!("could not start metrics server on {}: {}", cfg.bind, e))?;
    info!(bind = %cfg.bind, "metrics endpoint listening");

    thread::spawn(move || {
        for request in server.incoming_requests() {
            let buffer = match metrics.gather_text() {
                Ok(b) => b,
                Err(e) => {
                    error!(error = %e, "could not encode metrics");
                    continue;
                }
            };
            let response = tiny_http::Response::from_data(buffer).with_header(content_type.clone());
            let _ = request.respond(response);
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Action, AttackType, Severity};
    use std::time::SystemTime;

    #[test]
    fn exports_status_and_event_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.observe_status(&StatusReport { peers_total: 7, congested: true, ..StatusReport::default() });
        metrics.observe_events(&[SecurityEvent {
            timestamp: SystemTime::now(),
            attack_type: AttackType::Dos,
            subject: "1.2.3.4".into(),
            severity: Severity::Critical,
            description: "burst".into(),
            action_taken: Action::Blocked,
        }]);
        let text = String::from_utf8(metrics.gather_text().unwrap()).unwrap();
        assert!(text.contains("peerguard_peers 7"));
        assert!(text.contains("peerguard_congested 1"));
        assert!(text.contains("attack_type=\"dos\""));
    }
}
