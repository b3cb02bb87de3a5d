use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};
use anyhow::{ensure, Context, Result};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub pool: Pool,
    #[serde(default)]
    pub dos_protection: DosProtection,
    #[serde(default)]
    pub security: Security,
    #[serde(default)]
    pub congestion: Congestion,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub sampler: Sampler,
    #[serde(default)]
    pub metrics: Metrics,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Pool {
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    #[serde(default = "default_max_outbound")]
    pub max_outbound_peers: usize,
    #[serde(default = "default_max_inbound")]
    pub max_inbound_peers: usize,
    /// Peers faster than this are preferred for outbound slots.
    #[serde(default = "default_preferred_latency")]
    pub preferred_latency_ms: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DosProtection {
    /// Attempts tolerated per IP inside the sliding window before a ban.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_requests_per_second: usize,
    #[serde(default = "default_rate_window")]
    pub window_secs: u64,
    #[serde(default = "default_blacklist_minutes")]
    pub blacklist_duration_minutes: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Security {
    #[serde(default = "default_min_trust")]
    pub minimum_trust_score: f64,
    #[serde(default = "default_sybil_min_peers")]
    pub sybil_min_peers: usize,
    #[serde(default = "default_eclipse_min_blocks")]
    pub eclipse_min_blocks: u64,
    #[serde(default = "default_vdf_min_blocks")]
    pub vdf_min_blocks: u64,
    #[serde(default = "default_expected_block_delay")]
    pub expected_block_delay_secs: u64,
    /// Average seconds per block below which timing is flagged.
    #[serde(default = "default_vdf_anomaly")]
    pub vdf_anomaly_threshold_secs: u64,
    #[serde(default = "default_idle_decay_hours")]
    pub idle_decay_hours: u64,
    #[serde(default = "default_peer_retention_hours")]
    pub peer_retention_hours: u64,
    #[serde(default = "default_event_retention_days")]
    pub event_retention_days: u64,
    #[serde(default = "default_classifier_threshold")]
    pub classifier_threshold: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Congestion {
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_congestion_window")]
    pub window: usize,
    #[serde(default = "default_high_water")]
    pub high_water_ms: f64,
    #[serde(default = "default_low_water")]
    pub low_water_ms: f64,
    #[serde(default = "default_low_bandwidth")]
    pub low_bandwidth_mbps: f64,
    #[serde(default = "default_high_bandwidth")]
    pub high_bandwidth_mbps: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Schedule {
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    #[serde(default = "default_security_interval")]
    pub security_interval_secs: u64,
    #[serde(default = "default_health_backoff")]
    pub health_error_backoff_secs: u64,
    #[serde(default = "default_security_backoff")]
    pub security_error_backoff_secs: u64,
}

/// Figures reported by the resource sampler when no live sampler is wired in.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Sampler {
    #[serde(default)]
    pub mem_pct: f64,
    #[serde(default)]
    pub disk_pct: f64,
    #[serde(default)]
    pub block_rate: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Metrics {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_max_peers() -> usize { 50 }
fn default_max_outbound() -> usize { 25 }
fn default_max_inbound() -> usize { 25 }
fn default_preferred_latency() -> f64 { 100.0 }
fn default_rate_limit() -> usize { 100 }
fn default_rate_window() -> u64 { 60 }
fn default_blacklist_minutes() -> u64 { 60 }
fn default_min_trust() -> f64 { 0.6 }
fn default_sybil_min_peers() -> usize { 5 }
fn default_eclipse_min_blocks() -> u64 { 1_000 }
fn default_vdf_min_blocks() -> u64 { 10 }
fn default_expected_block_delay() -> u64 { 1_800 }  // 30 min VDF
fn default_vdf_anomaly() -> u64 { 1_700 }
fn default_idle_decay_hours() -> u64 { 24 }
fn default_peer_retention_hours() -> u64 { 24 * 7 }
fn default_event_retention_days() -> u64 { 30 }
fn default_classifier_threshold() -> f64 { 0.7 }
fn default_history_capacity() -> usize { 100 }     // ~50 min at 30s cadence
fn default_congestion_window() -> usize { 5 }
fn default_high_water() -> f64 { 500.0 }
fn default_low_water() -> f64 { 200.0 }
fn default_low_bandwidth() -> f64 { 1.0 }
fn default_high_bandwidth() -> f64 { 50.0 }
fn default_health_interval() -> u64 { 30 }
fn default_security_interval() -> u64 { 10 }
fn default_health_backoff() -> u64 { 10 }
fn default_security_backoff() -> u64 { 5 }
fn default_true() -> bool { true }
fn default_bind() -> String { "0.0.0.0:9100".into() }

// Upper bounds for duration settings. Anything longer is treated as a typo.
const MAX_WINDOW_SECS: u64 = 86_400;
const MAX_BLACKLIST_MINUTES: u64 = 60 * 24 * 365;
const MAX_HOURS: u64 = 24 * 365 * 10;
const MAX_RETENTION_DAYS: u64 = 365 * 10;

impl Default for Pool {
    fn default() -> Self {
        Self {
            max_peers: default_max_peers(),
            max_outbound_peers: default_max_outbound(),
            max_inbound_peers: default_max_inbound(),
            preferred_latency_ms: default_preferred_latency(),
        }
    }
}

impl Default for DosProtection {
    fn default() -> Self {
        Self {
            rate_limit_requests_per_second: default_rate_limit(),
            window_secs: default_rate_window(),
            blacklist_duration_minutes: default_blacklist_minutes(),
        }
    }
}

impl DosProtection {
    pub fn window(&self) -> Duration { Duration::from_secs(self.window_secs) }
    pub fn blacklist_duration(&self) -> Duration { Duration::from_secs(self.blacklist_duration_minutes.saturating_mul(60)) }
}

impl Default for Security {
    fn default() -> Self {
        Self {
            minimum_trust_score: default_min_trust(),
            sybil_min_peers: default_sybil_min_peers(),
            eclipse_min_blocks: default_eclipse_min_blocks(),
            vdf_min_blocks: default_vdf_min_blocks(),
            expected_block_delay_secs: default_expected_block_delay(),
            vdf_anomaly_threshold_secs: default_vdf_anomaly(),
            idle_decay_hours: default_idle_decay_hours(),
            peer_retention_hours: default_peer_retention_hours(),
            event_retention_days: default_event_retention_days(),
            classifier_threshold: default_classifier_threshold(),
        }
    }
}

impl Security {
    pub fn idle_decay_after(&self) -> Duration { Duration::from_secs(self.idle_decay_hours.saturating_mul(3_600)) }
    pub fn peer_retention(&self) -> Duration { Duration::from_secs(self.peer_retention_hours.saturating_mul(3_600)) }
    pub fn event_retention(&self) -> Duration { Duration::from_secs(self.event_retention_days.saturating_mul(86_400)) }
}

impl Default for Congestion {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            window: default_congestion_window(),
            high_water_ms: default_high_water(),
            low_water_ms: default_low_water(),
            low_bandwidth_mbps: default_low_bandwidth(),
            high_bandwidth_mbps: default_high_bandwidth(),
        }
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            health_interval_secs: default_health_interval(),
            security_interval_secs: default_security_interval(),
            health_error_backoff_secs: default_health_backoff(),
            security_error_backoff_secs: default_security_backoff(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self { enabled: default_true(), bind: default_bind() }
    }
}

impl Config {
    /// Reject settings the engine cannot run with. Called once before the
    /// scheduler starts; a failure here is fatal.
    pub fn validate(&self) -> Result<()> {
        let p = &self.pool;
        ensure!(p.max_peers > 0, "pool.max_peers must be positive");
        ensure!(p.max_outbound_peers > 0, "pool.max_outbound_peers must be positive");
        ensure!(
            p.max_outbound_peers <= p.max_peers,
            "pool.max_outbound_peers ({}) exceeds pool.max_peers ({})",
            p.max_outbound_peers, p.max_peers
        );
        ensure!(p.preferred_latency_ms.is_finite() && p.preferred_latency_ms > 0.0, "pool.preferred_latency_ms must be positive");

        let d = &self.dos_protection;
        ensure!(d.rate_limit_requests_per_second > 0, "dos_protection.rate_limit_requests_per_second must be positive");
        ensure!(
            d.window_secs > 0 && d.window_secs <= MAX_WINDOW_SECS,
            "dos_protection.window_secs must be in 1..={}, got {}", MAX_WINDOW_SECS, d.window_secs
        );
        ensure!(
            d.blacklist_duration_minutes <= MAX_BLACKLIST_MINUTES,
            "dos_protection.blacklist_duration_minutes must be at most {}, got {}",
            MAX_BLACKLIST_MINUTES, d.blacklist_duration_minutes
        );

        let s = &self.security;
        ensure!(
            (0.0..=1.0).contains(&s.minimum_trust_score),
            "security.minimum_trust_score must lie in [0, 1], got {}", s.minimum_trust_score
        );
        ensure!(
            (0.0..=1.0).contains(&s.classifier_threshold),
            "security.classifier_threshold must lie in [0, 1], got {}", s.classifier_threshold
        );
        ensure!(s.sybil_min_peers > 0, "security.sybil_min_peers must be positive");
        ensure!(
            s.idle_decay_hours <= MAX_HOURS && s.peer_retention_hours <= MAX_HOURS,
            "security.idle_decay_hours and peer_retention_hours must be at most {}", MAX_HOURS
        );
        ensure!(
            s.event_retention_days <= MAX_RETENTION_DAYS,
            "security.event_retention_days must be at most {}, got {}", MAX_RETENTION_DAYS, s.event_retention_days
        );

        let c = &self.congestion;
        ensure!(c.history_capacity > 0, "congestion.history_capacity must be positive");
        ensure!(
            c.window > 0 && c.window <= c.history_capacity,
            "congestion.window must be in 1..=history_capacity"
        );
        ensure!(
            c.low_water_ms < c.high_water_ms,
            "congestion.low_water_ms ({}) must be below high_water_ms ({})",
            c.low_water_ms, c.high_water_ms
        );
        ensure!(c.low_bandwidth_mbps <= c.high_bandwidth_mbps, "congestion bandwidth bounds are inverted");

        let sc = &self.schedule;
        ensure!(sc.health_interval_secs > 0 && sc.security_interval_secs > 0, "schedule intervals must be positive");
        Ok(())
    }
}

/// Read the TOML file at `p`, deserialize it into `Config` and validate it.
///
/// # Errors
/// * Returns an anyhow::Error if the file cannot be read, parsed or validated.
pub fn load<P: AsRef<Path>>(p: P) -> Result<Config> {
    let text = fs::read_to_string(&p)
        .with_context(|| format!("couldn't read config file {}", p.as_ref().display()))?;
    load_from_str(&text)
}

pub fn load_from_str(text: &str) -> Result<Config> {
    let cfg: Config = toml::from_str(text).context("invalid TOML in config file")?;
    cfg.validate().context("invalid configuration")?;
    Ok(cfg)
}
