//! Network congestion state and the block propagation policy derived from it.

use crate::config;
use crate::history::MetricsHistory;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    CriticalOnly,
    All,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Priority::CriticalOnly => "critical_only",
            Priority::All => "all",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropagationPolicy {
    pub compress: bool,
    pub batch_size: usize,
    pub priority: Priority,
    pub backpressure: bool,
}

impl PropagationPolicy {
    pub const CONGESTED: Self = Self {
        compress: true,
        batch_size: 10,
        priority: Priority::CriticalOnly,
        backpressure: true,
    };
    pub const NORMAL: Self = Self {
        compress: false,
        batch_size: 100,
        priority: Priority::All,
        backpressure: false,
    };
}

/// Informational bandwidth hint; never changes controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandwidthAdvisory {
    CompressAndBatch,
    DisableCompression,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Not enough history to judge.
    Insufficient,
    Entered,
    Cleared,
    Held,
}

/// Latency-driven congestion flag with separate enter/exit thresholds so the
/// state does not flap around a single boundary.
#[derive(Debug, Clone)]
pub struct CongestionController {
    congested: bool,
    window: usize,
    high_water_ms: f64,
    low_water_ms: f64,
    low_bandwidth_mbps: f64,
    high_bandwidth_mbps: f64,
    last_mean_latency: Option<f64>,
}

impl CongestionController {
    pub fn new(cfg: &config::Congestion) -> Self {
        Self {
            congested: false,
            window: cfg.window,
            high_water_ms: cfg.high_water_ms,
            low_water_ms: cfg.low_water_ms,
            low_bandwidth_mbps: cfg.low_bandwidth_mbps,
            high_bandwidth_mbps: cfg.high_bandwidth_mbps,
            last_mean_latency: None,
        }
    }

    pub fn is_congested(&self) -> bool {
        self.congested
    }

    pub fn last_mean_latency(&self) -> Option<f64> {
        self.last_mean_latency
    }

    pub fn evaluate(&mut self, history: &MetricsHistory) -> Transition {
        let Some(window) = history.last_n(self.window) else {
            return Transition::Insufficient;
        };
        let mean = window.map(|s| s.avg_latency).sum::<f64>() / self.window as f64;
        self.last_mean_latency = Some(mean);

        if mean > self.high_water_ms {
            let was = std::mem::replace(&mut self.congested, true);
            if was { Transition::Held } else { Transition::Entered }
        } else if mean < self.low_water_ms {
            let was = std::mem::replace(&mut self.congested, false);
            if was { Transition::Cleared } else { Transition::Held }
        } else {
            Transition::Held
        }
    }

    /// Relay settings for the next block. Depends only on the congestion flag.
    pub fn propagation_policy(&self, _block_size_kb: usize) -> PropagationPolicy {
        if self.congested {
            PropagationPolicy::CONGESTED
        } else {
            PropagationPolicy::NORMAL
        }
    }

    pub fn bandwidth_advisory(&self, avg_throughput_mbps: f64) -> BandwidthAdvisory {
        if avg_throughput_mbps < self.low_bandwidth_mbps {
            BandwidthAdvisory::CompressAndBatch
        } else if avg_throughput_mbps > self.high_bandwidth_mbps {
            BandwidthAdvisory::DisableCompression
        } else {
            BandwidthAdvisory::Unchanged
        }
    }
}

impl Default for CongestionController {
    fn default() -> Self {
        Self::new(&config::Congestion::default())
    }
}
