use crate::config;
use crate::error::{GuardError, Result};

/// Host figures the engine cannot measure itself.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    pub mem_pct: f64,
    pub disk_pct: f64,
    /// Blocks synced per minute.
    pub block_rate: f64,
}

impl ResourceUsage {
    pub fn check(self) -> Result<Self> {
        for (field, value) in [("mem_pct", self.mem_pct), ("disk_pct", self.disk_pct), ("block_rate", self.block_rate)] {
            if !value.is_finite() {
                return Err(GuardError::MalformedSample { field, value });
            }
        }
        Ok(self)
    }
}

/// Supplies memory/disk utilisation and block rate for each health snapshot.
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> ResourceUsage;
}

/// Reports whatever figures it was configured with.
#[derive(Debug, Clone, Default)]
pub struct FixedSampler {
    usage: ResourceUsage,
}

impl FixedSampler {
    pub fn new(usage: ResourceUsage) -> Self {
        Self { usage }
    }
}

impl From<&config::Sampler> for FixedSampler {
    fn from(cfg: &config::Sampler) -> Self {
        Self::new(ResourceUsage { mem_pct: cfg.mem_pct, disk_pct: cfg.disk_pct, block_rate: cfg.block_rate })
    }
}

impl ResourceSampler for FixedSampler {
    fn sample(&self) -> ResourceUsage {
        self.usage
    }
}
