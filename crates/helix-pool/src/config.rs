//! Scheduler configuration

use crate::device::DeviceSpec;
use crate::strategy::StrategyKind;
use crate::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// One gibibyte
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Bit width footprints are expressed in
const BASELINE_BITS: u32 = 16;

/// Inference pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Bounded job queue capacity
    pub queue_capacity: usize,
    /// Number of worker tasks
    pub worker_count: usize,
    /// Default job deadline in milliseconds
    pub job_timeout_ms: u64,
    /// Longest accepted request input, in bytes
    pub max_input_len: usize,
    /// Unreferenced models idle this long are evicted
    pub idle_threshold_secs: u64,
    /// Reclaimer tick interval
    pub reclaim_interval_secs: u64,
    /// Fragmentation above which placement favours dense packing
    pub defrag_threshold: f64,
    pub preload_enabled: bool,
    /// Maximum models preloaded per reclaim pass
    pub preload_limit: usize,
    /// Fraction of a device's capacity a preload must leave free
    pub preload_headroom: f64,
    /// Deadline for a speculative model load
    pub preload_timeout_ms: u64,
    pub primary_strategy: StrategyKind,
    pub fallback_strategy: Option<StrategyKind>,
    pub devices: Vec<DeviceSpec>,
    /// Model footprints in bytes at 16-bit precision
    pub model_footprints: BTreeMap<String, u64>,
    /// Per-model quantization bit width
    pub quantization_bits: BTreeMap<String, u32>,
    /// Footprint for models missing from `model_footprints`
    pub default_footprint: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            worker_count: 10,
            job_timeout_ms: 30_000,
            max_input_len: 4096,
            idle_threshold_secs: 30 * 60,
            reclaim_interval_secs: 5 * 60,
            defrag_threshold: 0.8,
            preload_enabled: true,
            preload_limit: 3,
            preload_headroom: 0.1,
            preload_timeout_ms: 5 * 60 * 1000,
            primary_strategy: StrategyKind::BestFit,
            fallback_strategy: Some(StrategyKind::FirstFit),
            devices: (0..4).map(|i| DeviceSpec::new(format!("gpu_{i}"), 24 * GIB)).collect(),
            model_footprints: BTreeMap::new(),
            quantization_bits: BTreeMap::new(),
            default_footprint: 4 * GIB,
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    #[must_use]
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    #[must_use]
    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }

    #[must_use]
    pub fn preload_timeout(&self) -> Duration {
        Duration::from_millis(self.preload_timeout_ms)
    }

    /// Effective memory footprint of a model after quantization
    #[must_use]
    pub fn footprint(&self, model: &str) -> u64 {
        let base = self.model_footprints.get(model).copied().unwrap_or(self.default_footprint);
        let bits = self.quantization_bits.get(model).copied().unwrap_or(BASELINE_BITS);
        let scaled = u128::from(base) * u128::from(bits) / u128::from(BASELINE_BITS);
        u64::try_from(scaled).unwrap_or(u64::MAX)
    }

    #[must_use]
    pub fn with_devices(mut self, devices: Vec<DeviceSpec>) -> Self {
        self.devices = devices;
        self
    }

    #[must_use]
    pub fn with_footprint(mut self, model: impl Into<String>, bytes: u64) -> Self {
        self.model_footprints.insert(model.into(), bytes);
        self
    }

    #[must_use]
    pub const fn with_strategies(mut self, primary: StrategyKind, fallback: Option<StrategyKind>) -> Self {
        self.primary_strategy = primary;
        self.fallback_strategy = fallback;
        self
    }

    #[must_use]
    pub const fn with_workers(mut self, worker_count: usize, queue_capacity: usize) -> Self {
        self.worker_count = worker_count;
        self.queue_capacity = queue_capacity;
        self
    }

    #[must_use]
    pub const fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(PoolError::InvalidConfig("queue_capacity must be > 0".into()));
        }
        if self.worker_count == 0 {
            return Err(PoolError::InvalidConfig("worker_count must be > 0".into()));
        }
        if self.job_timeout_ms == 0 {
            return Err(PoolError::InvalidConfig("job_timeout_ms must be > 0".into()));
        }
        if self.max_input_len == 0 {
            return Err(PoolError::InvalidConfig("max_input_len must be > 0".into()));
        }
        if self.reclaim_interval_secs == 0 {
            return Err(PoolError::InvalidConfig("reclaim_interval_secs must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.defrag_threshold) {
            return Err(PoolError::InvalidConfig("defrag_threshold must be within [0, 1]".into()));
        }
        if !(0.0..1.0).contains(&self.preload_headroom) {
            return Err(PoolError::InvalidConfig("preload_headroom must be within [0, 1)".into()));
        }
        if self.default_footprint == 0 {
            return Err(PoolError::InvalidConfig("default_footprint must be > 0".into()));
        }
        if self.devices.is_empty() {
            return Err(PoolError::InvalidConfig("at least one device is required".into()));
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.total_memory == 0 {
                return Err(PoolError::InvalidConfig(format!("device {} has no memory", device.id)));
            }
            if !seen.insert(device.id.as_str()) {
                return Err(PoolError::InvalidConfig(format!("duplicate device id {}", device.id)));
            }
        }
        for (model, bits) in &self.quantization_bits {
            if *bits == 0 || *bits > 32 {
                return Err(PoolError::InvalidConfig(format!(
                    "quantization bits for {model} must be within 1..=32"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.worker_count, 10);
        assert_eq!(config.job_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_input_len, 4096);
        assert_eq!(config.idle_threshold(), Duration::from_secs(1800));
        assert_eq!(config.reclaim_interval(), Duration::from_secs(300));
        assert_eq!(config.devices.len(), 4);
        assert!(config.devices.iter().all(|d| d.total_memory == 24 * GIB));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_footprint_quantization() {
        let mut config = PoolConfig::default().with_footprint("llama-70b", 140 * GIB);
        assert_eq!(config.footprint("llama-70b"), 140 * GIB);
        assert_eq!(config.footprint("unknown"), 4 * GIB);

        config.quantization_bits.insert("llama-70b".into(), 4);
        assert_eq!(config.footprint("llama-70b"), 35 * GIB);
        config.quantization_bits.insert("unknown".into(), 8);
        assert_eq!(config.footprint("unknown"), 2 * GIB);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(PoolConfig::default().with_workers(0, 10).validate().is_err());
        assert!(PoolConfig::default().with_workers(1, 0).validate().is_err());
        assert!(PoolConfig::default().with_devices(vec![]).validate().is_err());

        let dup = vec![DeviceSpec::new("gpu_0", GIB), DeviceSpec::new("gpu_0", GIB)];
        assert!(PoolConfig::default().with_devices(dup).validate().is_err());

        let config = PoolConfig { defrag_threshold: 1.5, ..PoolConfig::default() };
        assert!(config.validate().is_err());

        let config = PoolConfig { max_input_len: 0, ..PoolConfig::default() };
        assert!(config.validate().is_err());

        let mut config = PoolConfig::default();
        config.quantization_bits.insert("m".into(), 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let config: PoolConfig = serde_json::from_str(
            r#"{"worker_count": 2, "primary_strategy": "least_loaded", "fallback_strategy": null}"#,
        )
        .unwrap();
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.primary_strategy, StrategyKind::LeastLoaded);
        assert_eq!(config.fallback_strategy, None);
    }
}
