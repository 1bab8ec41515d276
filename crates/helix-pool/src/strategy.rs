//! Device selection heuristics
//!
//! Every strategy receives candidates in ascending device-ID order and only
//! considers devices that can host the full requirement. Ties always break
//! toward the lowest device ID.

use crate::device::DeviceView;
use crate::types::DeviceId;
use crate::{PoolError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Picks a device for a memory requirement
pub trait AllocationStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn select(&self, required: u64, candidates: &[DeviceView]) -> Result<DeviceId>;
}

fn capable(required: u64, candidates: &[DeviceView]) -> impl Iterator<Item = &DeviceView> {
    candidates.iter().filter(move |d| d.can_host(required))
}

/// Minimises leftover free memory
#[derive(Debug, Default, Clone, Copy)]
pub struct BestFit;

impl AllocationStrategy for BestFit {
    fn name(&self) -> &'static str {
        "best_fit"
    }

    fn select(&self, required: u64, candidates: &[DeviceView]) -> Result<DeviceId> {
        // min_by_key keeps the first minimum, which is the lowest ID
        capable(required, candidates)
            .min_by_key(|d| d.free_memory - required)
            .map(|d| d.id.clone())
            .ok_or(PoolError::NoCapableDevice { required })
    }
}

/// First capable device in ID order
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstFit;

impl AllocationStrategy for FirstFit {
    fn name(&self) -> &'static str {
        "first_fit"
    }

    fn select(&self, required: u64, candidates: &[DeviceView]) -> Result<DeviceId> {
        capable(required, candidates)
            .next()
            .map(|d| d.id.clone())
            .ok_or(PoolError::NoCapableDevice { required })
    }
}

/// Cycles through capable devices starting after the last pick
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: Mutex<Option<DeviceId>>,
}

impl RoundRobin {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AllocationStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, required: u64, candidates: &[DeviceView]) -> Result<DeviceId> {
        let mut cursor = self.cursor.lock();
        let after_cursor = cursor
            .as_ref()
            .and_then(|last| capable(required, candidates).find(|d| d.id > *last));
        let chosen = after_cursor
            .or_else(|| capable(required, candidates).next())
            .map(|d| d.id.clone())
            .ok_or(PoolError::NoCapableDevice { required })?;
        *cursor = Some(chosen.clone());
        Ok(chosen)
    }
}

/// Lowest utilization wins
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastLoaded;

impl AllocationStrategy for LeastLoaded {
    fn name(&self) -> &'static str {
        "least_loaded"
    }

    fn select(&self, required: u64, candidates: &[DeviceView]) -> Result<DeviceId> {
        capable(required, candidates)
            .fold(None::<&DeviceView>, |best, d| match best {
                Some(b) if b.utilization <= d.utilization => Some(b),
                _ => Some(d),
            })
            .map(|d| d.id.clone())
            .ok_or(PoolError::NoCapableDevice { required })
    }
}

/// Strategy names accepted in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    BestFit,
    FirstFit,
    RoundRobin,
    LeastLoaded,
}

impl StrategyKind {
    pub const ALL: [Self; 4] = [Self::BestFit, Self::FirstFit, Self::RoundRobin, Self::LeastLoaded];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::BestFit => "best_fit",
            Self::FirstFit => "first_fit",
            Self::RoundRobin => "round_robin",
            Self::LeastLoaded => "least_loaded",
        }
    }

    #[must_use]
    pub fn build(self) -> Box<dyn AllocationStrategy> {
        match self {
            Self::BestFit => Box::new(BestFit),
            Self::FirstFit => Box::new(FirstFit),
            Self::RoundRobin => Box::new(RoundRobin::new()),
            Self::LeastLoaded => Box::new(LeastLoaded),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| PoolError::UnknownStrategy(s.to_string()))
    }
}

/// Primary strategy with optional fallback and a compaction bias
///
/// While compacting, request-path selections pack densely with best-fit.
/// [`select_primary`](Self::select_primary) ignores both the bias and the
/// fallback.
#[derive(Debug)]
pub struct Placement {
    primary: Box<dyn AllocationStrategy>,
    fallback: Option<Box<dyn AllocationStrategy>>,
    compacting: AtomicBool,
}

impl Placement {
    #[must_use]
    pub fn new(primary: StrategyKind, fallback: Option<StrategyKind>) -> Self {
        Self::from_strategies(primary.build(), fallback.map(StrategyKind::build))
    }

    #[must_use]
    pub fn from_strategies(
        primary: Box<dyn AllocationStrategy>,
        fallback: Option<Box<dyn AllocationStrategy>>,
    ) -> Self {
        Self { primary, fallback, compacting: AtomicBool::new(false) }
    }

    #[must_use]
    pub fn primary_name(&self) -> &'static str {
        self.primary.name()
    }

    #[must_use]
    pub fn fallback_name(&self) -> Option<&'static str> {
        self.fallback.as_ref().map(|f| f.name())
    }

    pub fn select(&self, required: u64, candidates: &[DeviceView]) -> Result<DeviceId> {
        if self.is_compacting() {
            return BestFit.select(required, candidates);
        }
        match (self.primary.select(required, candidates), &self.fallback) {
            (Err(PoolError::NoCapableDevice { .. }), Some(fallback)) => {
                debug!(
                    primary = self.primary.name(),
                    fallback = fallback.name(),
                    required,
                    "Primary strategy found no device, trying fallback"
                );
                fallback.select(required, candidates)
            }
            (result, _) => result,
        }
    }

    pub fn select_primary(&self, required: u64, candidates: &[DeviceView]) -> Result<DeviceId> {
        self.primary.select(required, candidates)
    }

    /// Toggles the compaction bias, returning the previous value
    pub fn set_compacting(&self, on: bool) -> bool {
        let previous = self.compacting.swap(on, Ordering::AcqRel);
        if previous != on {
            info!(compacting = on, "Placement compaction bias changed");
        }
        previous
    }

    #[must_use]
    pub fn is_compacting(&self) -> bool {
        self.compacting.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GIB;
    use crate::device::DeviceStatus;
    use chrono::Utc;

    fn view(id: &str, free_gib: u64, utilization: f64) -> DeviceView {
        DeviceView {
            id: id.to_string(),
            name: id.to_string(),
            total_memory: 24 * GIB,
            used_memory: 24 * GIB - free_gib * GIB,
            reserved_memory: 0,
            free_memory: free_gib * GIB,
            utilization,
            temperature: None,
            status: DeviceStatus::Available,
            allocations: Vec::new(),
            last_update: Utc::now(),
        }
    }

    fn three() -> Vec<DeviceView> {
        vec![view("gpu_0", 22, 50.0), view("gpu_1", 24, 10.0), view("gpu_2", 10, 90.0)]
    }

    #[test]
    fn test_best_fit_picks_tightest() {
        assert_eq!(BestFit.select(20 * GIB, &three()).unwrap(), "gpu_0");
        assert_eq!(BestFit.select(5 * GIB, &three()).unwrap(), "gpu_2");
    }

    #[test]
    fn test_best_fit_tie_breaks_on_lowest_id() {
        let devices = vec![view("gpu_0", 12, 0.0), view("gpu_1", 12, 0.0)];
        assert_eq!(BestFit.select(GIB, &devices).unwrap(), "gpu_0");
    }

    #[test]
    fn test_first_fit() {
        assert_eq!(FirstFit.select(23 * GIB, &three()).unwrap(), "gpu_1");
        assert_eq!(FirstFit.select(GIB, &three()).unwrap(), "gpu_0");
    }

    #[test]
    fn test_least_loaded() {
        assert_eq!(LeastLoaded.select(GIB, &three()).unwrap(), "gpu_1");
        let tied = vec![view("gpu_0", 12, 5.0), view("gpu_1", 12, 5.0)];
        assert_eq!(LeastLoaded.select(GIB, &tied).unwrap(), "gpu_0");
    }

    #[test]
    fn test_no_capable_device() {
        for kind in StrategyKind::ALL {
            let err = kind.build().select(30 * GIB, &three()).unwrap_err();
            assert_eq!(err, PoolError::NoCapableDevice { required: 30 * GIB });
        }
    }

    #[test]
    fn test_errored_device_never_selected() {
        let mut devices = three();
        devices[1].status = DeviceStatus::Error;
        assert_eq!(FirstFit.select(23 * GIB, &devices).unwrap_err(), PoolError::NoCapableDevice { required: 23 * GIB });
    }

    #[test]
    fn test_round_robin_cycles() {
        let rr = RoundRobin::new();
        let devices = three();
        let picks: Vec<_> = (0..4).map(|_| rr.select(GIB, &devices).unwrap()).collect();
        assert_eq!(picks, vec!["gpu_0", "gpu_1", "gpu_2", "gpu_0"]);
    }

    #[test]
    fn test_round_robin_skips_incapable() {
        let rr = RoundRobin::new();
        let devices = three();
        let picks: Vec<_> = (0..3).map(|_| rr.select(15 * GIB, &devices).unwrap()).collect();
        assert_eq!(picks, vec!["gpu_0", "gpu_1", "gpu_0"]);
    }

    #[test]
    fn test_round_robin_single_capable_never_starves() {
        let rr = RoundRobin::new();
        let devices = three();
        for _ in 0..5 {
            assert_eq!(rr.select(23 * GIB, &devices).unwrap(), "gpu_1");
        }
    }

    #[test]
    fn test_round_robin_fairness() {
        let rr = RoundRobin::new();
        let devices: Vec<_> = (0..5).map(|i| view(&format!("gpu_{i}"), 24, 0.0)).collect();
        let k = 23;
        let mut counts = std::collections::HashMap::new();
        for _ in 0..k {
            *counts.entry(rr.select(GIB, &devices).unwrap()).or_insert(0) += 1;
        }
        assert_eq!(counts.len(), devices.len());
        assert!(counts.values().all(|c| *c >= k / devices.len()));
    }

    #[test]
    fn test_strategy_names_parse() {
        assert_eq!("best_fit".parse::<StrategyKind>().unwrap(), StrategyKind::BestFit);
        assert_eq!("Least-Loaded".parse::<StrategyKind>().unwrap(), StrategyKind::LeastLoaded);
        assert!(matches!("fastest".parse::<StrategyKind>(), Err(PoolError::UnknownStrategy(_))));
        for kind in StrategyKind::ALL {
            assert_eq!(kind.build().name(), kind.as_str());
        }
    }

    #[test]
    fn test_placement_fallback() {
        #[derive(Debug)]
        struct Never;
        impl AllocationStrategy for Never {
            fn name(&self) -> &'static str {
                "never"
            }
            fn select(&self, required: u64, _: &[DeviceView]) -> Result<DeviceId> {
                Err(PoolError::NoCapableDevice { required })
            }
        }

        let placement = Placement::from_strategies(Box::new(Never), Some(Box::new(FirstFit)));
        assert_eq!(placement.select(GIB, &three()).unwrap(), "gpu_0");
        assert!(placement.select_primary(GIB, &three()).is_err());

        let no_fallback = Placement::from_strategies(Box::new(Never), None);
        assert!(no_fallback.select(GIB, &three()).is_err());
    }

    #[test]
    fn test_placement_compaction_bias() {
        let placement = Placement::new(StrategyKind::LeastLoaded, None);
        assert_eq!(placement.select(5 * GIB, &three()).unwrap(), "gpu_1");
        assert!(!placement.set_compacting(true));
        assert_eq!(placement.select(5 * GIB, &three()).unwrap(), "gpu_2");
        assert_eq!(placement.select_primary(5 * GIB, &three()).unwrap(), "gpu_1");
        assert!(placement.set_compacting(false));
        assert_eq!(placement.select(5 * GIB, &three()).unwrap(), "gpu_1");
    }
}
