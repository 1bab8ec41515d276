//! Background reclamation
//!
//! A periodic pass that, in order, toggles the placement compaction bias
//! from the fragmentation figure, evicts idle unreferenced models and
//! speculatively preloads the most used models that are not resident.
//! Every failure is counted and logged; the pass always runs to the end.

use crate::cache::ModelCache;
use crate::config::PoolConfig;
use crate::device::DeviceView;
use crate::metrics::{self, MetricsSink};
use crate::runtime::ModelRuntime;
use crate::strategy::Placement;
use crate::types::ModelId;
use crate::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Outcome of one reclaim pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReclaimReport {
    pub fragmentation: f64,
    pub compacting: bool,
    pub purged_reservations: usize,
    pub evicted: Vec<ModelId>,
    pub preloaded: Vec<ModelId>,
    pub failures: usize,
}

pub struct Reclaimer {
    config: Arc<PoolConfig>,
    cache: Arc<ModelCache>,
    placement: Arc<Placement>,
    runtime: Arc<dyn ModelRuntime>,
    metrics: Arc<dyn MetricsSink>,
    passes: AtomicU64,
}

impl Reclaimer {
    #[must_use]
    pub fn new(
        config: Arc<PoolConfig>,
        cache: Arc<ModelCache>,
        placement: Arc<Placement>,
        runtime: Arc<dyn ModelRuntime>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self { config, cache, placement, runtime, metrics, passes: AtomicU64::new(0) }
    }

    /// Completed passes
    #[must_use]
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Runs the pass on the configured interval until shutdown
    pub fn spawn(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.reclaim_interval();
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let report = self.run_once().await;
                        if !report.evicted.is_empty() || !report.preloaded.is_empty() || report.failures > 0 {
                            info!(
                                evicted = report.evicted.len(),
                                preloaded = report.preloaded.len(),
                                failures = report.failures,
                                fragmentation = report.fragmentation,
                                "Reclaim pass finished"
                            );
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Reclaimer shutting down");
                        break;
                    }
                }
            }
        })
    }

    pub async fn run_once(&self) -> ReclaimReport {
        let mut report = ReclaimReport::default();
        self.defragment(&mut report);
        self.evict_idle(&mut report);
        if self.config.preload_enabled && self.config.preload_limit > 0 {
            self.preload(&mut report).await;
        }
        self.passes.fetch_add(1, Ordering::Relaxed);
        report
    }

    fn defragment(&self, report: &mut ReclaimReport) {
        let registry = self.cache.registry();
        report.purged_reservations = registry.purge_expired();
        report.fragmentation = registry.fragmentation();
        report.compacting = report.fragmentation > self.config.defrag_threshold;
        self.placement.set_compacting(report.compacting);
        self.metrics.set_gauge(metrics::FRAGMENTATION, report.fragmentation);
        debug!(fragmentation = report.fragmentation, compacting = report.compacting, "Fragmentation checked");
    }

    fn evict_idle(&self, report: &mut ReclaimReport) {
        for model in self.cache.idle_candidates(self.config.idle_threshold()) {
            if self.cache.evict_if_unused(&model) {
                report.evicted.push(model);
            }
        }
        if !report.evicted.is_empty() {
            self.metrics.incr_counter(metrics::EVICTIONS_TOTAL, report.evicted.len() as u64);
        }
    }

    async fn preload(&self, report: &mut ReclaimReport) {
        let candidates: Vec<ModelId> = self
            .cache
            .registry()
            .usage_ranking()
            .into_iter()
            .map(|(model, _)| model)
            .filter(|model| !self.cache.contains(model))
            .take(self.config.preload_limit)
            .collect();

        for model in candidates {
            match self.preload_one(&model).await {
                Ok(true) => {
                    self.metrics.incr_counter(metrics::PRELOADS_TOTAL, 1);
                    info!(model = %model, "Preloaded model");
                    report.preloaded.push(model);
                }
                Ok(false) => {}
                Err(e) => {
                    self.metrics.incr_counter(metrics::PRELOAD_FAILURES_TOTAL, 1);
                    warn!(model = %model, error = %e, "Preload failed");
                    report.failures += 1;
                }
            }
        }
    }

    /// Speculative low-priority load with a short deadline
    async fn preload_one(&self, model: &str) -> Result<bool> {
        let size = self.config.footprint(model);
        let headroom = self.config.preload_headroom;
        let placement = &self.placement;
        let reserved = self.cache.insert_preloaded(model, size, |candidates| {
            let roomy: Vec<DeviceView> = candidates
                .iter()
                .filter(|d| d.free_memory.saturating_sub(size) as f64 >= headroom * d.total_memory as f64)
                .cloned()
                .collect();
            placement.select_primary(size, &roomy)
        })?;
        let Some(device) = reserved else { return Ok(false) };

        let timeout = self.config.preload_timeout();
        match tokio::time::timeout(timeout, self.runtime.load(model, &device)).await {
            Ok(Ok(())) => {
                self.cache.mark_ready(model)?;
                Ok(true)
            }
            Ok(Err(e)) => {
                self.cache.discard_loading(model);
                Err(e)
            }
            Err(_) => {
                self.cache.discard_loading(model);
                Err(PoolError::Runtime {
                    model: model.to_string(),
                    message: format!("preload exceeded {}ms", timeout.as_millis()),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ModelState;
    use crate::config::GIB;
    use crate::device::{DeviceRegistry, DeviceSpec};
    use crate::metrics::NoopMetrics;
    use crate::runtime::SimulatedRuntime;
    use std::time::Duration;

    struct Fixture {
        reclaimer: Reclaimer,
        cache: Arc<ModelCache>,
        placement: Arc<Placement>,
        runtime: Arc<SimulatedRuntime>,
    }

    fn fixture(config: PoolConfig, runtime: SimulatedRuntime) -> Fixture {
        let registry = Arc::new(DeviceRegistry::from_specs(&config.devices).unwrap());
        let cache = Arc::new(ModelCache::new(registry));
        let placement = Arc::new(Placement::new(config.primary_strategy, config.fallback_strategy));
        let runtime = Arc::new(runtime);
        let reclaimer = Reclaimer::new(
            Arc::new(config),
            cache.clone(),
            placement.clone(),
            runtime.clone(),
            Arc::new(NoopMetrics),
        );
        Fixture { reclaimer, cache, placement, runtime }
    }

    fn devices(n: usize, gib: u64) -> Vec<DeviceSpec> {
        (0..n).map(|i| DeviceSpec::new(format!("gpu_{i}"), gib * GIB)).collect()
    }

    /// Leaves `model` with recorded usage but no residency
    fn with_history(cache: &ModelCache, model: &str, inferences: usize) {
        let registry = cache.registry();
        registry.reserve("gpu_0", model, GIB).unwrap();
        for _ in 0..inferences {
            registry.record_inference("gpu_0", model, true).unwrap();
        }
        registry.release("gpu_0", model).unwrap();
    }

    #[tokio::test]
    async fn test_compaction_toggles_with_fragmentation() {
        let config = PoolConfig { defrag_threshold: 0.5, preload_enabled: false, ..PoolConfig::default() }
            .with_devices(devices(4, 24));
        let f = fixture(config, SimulatedRuntime::instant());

        let report = f.reclaimer.run_once().await;
        assert!((report.fragmentation - 0.75).abs() < 1e-9);
        assert!(report.compacting);
        assert!(f.placement.is_compacting());

        for i in 1..4 {
            f.cache.registry().reserve(&format!("gpu_{i}"), "filler", 24 * GIB).unwrap();
        }
        let report = f.reclaimer.run_once().await;
        assert_eq!(report.fragmentation, 0.0);
        assert!(!report.compacting);
        assert!(!f.placement.is_compacting());
        assert_eq!(f.reclaimer.passes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_eviction_skips_referenced() {
        let config = PoolConfig { preload_enabled: false, ..PoolConfig::default() };
        let f = fixture(config, SimulatedRuntime::instant());
        let mut held = f.cache.acquire("held", 4 * GIB, &f.placement).unwrap();
        held.mark_ready().unwrap();
        let mut idle = f.cache.acquire("idle", 4 * GIB, &f.placement).unwrap();
        idle.mark_ready().unwrap();
        drop(idle);

        tokio::time::advance(Duration::from_secs(29 * 60)).await;
        assert!(f.reclaimer.run_once().await.evicted.is_empty());

        tokio::time::advance(Duration::from_secs(2 * 60)).await;
        let report = f.reclaimer.run_once().await;
        assert_eq!(report.evicted, vec!["idle".to_string()]);
        assert!(f.cache.contains("held"));
        assert_eq!(f.cache.registry().totals().allocations, 1);
    }

    #[tokio::test]
    async fn test_preloads_top_unloaded_models() {
        let config = PoolConfig { preload_limit: 2, ..PoolConfig::default() };
        let f = fixture(config, SimulatedRuntime::instant());
        with_history(&f.cache, "popular", 10);
        with_history(&f.cache, "steady", 5);
        with_history(&f.cache, "rare", 1);
        let mut resident = f.cache.acquire("resident", GIB, &f.placement).unwrap();
        resident.mark_ready().unwrap();
        for _ in 0..50 {
            f.cache.registry().record_inference(resident.device(), "resident", true).unwrap();
        }

        let report = f.reclaimer.run_once().await;
        assert_eq!(report.preloaded, vec!["popular".to_string(), "steady".to_string()]);
        assert_eq!(report.failures, 0);
        assert_eq!(f.runtime.load_count(), 2);
        let popular = f.cache.peek("popular").unwrap();
        assert_eq!(popular.state, ModelState::Ready);
        assert_eq!(popular.ref_count, 0);
        assert!(!f.cache.contains("rare"));

        // already resident now, nothing more to do for the top two
        let report = f.reclaimer.run_once().await;
        assert_eq!(report.preloaded, vec!["rare".to_string()]);
    }

    #[tokio::test]
    async fn test_preload_honours_headroom() {
        let config = PoolConfig { preload_headroom: 0.1, ..PoolConfig::default() }
            .with_devices(devices(1, 24))
            .with_footprint("big", 23 * GIB)
            .with_footprint("small", 8 * GIB);
        let f = fixture(config, SimulatedRuntime::instant());
        with_history(&f.cache, "big", 3);
        with_history(&f.cache, "small", 2);

        let report = f.reclaimer.run_once().await;
        assert_eq!(report.preloaded, vec!["small".to_string()]);
        assert_eq!(report.failures, 1);
        assert!(!f.cache.contains("big"));
    }

    #[tokio::test]
    async fn test_failed_preload_rolls_back() {
        let config = PoolConfig::default();
        let runtime = SimulatedRuntime::instant();
        runtime.fail_model("flaky");
        let f = fixture(config, runtime);
        with_history(&f.cache, "flaky", 4);

        let report = f.reclaimer.run_once().await;
        assert!(report.preloaded.is_empty());
        assert_eq!(report.failures, 1);
        assert!(!f.cache.contains("flaky"));
        assert_eq!(f.cache.registry().totals().used_memory, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_preload_times_out() {
        let config = PoolConfig { preload_timeout_ms: 1_000, ..PoolConfig::default() };
        let f = fixture(config, SimulatedRuntime::new(Duration::from_secs(10), Duration::ZERO));
        with_history(&f.cache, "slow", 4);

        let report = f.reclaimer.run_once().await;
        assert_eq!(report.failures, 1);
        assert!(!f.cache.contains("slow"));
        assert_eq!(f.cache.registry().totals().used_memory, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_reclaimer_ticks_and_stops() {
        let config = PoolConfig { reclaim_interval_secs: 60, preload_enabled: false, ..PoolConfig::default() };
        let f = fixture(config, SimulatedRuntime::instant());
        let reclaimer = Arc::new(f.reclaimer);
        let (shutdown, _) = broadcast::channel(1);
        let handle = Arc::clone(&reclaimer).spawn(shutdown.subscribe());

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(reclaimer.passes(), 2);
        shutdown.send(()).unwrap();
        handle.await.unwrap();
    }
}
