//! Inference pool facade
//!
//! Wires the device registry, placement, model cache, job queue, worker pool
//! and reclaimer into one independently constructed instance.

use crate::cache::{CacheStats, CachedModelView, ModelCache, ModelState};
use crate::config::PoolConfig;
use crate::device::{DeviceRegistry, DeviceView, RegistryTotals};
use crate::metrics::{self, MetricsSink};
use crate::queue::{JobHandle, JobQueue, JobTracker, QueueStats};
use crate::reclaim::{ReclaimReport, Reclaimer};
use crate::runtime::ModelRuntime;
use crate::strategy::Placement;
use crate::types::{DeviceId, InferenceRequest, InferenceResponse, ModelId};
use crate::worker::{WorkerContext, spawn_workers};
use crate::{PoolError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

/// Residency as reported by [`InferencePool::model_status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatusKind {
    Ready,
    Loading,
    Unloaded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub model_id: ModelId,
    pub status: ModelStatusKind,
    pub device_id: Option<DeviceId>,
    /// Footprint after quantization
    pub memory: u64,
    pub loaded_at: Option<DateTime<Utc>>,
    pub active_requests: u32,
}

/// Whole-system snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub devices: Vec<DeviceView>,
    pub models: Vec<CachedModelView>,
    pub totals: RegistryTotals,
    pub queue: QueueStats,
    pub cache: CacheStats,
    pub compacting: bool,
    pub uptime: Duration,
}

/// The inference pool
pub struct InferencePool {
    config: Arc<PoolConfig>,
    cache: Arc<ModelCache>,
    placement: Arc<Placement>,
    runtime: Arc<dyn ModelRuntime>,
    metrics: Arc<dyn MetricsSink>,
    tracker: Arc<JobTracker>,
    queue: JobQueue,
    reclaimer: Arc<Reclaimer>,
    receiver: Mutex<Option<mpsc::Receiver<crate::queue::Job>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: broadcast::Sender<()>,
    accepting: AtomicBool,
    started_at: Instant,
}

impl InferencePool {
    /// Builds a pool; no tasks run until [`start`](Self::start)
    pub fn new(
        config: PoolConfig,
        runtime: Arc<dyn ModelRuntime>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(DeviceRegistry::from_specs(&config.devices)?);
        let config = Arc::new(config);
        let cache = Arc::new(ModelCache::new(registry));
        let placement = Arc::new(Placement::new(config.primary_strategy, config.fallback_strategy));
        let tracker = Arc::new(JobTracker::new());
        let (queue, receiver) = JobQueue::new(
            config.queue_capacity,
            config.job_timeout(),
            Arc::clone(&tracker),
            Arc::clone(&metrics),
        );
        let reclaimer = Arc::new(Reclaimer::new(
            Arc::clone(&config),
            Arc::clone(&cache),
            Arc::clone(&placement),
            Arc::clone(&runtime),
            Arc::clone(&metrics),
        ));
        let (shutdown, _) = broadcast::channel(1);

        info!(
            devices = config.devices.len(),
            workers = config.worker_count,
            queue_capacity = config.queue_capacity,
            primary = %config.primary_strategy,
            "Inference pool created"
        );

        Ok(Self {
            config,
            cache,
            placement,
            runtime,
            metrics,
            tracker,
            queue,
            reclaimer,
            receiver: Mutex::new(Some(receiver)),
            tasks: Mutex::new(Vec::new()),
            shutdown,
            accepting: AtomicBool::new(true),
            started_at: Instant::now(),
        })
    }

    /// Spawns the worker pool and the reclaimer; later calls are no-ops
    pub fn start(&self) -> Result<()> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(PoolError::ShuttingDown);
        }
        let Some(receiver) = self.receiver.lock().take() else {
            return Ok(());
        };
        let ctx = Arc::new(WorkerContext {
            config: Arc::clone(&self.config),
            cache: Arc::clone(&self.cache),
            placement: Arc::clone(&self.placement),
            runtime: Arc::clone(&self.runtime),
            metrics: Arc::clone(&self.metrics),
            tracker: Arc::clone(&self.tracker),
        });
        let mut tasks = spawn_workers(ctx, receiver, self.config.worker_count, &self.shutdown);
        tasks.push(Arc::clone(&self.reclaimer).spawn(self.shutdown.subscribe()));
        self.tasks.lock().extend(tasks);
        info!(workers = self.config.worker_count, "Inference pool started");
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        self.cache.registry()
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<ModelCache> {
        &self.cache
    }

    #[must_use]
    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    /// Enqueues without blocking; a full queue fails with `QueueFull`
    ///
    /// Malformed requests fail with `InvalidRequest` and are never queued.
    pub fn submit(&self, request: InferenceRequest) -> Result<JobHandle> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(PoolError::ShuttingDown);
        }
        request.validate(self.config.max_input_len)?;
        self.queue.submit(request)
    }

    /// Submits and waits for the result or the deadline
    pub async fn submit_inference(&self, request: InferenceRequest) -> Result<InferenceResponse> {
        self.submit(request)?.wait().await
    }

    #[must_use]
    pub fn device_status(&self) -> Vec<DeviceView> {
        self.registry().snapshot()
    }

    #[must_use]
    pub fn cache_status(&self) -> Vec<CachedModelView> {
        self.cache.snapshot()
    }

    #[must_use]
    pub fn queue_stats(&self) -> QueueStats {
        self.tracker.stats(self.queue.capacity(), self.queue.depth())
    }

    /// Loads a model ahead of demand, leaving it unreferenced
    ///
    /// Returns the hosting device; a model that is already resident is
    /// reported where it is.
    pub async fn load_model(&self, model: &str) -> Result<DeviceId> {
        let size = self.config.footprint(model);
        let placement = &self.placement;
        let reserved = self.cache.insert_preloaded(model, size, |candidates| placement.select(size, candidates));
        let device = match reserved {
            Ok(Some(device)) => device,
            Ok(None) => {
                return self
                    .cache
                    .peek(model)
                    .map(|view| view.device_id)
                    .ok_or_else(|| PoolError::ModelNotCached(model.to_string()));
            }
            Err(e) => {
                self.metrics.incr_counter(metrics::ALLOCATION_FAILURES_TOTAL, 1);
                return Err(e);
            }
        };
        self.metrics.incr_counter(metrics::ALLOCATIONS_TOTAL, 1);

        match self.runtime.load(model, &device).await {
            Ok(()) => {
                self.cache.mark_ready(model)?;
                info!(model, device = %device, "Model loaded on request");
                Ok(device)
            }
            Err(e) => {
                self.cache.discard_loading(model);
                warn!(model, error = %e, "Explicit model load failed");
                Err(e)
            }
        }
    }

    /// Evicts a model that nothing references
    pub fn unload_model(&self, model: &str) -> Result<()> {
        if self.cache.evict_if_unused(model) {
            self.metrics.incr_counter(metrics::EVICTIONS_TOTAL, 1);
            return Ok(());
        }
        match self.cache.peek(model) {
            Some(view) => Err(PoolError::ModelInUse { model: model.to_string(), refs: view.ref_count }),
            None => Err(PoolError::ModelNotCached(model.to_string())),
        }
    }

    #[must_use]
    pub fn model_status(&self, model: &str) -> ModelStatus {
        let memory = self.config.footprint(model);
        match self.cache.peek(model) {
            Some(view) => ModelStatus {
                model_id: model.to_string(),
                status: match view.state {
                    ModelState::Ready => ModelStatusKind::Ready,
                    ModelState::Loading => ModelStatusKind::Loading,
                },
                device_id: Some(view.device_id),
                memory: view.size,
                loaded_at: Some(view.load_time),
                active_requests: view.ref_count,
            },
            None => ModelStatus {
                model_id: model.to_string(),
                status: ModelStatusKind::Unloaded,
                device_id: None,
                memory,
                loaded_at: None,
                active_requests: 0,
            },
        }
    }

    #[must_use]
    pub fn system_status(&self) -> SystemStatus {
        SystemStatus {
            devices: self.device_status(),
            models: self.cache_status(),
            totals: self.registry().totals(),
            queue: self.queue_stats(),
            cache: self.cache.stats(),
            compacting: self.placement.is_compacting(),
            uptime: self.started_at.elapsed(),
        }
    }

    /// Runs one reclaim pass immediately
    pub async fn reclaim_now(&self) -> ReclaimReport {
        self.reclaimer.run_once().await
    }

    /// Stops accepting jobs, signals every task and waits for them
    ///
    /// Jobs still queued resolve with `ShuttingDown`.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(());
        // never started: dropping the receiver fails queued jobs
        self.receiver.lock().take();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Pool task ended abnormally");
            }
        }
        info!("Inference pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GIB;
    use crate::metrics::NoopMetrics;
    use crate::runtime::SimulatedRuntime;

    fn pool(config: PoolConfig) -> (InferencePool, Arc<SimulatedRuntime>) {
        let runtime = Arc::new(SimulatedRuntime::instant());
        let pool = InferencePool::new(config, runtime.clone(), Arc::new(NoopMetrics)).unwrap();
        (pool, runtime)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = PoolConfig::default().with_workers(0, 1);
        let result = InferencePool::new(config, Arc::new(SimulatedRuntime::instant()), Arc::new(NoopMetrics));
        assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_submit_inference_roundtrip() {
        let (pool, runtime) = pool(PoolConfig::default());
        pool.start().unwrap();

        let first = pool.submit_inference(InferenceRequest::new("llama", "hello")).await.unwrap();
        assert!(!first.cache_hit);
        assert!(first.output.starts_with("Hello!"));
        assert_eq!(first.total_tokens, first.prompt_tokens + first.completion_tokens);

        let second = pool.submit_inference(InferenceRequest::new("llama", "hello")).await.unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.device_id, first.device_id);
        assert_eq!(runtime.load_count(), 1);

        let status = pool.model_status("llama");
        assert_eq!(status.status, ModelStatusKind::Ready);
        assert_eq!(status.active_requests, 0);
        assert_eq!(pool.queue_stats().completed, 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_load_and_unload_model() {
        let (pool, _) = pool(PoolConfig::default().with_footprint("mistral", 14 * GIB));
        let device = pool.load_model("mistral").await.unwrap();
        let status = pool.model_status("mistral");
        assert_eq!(status.status, ModelStatusKind::Ready);
        assert_eq!(status.device_id.as_deref(), Some(device.as_str()));
        assert_eq!(status.memory, 14 * GIB);
        assert_eq!(pool.load_model("mistral").await.unwrap(), device);

        pool.unload_model("mistral").unwrap();
        assert_eq!(pool.model_status("mistral").status, ModelStatusKind::Unloaded);
        assert!(matches!(pool.unload_model("mistral"), Err(PoolError::ModelNotCached(_))));
        assert_eq!(pool.registry().totals().used_memory, 0);
    }

    #[tokio::test]
    async fn test_unload_in_use_model_refused() {
        let (pool, _) = pool(PoolConfig::default());
        pool.load_model("m").await.unwrap();
        pool.cache().get("m").unwrap();
        assert_eq!(
            pool.unload_model("m"),
            Err(PoolError::ModelInUse { model: "m".into(), refs: 1 })
        );
    }

    #[tokio::test]
    async fn test_load_model_failure_rolls_back() {
        let (pool, runtime) = pool(PoolConfig::default());
        runtime.fail_model("broken");
        assert!(matches!(pool.load_model("broken").await, Err(PoolError::Runtime { .. })));
        assert_eq!(pool.model_status("broken").status, ModelStatusKind::Unloaded);
        assert_eq!(pool.registry().totals().allocations, 0);
    }

    #[tokio::test]
    async fn test_system_status() {
        let (pool, _) = pool(PoolConfig::default());
        pool.load_model("m").await.unwrap();
        let status = pool.system_status();
        assert_eq!(status.devices.len(), 4);
        assert_eq!(status.models.len(), 1);
        assert_eq!(status.totals.total_memory, 96 * GIB);
        assert_eq!(status.totals.used_memory, 4 * GIB);
        assert_eq!(status.queue.capacity, 1000);
        assert!(!status.compacting);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown() {
        let (pool, _) = pool(PoolConfig::default());
        pool.start().unwrap();
        pool.shutdown().await;
        assert_eq!(pool.submit(InferenceRequest::new("m", "x")).unwrap_err(), PoolError::ShuttingDown);
        assert_eq!(pool.start(), Err(PoolError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_shutdown_fails_queued_jobs() {
        let (pool, _) = pool(PoolConfig::default());
        let handle = pool.submit(InferenceRequest::new("m", "x")).unwrap();
        pool.shutdown().await;
        assert_eq!(handle.wait().await.unwrap_err(), PoolError::ShuttingDown);

        let stats = pool.queue_stats();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.cancelled, 1);
    }

    #[tokio::test]
    async fn test_invalid_requests_never_queued() {
        let config = PoolConfig { max_input_len: 8, ..PoolConfig::default() };
        let (pool, _) = pool(config);
        for request in [
            InferenceRequest::new("", "hello"),
            InferenceRequest::new("m", ""),
            InferenceRequest::new("m", "far too long"),
        ] {
            assert!(matches!(pool.submit(request), Err(PoolError::InvalidRequest(_))));
        }
        let stats = pool.queue_stats();
        assert_eq!((stats.depth, stats.submitted, stats.rejected), (0, 0, 0));
        assert!(pool.submit(InferenceRequest::new("m", "hello")).is_ok());
    }

    #[tokio::test]
    async fn test_queue_depth_gauge_follows_dispatch() {
        let metrics = Arc::new(helix_telemetry::MetricRegistry::new());
        let config = PoolConfig::default().with_workers(1, 8);
        let pool = InferencePool::new(config, Arc::new(SimulatedRuntime::instant()), metrics.clone()).unwrap();

        let handles: Vec<_> = (0..3).map(|_| pool.submit(InferenceRequest::new("m", "hi")).unwrap()).collect();
        assert_eq!(metrics.gauge(crate::metrics::QUEUE_DEPTH).get(), 3.0);

        pool.start().unwrap();
        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert_eq!(metrics.gauge(crate::metrics::QUEUE_DEPTH).get(), 0.0);
        pool.shutdown().await;
    }
}
