//! Reference-counted model cache
//!
//! The cache records which models are resident and on which device. A single
//! mutex guards every entry; operations that touch device state take the
//! cache lock first and the registry lock second, never the reverse.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::device::{DeviceRegistry, DeviceView};
use crate::strategy::Placement;
use crate::types::{DeviceId, ModelId};
use crate::{PoolError, Result};

/// Residency state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Loading,
    Ready,
}

/// Progress of a model load, observed by leases waiting on it
#[derive(Debug, Clone, PartialEq)]
enum LoadPhase {
    Loading,
    Ready,
    /// The loader went away without a result; a waiter may take over
    Abandoned,
    /// The load failed; waiters fail with the same error
    Failed(PoolError),
}

/// Cache entry
#[derive(Debug)]
struct CacheEntry {
    /// Footprint in bytes
    size: u64,
    /// Device holding the allocation
    device_id: DeviceId,
    /// Wall-clock load time
    load_time: DateTime<Utc>,
    /// Last acquire, drives idle and LRU decisions
    last_accessed: Instant,
    /// Active users
    ref_count: u32,
    state: ModelState,
    /// A lease is currently running the load
    load_owned: bool,
    phase: watch::Sender<LoadPhase>,
}

/// Snapshot of one cache entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedModelView {
    pub name: ModelId,
    pub size: u64,
    pub device_id: DeviceId,
    pub load_time: DateTime<Utc>,
    /// Time since last access
    pub idle: Duration,
    pub ref_count: u32,
    pub state: ModelState,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Resident entries
    pub entries: usize,
    /// Bytes held by resident entries
    pub cached_bytes: u64,
}

impl CacheStats {
    /// Get hit ratio
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

/// Model cache
#[derive(Debug)]
pub struct ModelCache {
    entries: Mutex<HashMap<ModelId, CacheEntry>>,
    registry: Arc<DeviceRegistry>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

fn capacity_error(model: &str, e: PoolError) -> PoolError {
    match e {
        PoolError::NoCapableDevice { required } => {
            PoolError::InsufficientCapacity { model: model.to_string(), required }
        }
        other => other,
    }
}

impl ModelCache {
    #[must_use]
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            registry,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    fn view(name: &str, entry: &CacheEntry) -> CachedModelView {
        CachedModelView {
            name: name.to_string(),
            size: entry.size,
            device_id: entry.device_id.clone(),
            load_time: entry.load_time,
            idle: entry.last_accessed.elapsed(),
            ref_count: entry.ref_count,
            state: entry.state,
        }
    }

    fn entry(size: u64, device_id: &str, ref_count: u32, state: ModelState) -> CacheEntry {
        let phase = match state {
            ModelState::Loading => LoadPhase::Loading,
            ModelState::Ready => LoadPhase::Ready,
        };
        CacheEntry {
            size,
            device_id: device_id.to_string(),
            load_time: Utc::now(),
            last_accessed: Instant::now(),
            ref_count,
            state,
            load_owned: state == ModelState::Loading,
            phase: watch::channel(phase).0,
        }
    }

    /// Takes a reference on a resident model
    ///
    /// A hit bumps the reference count and the access time. A miss only
    /// counts the miss.
    pub fn get(&self, name: &str) -> Option<CachedModelView> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(name) {
            entry.ref_count += 1;
            entry.last_accessed = Instant::now();
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(Self::view(name, entry))
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Looks at an entry without taking a reference
    #[must_use]
    pub fn peek(&self, name: &str) -> Option<CachedModelView> {
        self.entries.lock().get(name).map(|entry| Self::view(name, entry))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Records a model already loaded on `device_id`, with one reference
    pub fn put(&self, name: &str, size: u64, device_id: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(name) {
            return Err(PoolError::AlreadyAllocated {
                device: existing.device_id.clone(),
                model: name.to_string(),
            });
        }
        entries.insert(name.to_string(), Self::entry(size, device_id, 1, ModelState::Ready));
        Ok(())
    }

    /// Drops one reference, never below zero
    pub fn release(&self, name: &str) -> Result<u32> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(name) else {
            warn!(model = name, "Release of a model that is not cached");
            return Err(PoolError::ModelNotCached(name.to_string()));
        };
        if entry.ref_count == 0 {
            warn!(model = name, "Release of a model with no active references");
        } else {
            entry.ref_count -= 1;
        }
        Ok(entry.ref_count)
    }

    /// Evicts `name` when nothing references or is loading it, releasing its allocation
    pub fn evict_if_unused(&self, name: &str) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(name) {
            Some(entry) if entry.ref_count == 0 && !entry.load_owned => {}
            Some(entry) => {
                debug!(model = name, refs = entry.ref_count, loading = entry.load_owned, "Eviction skipped, model in use");
                return false;
            }
            None => return false,
        }
        if let Some(entry) = entries.remove(name) {
            self.finish_eviction(name, &entry);
        }
        true
    }

    fn finish_eviction(&self, name: &str, entry: &CacheEntry) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        match self.registry.release(&entry.device_id, name) {
            Ok(allocation) => {
                info!(model = name, device = %entry.device_id, freed = allocation.memory_used, "Evicted model");
            }
            Err(e) => {
                error!(model = name, device = %entry.device_id, error = %e, "Evicted model had no matching allocation");
            }
        }
    }

    /// Gets or allocates a model, returning a lease holding one reference
    ///
    /// On a miss a device is chosen through `placement`, its memory is
    /// reserved and the entry starts out `Loading`; the returned lease owns
    /// the load. The whole sequence runs under the cache lock, so concurrent
    /// misses on one model produce a single allocation.
    pub fn acquire(self: &Arc<Self>, name: &str, size: u64, placement: &Placement) -> Result<Lease> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(name) {
            entry.ref_count += 1;
            entry.last_accessed = Instant::now();
            self.hits.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.registry.touch(&entry.device_id, name) {
                error!(model = name, device = %entry.device_id, error = %e, "Cached model has no allocation");
            }
            let mut lease = Lease::new(Arc::clone(self), name, &entry.device_id, true, false);
            if entry.state == ModelState::Loading {
                if entry.load_owned {
                    lease.pending = Some(entry.phase.subscribe());
                } else {
                    // an abandoned load is taken over by the next user
                    entry.load_owned = true;
                    entry.phase.send_replace(LoadPhase::Loading);
                    lease.owns_load = true;
                }
            }
            return Ok(lease);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let candidates = self.registry.list_available(size);
        let device_id = placement.select(size, &candidates).map_err(|e| capacity_error(name, e))?;
        self.registry.reserve(&device_id, name, size)?;
        entries.insert(name.to_string(), Self::entry(size, &device_id, 1, ModelState::Loading));
        debug!(model = name, device = %device_id, size, "Allocated model on cache miss");
        Ok(Lease::new(Arc::clone(self), name, &device_id, false, true))
    }

    /// Allocates an unreferenced `Loading` entry for a warm or speculative load
    ///
    /// `select` receives devices with at least `size` bytes free. Returns
    /// `None` when the model is already resident. The caller owns the load
    /// and must finish with [`mark_ready`](Self::mark_ready) or
    /// [`discard_loading`](Self::discard_loading).
    pub fn insert_preloaded<F>(&self, name: &str, size: u64, select: F) -> Result<Option<DeviceId>>
    where
        F: FnOnce(&[DeviceView]) -> Result<DeviceId>,
    {
        let mut entries = self.entries.lock();
        if entries.contains_key(name) {
            return Ok(None);
        }
        let candidates = self.registry.list_available(size);
        let device_id = select(&candidates).map_err(|e| capacity_error(name, e))?;
        self.registry.reserve(&device_id, name, size)?;
        entries.insert(name.to_string(), Self::entry(size, &device_id, 0, ModelState::Loading));
        Ok(Some(device_id))
    }

    /// Finishes a load and wakes every lease waiting on it
    pub fn mark_ready(&self, name: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(name).ok_or_else(|| PoolError::ModelNotCached(name.to_string()))?;
        entry.state = ModelState::Ready;
        entry.load_owned = false;
        entry.phase.send_replace(LoadPhase::Ready);
        Ok(())
    }

    /// Gives up on a load; removes the entry if nothing references it
    ///
    /// Leases waiting on the load are told to take it over.
    pub fn discard_loading(&self, name: &str) -> bool {
        self.abandon_load(name, None)
    }

    fn abandon_load(&self, name: &str, failure: Option<PoolError>) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(name) {
            Some(entry) if entry.state == ModelState::Loading => entry.load_owned = false,
            _ => return false,
        }
        self.settle_unowned(&mut entries, name, failure)
    }

    /// Drops an unowned `Loading` entry nobody references, else signals waiters
    fn settle_unowned(
        &self,
        entries: &mut HashMap<ModelId, CacheEntry>,
        name: &str,
        failure: Option<PoolError>,
    ) -> bool {
        let Some(entry) = entries.get(name) else { return false };
        if entry.state != ModelState::Loading || entry.load_owned {
            return false;
        }
        if entry.ref_count > 0 {
            entry.phase.send_replace(failure.map_or(LoadPhase::Abandoned, LoadPhase::Failed));
            return false;
        }
        if let Some(entry) = entries.remove(name) {
            if let Err(e) = self.registry.release(&entry.device_id, name) {
                error!(model = name, device = %entry.device_id, error = %e, "Discarded model had no matching allocation");
            }
            debug!(model = name, device = %entry.device_id, "Discarded unfinished load");
        }
        true
    }

    /// Claims an unowned load for a waiting lease
    fn take_over(&self, name: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(name).ok_or_else(|| PoolError::ModelNotCached(name.to_string()))?;
        if entry.state != ModelState::Loading || entry.load_owned {
            return Ok(false);
        }
        entry.load_owned = true;
        entry.phase.send_replace(LoadPhase::Loading);
        Ok(true)
    }

    /// Releases a lease's reference and, if it held the load, the load too
    fn release_lease(&self, name: &str, owned_load: bool) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(name) else {
            warn!(model = name, "Lease released for a model that is not cached");
            return;
        };
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if owned_load && entry.state == ModelState::Loading {
            entry.load_owned = false;
        }
        if owned_load || entry.ref_count == 0 {
            self.settle_unowned(&mut entries, name, None);
        }
    }

    /// Models not accessed for at least `threshold`, by name
    #[must_use]
    pub fn idle_candidates(&self, threshold: Duration) -> Vec<ModelId> {
        let entries = self.entries.lock();
        let mut idle: Vec<ModelId> = entries
            .iter()
            .filter(|(_, e)| e.last_accessed.elapsed() >= threshold)
            .map(|(name, _)| name.clone())
            .collect();
        idle.sort();
        idle
    }

    /// Evicts the least recently used unreferenced model
    pub fn evict_lru(&self) -> Option<ModelId> {
        let mut entries = self.entries.lock();
        let victim = entries
            .iter()
            .filter(|(_, e)| e.ref_count == 0 && !e.load_owned)
            .min_by(|a, b| a.1.last_accessed.cmp(&b.1.last_accessed).then_with(|| a.0.cmp(b.0)))
            .map(|(name, _)| name.clone())?;
        let entry = entries.remove(&victim)?;
        self.finish_eviction(&victim, &entry);
        Some(victim)
    }

    /// All entries, by name
    #[must_use]
    pub fn snapshot(&self) -> Vec<CachedModelView> {
        let entries = self.entries.lock();
        let mut views: Vec<_> = entries.iter().map(|(name, e)| Self::view(name, e)).collect();
        views.sort_by(|a, b| a.name.cmp(&b.name));
        views
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: entries.len(),
            cached_bytes: entries.values().map(|e| e.size).sum(),
        }
    }
}

/// One reference on a cached model, released on drop
///
/// A lease that owns the model's load and is dropped before
/// [`mark_ready`](Self::mark_ready) also discards the unfinished entry.
#[derive(Debug)]
pub struct Lease {
    cache: Arc<ModelCache>,
    model: ModelId,
    device: DeviceId,
    cache_hit: bool,
    owns_load: bool,
    /// Set while another lease is loading the model
    pending: Option<watch::Receiver<LoadPhase>>,
}

impl Lease {
    fn new(cache: Arc<ModelCache>, model: &str, device: &str, cache_hit: bool, owns_load: bool) -> Self {
        Self {
            cache,
            model: model.to_string(),
            device: device.to_string(),
            cache_hit,
            owns_load,
            pending: None,
        }
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[must_use]
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Whether the model was resident before this lease
    #[must_use]
    pub const fn is_hit(&self) -> bool {
        self.cache_hit
    }

    /// Whether the holder must run the runtime load
    #[must_use]
    pub const fn needs_load(&self) -> bool {
        self.owns_load
    }

    /// Whether another lease's load is still being waited on
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Waits for a load run by another lease
    ///
    /// Returns once the model is ready, or once this lease has taken over an
    /// abandoned load (then [`needs_load`](Self::needs_load) is true). A
    /// failed load fails every waiter with the loader's error.
    pub async fn wait_ready(&mut self) -> Result<()> {
        while let Some(rx) = self.pending.as_mut() {
            let phase = rx.wait_for(|p| *p != LoadPhase::Loading).await.map(|p| p.clone());
            match phase {
                Ok(LoadPhase::Ready) => self.pending = None,
                Ok(LoadPhase::Failed(e)) => {
                    self.pending = None;
                    return Err(e);
                }
                Ok(LoadPhase::Abandoned | LoadPhase::Loading) | Err(_) => {
                    if self.cache.take_over(&self.model)? {
                        debug!(model = %self.model, "Took over abandoned load");
                        self.pending = None;
                        self.owns_load = true;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn mark_ready(&mut self) -> Result<()> {
        self.cache.mark_ready(&self.model)?;
        self.owns_load = false;
        Ok(())
    }

    /// Reports a failed load to every lease waiting on it
    pub fn fail_load(&mut self, error: &PoolError) {
        if self.owns_load {
            self.owns_load = false;
            self.cache.abandon_load(&self.model, Some(error.clone()));
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.cache.release_lease(&self.model, self.owns_load);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GIB;
    use crate::device::DeviceSpec;
    use crate::strategy::StrategyKind;

    fn setup(devices: usize) -> (Arc<ModelCache>, Placement) {
        let specs: Vec<_> = (0..devices).map(|i| DeviceSpec::new(format!("gpu_{i}"), 24 * GIB)).collect();
        let registry = Arc::new(DeviceRegistry::from_specs(&specs).unwrap());
        (Arc::new(ModelCache::new(registry)), Placement::new(StrategyKind::FirstFit, None))
    }

    #[test]
    fn test_get_after_put_bumps_refcount() {
        let (cache, _) = setup(1);
        cache.put("llama", GIB, "gpu_0").unwrap();
        assert_eq!(cache.peek("llama").unwrap().ref_count, 1);
        let view = cache.get("llama").unwrap();
        assert_eq!(view.ref_count, 2);
        assert_eq!(view.device_id, "gpu_0");
        assert_eq!(cache.stats().hits, 1);
        assert!(cache.put("llama", GIB, "gpu_1").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_refreshes_last_accessed() {
        let (cache, _) = setup(1);
        cache.put("llama", GIB, "gpu_0").unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(cache.peek("llama").unwrap().idle, Duration::from_secs(60));
        cache.get("llama").unwrap();
        assert_eq!(cache.peek("llama").unwrap().idle, Duration::ZERO);
    }

    #[test]
    fn test_miss_counts() {
        let (cache, _) = setup(1);
        assert!(cache.get("absent").is_none());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_ratio(), 0.0);
    }

    #[test]
    fn test_release_floors_at_zero() {
        let (cache, _) = setup(1);
        cache.put("m", GIB, "gpu_0").unwrap();
        assert_eq!(cache.release("m").unwrap(), 0);
        assert_eq!(cache.release("m").unwrap(), 0);
        assert_eq!(cache.release("other"), Err(PoolError::ModelNotCached("other".into())));
    }

    #[test]
    fn test_evict_requires_zero_refs() {
        let (cache, _) = setup(1);
        cache.registry().reserve("gpu_0", "m", 4 * GIB).unwrap();
        cache.put("m", 4 * GIB, "gpu_0").unwrap();

        assert!(!cache.evict_if_unused("m"));
        assert!(cache.contains("m"));

        cache.release("m").unwrap();
        assert!(cache.evict_if_unused("m"));
        assert!(!cache.contains("m"));
        assert_eq!(cache.registry().get("gpu_0").unwrap().used_memory, 0);
        assert_eq!(cache.stats().evictions, 1);
        assert!(!cache.evict_if_unused("m"));
    }

    #[test]
    fn test_acquire_miss_then_hit() {
        let (cache, placement) = setup(2);
        let mut first = cache.acquire("m", 10 * GIB, &placement).unwrap();
        assert!(!first.is_hit());
        assert!(first.needs_load());
        assert_eq!(first.device(), "gpu_0");
        assert_eq!(cache.peek("m").unwrap().state, ModelState::Loading);

        let second = cache.acquire("m", 10 * GIB, &placement).unwrap();
        assert!(second.is_hit());
        assert!(!second.needs_load());
        assert!(second.is_pending());
        assert_eq!(cache.peek("m").unwrap().ref_count, 2);
        assert_eq!(cache.registry().totals().allocations, 1);

        first.mark_ready().unwrap();
        assert_eq!(cache.peek("m").unwrap().state, ModelState::Ready);
        drop(first);
        drop(second);
        assert_eq!(cache.peek("m").unwrap().ref_count, 0);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert!((stats.hit_ratio() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_acquire_insufficient_capacity() {
        let (cache, placement) = setup(1);
        let err = cache.acquire("huge", 25 * GIB, &placement).unwrap_err();
        assert_eq!(err, PoolError::InsufficientCapacity { model: "huge".into(), required: 25 * GIB });
        assert!(!cache.contains("huge"));
    }

    #[test]
    fn test_unfinished_load_discarded_on_drop() {
        let (cache, placement) = setup(1);
        let lease = cache.acquire("m", 10 * GIB, &placement).unwrap();
        drop(lease);
        assert!(!cache.contains("m"));
        assert_eq!(cache.registry().get("gpu_0").unwrap().used_memory, 0);
    }

    #[tokio::test]
    async fn test_abandoned_load_taken_over() {
        let (cache, placement) = setup(1);
        let loader = cache.acquire("m", 10 * GIB, &placement).unwrap();
        let mut waiter = cache.acquire("m", 10 * GIB, &placement).unwrap();
        drop(loader);
        assert_eq!(cache.peek("m").unwrap().ref_count, 1);

        waiter.wait_ready().await.unwrap();
        assert!(waiter.needs_load());
        assert!(!waiter.is_pending());
        waiter.mark_ready().unwrap();
        assert_eq!(cache.peek("m").unwrap().state, ModelState::Ready);
        assert_eq!(cache.registry().totals().allocations, 1);
    }

    #[tokio::test]
    async fn test_unowned_load_taken_over_on_hit() {
        let (cache, placement) = setup(1);
        cache.insert_preloaded("m", 4 * GIB, |c| placement.select(4 * GIB, c)).unwrap();
        let mut waiter = cache.acquire("m", 4 * GIB, &placement).unwrap();
        assert!(waiter.is_pending());
        assert!(!cache.discard_loading("m"));

        waiter.wait_ready().await.unwrap();
        assert!(waiter.needs_load());
        drop(waiter);
        assert!(!cache.contains("m"));
        assert_eq!(cache.registry().totals().allocations, 0);
    }

    #[tokio::test]
    async fn test_waiter_resumes_when_load_finishes() {
        let (cache, placement) = setup(1);
        let mut loader = cache.acquire("m", 10 * GIB, &placement).unwrap();
        let mut waiter = cache.acquire("m", 10 * GIB, &placement).unwrap();

        let task = tokio::spawn(async move {
            waiter.wait_ready().await.map(|()| waiter.needs_load())
        });
        tokio::task::yield_now().await;
        assert!(!task.is_finished());

        loader.mark_ready().unwrap();
        assert_eq!(task.await.unwrap(), Ok(false));
    }

    #[tokio::test]
    async fn test_waiter_fails_with_loader_error() {
        let (cache, placement) = setup(1);
        let mut loader = cache.acquire("m", 10 * GIB, &placement).unwrap();
        let mut first = cache.acquire("m", 10 * GIB, &placement).unwrap();
        let mut second = cache.acquire("m", 10 * GIB, &placement).unwrap();

        let error = PoolError::Runtime { model: "m".into(), message: "bad weights".into() };
        loader.fail_load(&error);
        drop(loader);
        assert_eq!(first.wait_ready().await, Err(error.clone()));
        assert_eq!(second.wait_ready().await, Err(error));
        assert!(cache.contains("m"));

        drop(first);
        drop(second);
        assert!(!cache.contains("m"));
        assert_eq!(cache.registry().totals().allocations, 0);
    }

    #[test]
    fn test_insert_preloaded() {
        let (cache, placement) = setup(1);
        let device = cache.insert_preloaded("m", 4 * GIB, |c| placement.select(4 * GIB, c)).unwrap();
        assert_eq!(device.as_deref(), Some("gpu_0"));
        assert_eq!(cache.peek("m").unwrap().ref_count, 0);
        let again = cache.insert_preloaded("m", 4 * GIB, |c| placement.select(4 * GIB, c)).unwrap();
        assert_eq!(again, None);
        cache.mark_ready("m").unwrap();
        assert_eq!(cache.peek("m").unwrap().state, ModelState::Ready);
        assert!(!cache.discard_loading("m"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_candidates_and_lru() {
        let (cache, _) = setup(1);
        for model in ["old", "new", "busy"] {
            cache.registry().reserve("gpu_0", model, GIB).unwrap();
        }
        cache.put("old", GIB, "gpu_0").unwrap();
        cache.release("old").unwrap();
        tokio::time::advance(Duration::from_secs(100)).await;
        cache.put("new", GIB, "gpu_0").unwrap();
        cache.release("new").unwrap();
        cache.put("busy", GIB, "gpu_0").unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;

        assert_eq!(cache.idle_candidates(Duration::from_secs(50)), vec!["old".to_string()]);
        assert_eq!(cache.idle_candidates(Duration::from_secs(5)).len(), 3);

        assert_eq!(cache.evict_lru().as_deref(), Some("old"));
        assert_eq!(cache.evict_lru().as_deref(), Some("new"));
        assert_eq!(cache.evict_lru(), None);
        assert!(cache.contains("busy"));
    }

    #[test]
    fn test_concurrent_acquire_single_allocation() {
        let (cache, placement) = setup(4);
        let placement = Arc::new(placement);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (cache, placement) = (cache.clone(), placement.clone());
                std::thread::spawn(move || {
                    let lease = cache.acquire("shared", 8 * GIB, &placement).unwrap();
                    let device = lease.device().to_string();
                    std::mem::forget(lease);
                    device
                })
            })
            .collect();
        let devices: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(devices.iter().all(|d| d == &devices[0]));
        assert_eq!(cache.registry().totals().allocations, 1);
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.peek("shared").unwrap().ref_count, 8);
    }

    #[test]
    fn test_concurrent_acquire_vs_evict() {
        let (cache, placement) = setup(1);
        let mut lease = cache.acquire("m", GIB, &placement).unwrap();
        lease.mark_ready().unwrap();

        let evictors: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || (0..200).filter(|_| cache.evict_if_unused("m")).count())
            })
            .collect();
        let acquirers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let placement = Placement::new(StrategyKind::FirstFit, None);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let lease = cache.acquire("m", GIB, &placement).unwrap();
                        assert!(lease.is_hit());
                    }
                })
            })
            .collect();
        for h in acquirers {
            h.join().unwrap();
        }
        let evicted: usize = evictors.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(evicted, 0);
        assert_eq!(cache.registry().totals().allocations, 1);
        drop(lease);
        assert!(cache.evict_if_unused("m"));
    }
}
