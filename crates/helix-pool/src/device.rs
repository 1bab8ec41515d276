//! Device registry
//!
//! Tracks logical accelerator devices, the model allocations they hold and
//! any pinned reservations. The registry is the single owner of device,
//! allocation and reservation records. Every mutation runs inside one
//! exclusive critical section, so `reserve` is a check-then-commit with no
//! window for a competing caller to overcommit a device.
//!
//! Devices are kept in a `BTreeMap`, which gives every listing a stable
//! ascending device-ID order.

use crate::reservation::{Reservation, ReservationId};
use crate::types::{DeviceId, ModelId};
use crate::{PoolError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Static description of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub id: DeviceId,
    #[serde(default)]
    pub name: String,
    /// Total memory in bytes
    pub total_memory: u64,
}

impl DeviceSpec {
    pub fn new(id: impl Into<DeviceId>, total_memory: u64) -> Self {
        let id = id.into();
        Self { name: id.clone(), id, total_memory }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Derived device status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Available,
    Busy,
    Error,
}

/// A model's memory allocation on one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub model_id: ModelId,
    pub memory_required: u64,
    pub memory_used: u64,
    pub load_time: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub inference_count: u64,
    pub error_count: u64,
}

impl Allocation {
    fn new(model_id: ModelId, memory: u64) -> Self {
        let now = Utc::now();
        Self {
            model_id,
            memory_required: memory,
            memory_used: memory,
            load_time: now,
            last_accessed: now,
            inference_count: 0,
            error_count: 0,
        }
    }
}

/// Read-only device snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceView {
    pub id: DeviceId,
    pub name: String,
    pub total_memory: u64,
    pub used_memory: u64,
    /// Memory held by unexpired reservations
    pub reserved_memory: u64,
    /// `total - used - reserved`
    pub free_memory: u64,
    /// Percent, externally reported or derived from memory occupancy
    pub utilization: f64,
    pub temperature: Option<f64>,
    pub status: DeviceStatus,
    pub allocations: Vec<Allocation>,
    pub last_update: DateTime<Utc>,
}

impl DeviceView {
    /// Whether the device can host `required` more bytes
    #[must_use]
    pub fn can_host(&self, required: u64) -> bool {
        self.status != DeviceStatus::Error && self.free_memory >= required
    }
}

/// Per-model usage folded in from destroyed allocations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub inference_count: u64,
    pub error_count: u64,
}

/// Aggregate figures over all devices
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryTotals {
    pub devices: usize,
    pub errored_devices: usize,
    pub total_memory: u64,
    pub used_memory: u64,
    pub reserved_memory: u64,
    pub free_memory: u64,
    pub allocations: usize,
    pub reservations: usize,
}

#[derive(Debug)]
struct Device {
    spec: DeviceSpec,
    used_memory: u64,
    reported_utilization: Option<f64>,
    temperature: Option<f64>,
    error: Option<String>,
    allocations: BTreeMap<ModelId, Allocation>,
    last_update: DateTime<Utc>,
}

impl Device {
    fn new(spec: DeviceSpec) -> Self {
        Self {
            spec,
            used_memory: 0,
            reported_utilization: None,
            temperature: None,
            error: None,
            allocations: BTreeMap::new(),
            last_update: Utc::now(),
        }
    }

    fn status(&self) -> DeviceStatus {
        if self.error.is_some() {
            DeviceStatus::Error
        } else if self.allocations.is_empty() {
            DeviceStatus::Available
        } else {
            DeviceStatus::Busy
        }
    }

    fn utilization(&self) -> f64 {
        self.reported_utilization.unwrap_or_else(|| {
            if self.spec.total_memory == 0 {
                0.0
            } else {
                self.used_memory as f64 / self.spec.total_memory as f64 * 100.0
            }
        })
    }

    fn free_memory(&self, reserved: u64) -> u64 {
        self.spec.total_memory.saturating_sub(self.used_memory).saturating_sub(reserved)
    }

    fn view(&self, reserved: u64) -> DeviceView {
        DeviceView {
            id: self.spec.id.clone(),
            name: self.spec.name.clone(),
            total_memory: self.spec.total_memory,
            used_memory: self.used_memory,
            reserved_memory: reserved,
            free_memory: self.free_memory(reserved),
            utilization: self.utilization(),
            temperature: self.temperature,
            status: self.status(),
            allocations: self.allocations.values().cloned().collect(),
            last_update: self.last_update,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    devices: BTreeMap<DeviceId, Device>,
    reservations: BTreeMap<ReservationId, Reservation>,
    usage_history: HashMap<ModelId, UsageRecord>,
}

impl RegistryState {
    fn reserved_on(&self, device: &str, now: DateTime<Utc>) -> u64 {
        self.reservations
            .values()
            .filter(|r| r.device_id == device && !r.is_expired_at(now))
            .map(|r| r.memory_size)
            .sum()
    }

    fn device_mut(&mut self, id: &str) -> Result<&mut Device> {
        self.devices.get_mut(id).ok_or_else(|| PoolError::DeviceNotFound(id.to_string()))
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.reservations.len();
        self.reservations.retain(|_, r| !r.is_expired_at(now));
        before - self.reservations.len()
    }
}

/// Registry of accelerator devices
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    state: RwLock<RegistryState>,
}

impl DeviceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from an inventory, rejecting duplicate IDs
    pub fn from_specs(specs: &[DeviceSpec]) -> Result<Self> {
        let registry = Self::new();
        for spec in specs {
            registry.register(spec.clone())?;
        }
        Ok(registry)
    }

    pub fn register(&self, spec: DeviceSpec) -> Result<()> {
        let mut state = self.state.write();
        if state.devices.contains_key(&spec.id) {
            return Err(PoolError::InvalidConfig(format!("duplicate device id {}", spec.id)));
        }
        info!(device = %spec.id, total_memory = spec.total_memory, "Registered device");
        state.devices.insert(spec.id.clone(), Device::new(spec));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<DeviceView> {
        let state = self.state.read();
        let device = state.devices.get(id).ok_or_else(|| PoolError::DeviceNotFound(id.to_string()))?;
        Ok(device.view(state.reserved_on(id, Utc::now())))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().devices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().devices.is_empty()
    }

    /// Every device, ascending by ID
    #[must_use]
    pub fn snapshot(&self) -> Vec<DeviceView> {
        let state = self.state.read();
        let now = Utc::now();
        state.devices.values().map(|d| d.view(state.reserved_on(&d.spec.id, now))).collect()
    }

    /// Devices not in error with at least `min_free` bytes free after reservations
    #[must_use]
    pub fn list_available(&self, min_free: u64) -> Vec<DeviceView> {
        let state = self.state.read();
        let now = Utc::now();
        state
            .devices
            .values()
            .filter(|d| d.error.is_none())
            .map(|d| d.view(state.reserved_on(&d.spec.id, now)))
            .filter(|v| v.free_memory >= min_free)
            .collect()
    }

    /// Allocates `memory` bytes on `device` for `model`
    pub fn reserve(&self, device: &str, model: &str, memory: u64) -> Result<Allocation> {
        let mut state = self.state.write();
        let now = Utc::now();
        state.purge_expired(now);
        let reserved = state.reserved_on(device, now);
        let dev = state.device_mut(device)?;

        if dev.error.is_some() {
            return Err(PoolError::DeviceUnavailable(device.to_string()));
        }
        if dev.allocations.contains_key(model) {
            return Err(PoolError::AlreadyAllocated {
                device: device.to_string(),
                model: model.to_string(),
            });
        }
        if dev.free_memory(reserved) < memory {
            return Err(PoolError::InsufficientCapacity { model: model.to_string(), required: memory });
        }

        let allocation = Allocation::new(model.to_string(), memory);
        dev.used_memory += memory;
        dev.allocations.insert(model.to_string(), allocation.clone());
        dev.last_update = now;
        debug!(device, model, memory, used = dev.used_memory, "Reserved device memory");
        Ok(allocation)
    }

    /// Destroys an allocation, folding its counters into usage history
    pub fn release(&self, device: &str, model: &str) -> Result<Allocation> {
        let mut state = self.state.write();
        let dev = state.device_mut(device)?;
        let allocation = dev.allocations.remove(model).ok_or_else(|| PoolError::AllocationNotFound {
            device: device.to_string(),
            model: model.to_string(),
        })?;
        dev.used_memory = dev.used_memory.saturating_sub(allocation.memory_used);
        dev.last_update = Utc::now();
        debug!(device, model, freed = allocation.memory_used, used = dev.used_memory, "Released device memory");

        let usage = state.usage_history.entry(model.to_string()).or_default();
        usage.inference_count += allocation.inference_count;
        usage.error_count += allocation.error_count;
        Ok(allocation)
    }

    /// Records an externally reported utilization percentage
    pub fn set_utilization(&self, device: &str, percent: f64) -> Result<()> {
        let mut state = self.state.write();
        let dev = state.device_mut(device)?;
        dev.reported_utilization = Some(percent.clamp(0.0, 100.0));
        dev.last_update = Utc::now();
        Ok(())
    }

    pub fn set_temperature(&self, device: &str, celsius: f64) -> Result<()> {
        let mut state = self.state.write();
        let dev = state.device_mut(device)?;
        dev.temperature = Some(celsius);
        dev.last_update = Utc::now();
        Ok(())
    }

    /// Flags a device as errored until [`clear_error`](Self::clear_error)
    pub fn mark_error(&self, device: &str, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        let mut state = self.state.write();
        let dev = state.device_mut(device)?;
        warn!(device, %reason, "Device marked as errored");
        dev.error = Some(reason);
        dev.last_update = Utc::now();
        Ok(())
    }

    pub fn clear_error(&self, device: &str) -> Result<()> {
        let mut state = self.state.write();
        let dev = state.device_mut(device)?;
        if dev.error.take().is_some() {
            info!(device, "Device error cleared");
        }
        dev.last_update = Utc::now();
        Ok(())
    }

    /// Counts one inference against a live allocation
    pub fn record_inference(&self, device: &str, model: &str, ok: bool) -> Result<()> {
        let mut state = self.state.write();
        let dev = state.device_mut(device)?;
        let allocation = dev.allocations.get_mut(model).ok_or_else(|| PoolError::AllocationNotFound {
            device: device.to_string(),
            model: model.to_string(),
        })?;
        if ok {
            allocation.inference_count += 1;
        } else {
            allocation.error_count += 1;
        }
        allocation.last_accessed = Utc::now();
        Ok(())
    }

    pub fn touch(&self, device: &str, model: &str) -> Result<()> {
        let mut state = self.state.write();
        let dev = state.device_mut(device)?;
        let allocation = dev.allocations.get_mut(model).ok_or_else(|| PoolError::AllocationNotFound {
            device: device.to_string(),
            model: model.to_string(),
        })?;
        allocation.last_accessed = Utc::now();
        Ok(())
    }

    /// Device currently holding `model`, if any
    #[must_use]
    pub fn locate(&self, model: &str) -> Option<DeviceId> {
        let state = self.state.read();
        state
            .devices
            .values()
            .find(|d| d.allocations.contains_key(model))
            .map(|d| d.spec.id.clone())
    }

    /// `1 - largest_free / total_free` over devices not in error
    #[must_use]
    pub fn fragmentation(&self) -> f64 {
        let state = self.state.read();
        let now = Utc::now();
        let (total, largest) = state
            .devices
            .values()
            .filter(|d| d.error.is_none())
            .map(|d| d.free_memory(state.reserved_on(&d.spec.id, now)))
            .fold((0u64, 0u64), |(total, largest), free| (total + free, largest.max(free)));
        if total == 0 { 0.0 } else { 1.0 - largest as f64 / total as f64 }
    }

    /// Models ranked by inference count, live plus historical
    ///
    /// Ties break by model name. Models with no recorded inferences are left out.
    #[must_use]
    pub fn usage_ranking(&self) -> Vec<(ModelId, u64)> {
        let state = self.state.read();
        let mut counts: HashMap<&str, u64> = state
            .usage_history
            .iter()
            .map(|(model, usage)| (model.as_str(), usage.inference_count))
            .collect();
        for device in state.devices.values() {
            for allocation in device.allocations.values() {
                *counts.entry(allocation.model_id.as_str()).or_default() += allocation.inference_count;
            }
        }
        let mut ranking: Vec<(ModelId, u64)> = counts
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(model, count)| (model.to_string(), count))
            .collect();
        ranking.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranking
    }

    /// Historical usage for a model whose allocations have been destroyed
    #[must_use]
    pub fn usage_history(&self, model: &str) -> UsageRecord {
        self.state.read().usage_history.get(model).copied().unwrap_or_default()
    }

    /// Pins `size` bytes on `device`, optionally expiring after `ttl`
    pub fn reserve_memory(
        &self,
        device: &str,
        size: u64,
        purpose: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Result<Reservation> {
        let purpose = purpose.into();
        let mut state = self.state.write();
        let now = Utc::now();
        state.purge_expired(now);
        let reserved = state.reserved_on(device, now);
        let dev = state.device_mut(device)?;
        if dev.error.is_some() {
            return Err(PoolError::DeviceUnavailable(device.to_string()));
        }
        if dev.free_memory(reserved) < size {
            return Err(PoolError::InsufficientCapacity { model: purpose, required: size });
        }
        dev.last_update = now;
        let reservation = Reservation::new(device.to_string(), size, purpose, ttl);
        info!(device, size, id = %reservation.id, purpose = %reservation.purpose, "Reserved pinned memory");
        state.reservations.insert(reservation.id, reservation.clone());
        Ok(reservation)
    }

    pub fn cancel_reservation(&self, id: ReservationId) -> Result<Reservation> {
        let mut state = self.state.write();
        let reservation = state.reservations.remove(&id).ok_or(PoolError::ReservationNotFound(id))?;
        if let Some(dev) = state.devices.get_mut(&reservation.device_id) {
            dev.last_update = Utc::now();
        }
        Ok(reservation)
    }

    #[must_use]
    pub fn reservations(&self) -> Vec<Reservation> {
        self.state.read().reservations.values().cloned().collect()
    }

    /// Drops expired reservations, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let purged = self.state.write().purge_expired(Utc::now());
        if purged > 0 {
            debug!(purged, "Purged expired reservations");
        }
        purged
    }

    #[must_use]
    pub fn totals(&self) -> RegistryTotals {
        let state = self.state.read();
        let now = Utc::now();
        let mut totals = RegistryTotals {
            devices: state.devices.len(),
            reservations: state.reservations.values().filter(|r| !r.is_expired_at(now)).count(),
            ..RegistryTotals::default()
        };
        for device in state.devices.values() {
            let reserved = state.reserved_on(&device.spec.id, now);
            if device.error.is_some() {
                totals.errored_devices += 1;
            }
            totals.total_memory += device.spec.total_memory;
            totals.used_memory += device.used_memory;
            totals.reserved_memory += reserved;
            totals.free_memory += device.free_memory(reserved);
            totals.allocations += device.allocations.len();
        }
        totals
    }
}
