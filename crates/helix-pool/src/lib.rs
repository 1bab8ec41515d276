#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]

//! Accelerator memory scheduler for the Helix inference pool
//!
//! This crate allocates scarce device memory among model-serving requests,
//! keeps loaded models resident between requests, and dispatches inference
//! jobs across a bounded worker pool.
//!
//! # Key Components
//!
//! - **Device Registry**: logical accelerator devices, allocations and reservations
//! - **Allocation Strategy**: best-fit, first-fit, round-robin and least-loaded placement
//! - **Model Cache**: reference-counted residency with RAII leases
//! - **Job Queue**: bounded submission with backpressure, deadlines and cancellation
//! - **Reclaimer**: defragmentation bias, idle eviction and usage-driven preloading
//! - **Inference Pool**: facade tying the components together

pub mod cache;
pub mod config;
pub mod device;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod reclaim;
pub mod reservation;
pub mod runtime;
pub mod strategy;
pub mod types;
mod worker;

pub use cache::{CacheStats, CachedModelView, Lease, ModelCache, ModelState};
pub use config::{GIB, PoolConfig};
pub use device::{
    Allocation, DeviceRegistry, DeviceSpec, DeviceStatus, DeviceView, RegistryTotals, UsageRecord,
};
pub use metrics::{MetricsSink, NoopMetrics};
pub use pool::{InferencePool, ModelStatus, ModelStatusKind, SystemStatus};
pub use queue::{JobHandle, JobState, JobTracker, QueueStats};
pub use reclaim::{ReclaimReport, Reclaimer};
pub use reservation::{Reservation, ReservationId};
pub use runtime::{Generation, ModelRuntime, SimulatedRuntime};
pub use strategy::{
    AllocationStrategy, BestFit, FirstFit, LeastLoaded, Placement, RoundRobin, StrategyKind,
};
pub use types::{
    DeviceId, FinishReason, InferenceRequest, InferenceResponse, JobId, ModelId, Priority,
};

use std::time::Duration;
use thiserror::Error;

/// Scheduler error types
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PoolError {
    /// No device can host the request
    #[error("Insufficient capacity for model {model}: {required} bytes required")]
    InsufficientCapacity { model: ModelId, required: u64 },

    /// Strategy found no candidate with enough free memory
    #[error("No capable device for {required} bytes")]
    NoCapableDevice { required: u64 },

    /// Job queue is at capacity
    #[error("Job queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Job deadline elapsed before a result was delivered
    #[error("Job {job} timed out after {waited:?}")]
    Timeout { job: JobId, waited: Duration },

    /// Release of an allocation the device does not hold
    #[error("No allocation for model {model} on device {device}")]
    AllocationNotFound { device: DeviceId, model: ModelId },

    /// Model has no cache entry
    #[error("Model not cached: {0}")]
    ModelNotCached(ModelId),

    /// Model still has active references
    #[error("Model {model} in use ({refs} active references)")]
    ModelInUse { model: ModelId, refs: u32 },

    /// Unknown device
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),

    /// Device flagged as errored
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(DeviceId),

    /// Model already holds an allocation on the device
    #[error("Model {model} already allocated on device {device}")]
    AlreadyAllocated { device: DeviceId, model: ModelId },

    /// Unknown reservation
    #[error("Reservation not found: {0}")]
    ReservationNotFound(ReservationId),

    /// Model runtime failure
    #[error("Runtime error for model {model}: {message}")]
    Runtime { model: ModelId, message: String },

    /// Pool is shutting down
    #[error("Pool is shutting down")]
    ShuttingDown,

    /// Request rejected before it was queued
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Strategy name not recognised
    #[error("Unknown allocation strategy: {0}")]
    UnknownStrategy(String),
}

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, PoolError>;
