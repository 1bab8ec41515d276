//! Fire-and-forget metrics seam

use helix_telemetry::MetricRegistry;

pub const ALLOCATIONS_TOTAL: &str = "helix_allocations_total";
pub const ALLOCATION_FAILURES_TOTAL: &str = "helix_allocation_failures_total";
pub const CACHE_HITS_TOTAL: &str = "helix_cache_hits_total";
pub const CACHE_MISSES_TOTAL: &str = "helix_cache_misses_total";
pub const CACHE_HIT_RATIO: &str = "helix_cache_hit_ratio";
pub const EVICTIONS_TOTAL: &str = "helix_evictions_total";
pub const PRELOADS_TOTAL: &str = "helix_preloads_total";
pub const PRELOAD_FAILURES_TOTAL: &str = "helix_preload_failures_total";
pub const QUEUE_DEPTH: &str = "helix_queue_depth";
pub const QUEUE_REJECTED_TOTAL: &str = "helix_queue_rejected_total";
pub const JOBS_COMPLETED_TOTAL: &str = "helix_jobs_completed_total";
pub const JOBS_FAILED_TOTAL: &str = "helix_jobs_failed_total";
pub const JOBS_TIMED_OUT_TOTAL: &str = "helix_jobs_timed_out_total";
pub const JOBS_CANCELLED_TOTAL: &str = "helix_jobs_cancelled_total";
pub const JOB_LATENCY_MS: &str = "helix_job_latency_ms";
pub const FRAGMENTATION: &str = "helix_fragmentation";

/// Receives scheduler metrics. Implementations must not panic.
pub trait MetricsSink: Send + Sync {
    fn incr_counter(&self, name: &str, by: u64);

    fn set_gauge(&self, name: &str, value: f64);

    fn observe(&self, name: &str, value: f64);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr_counter(&self, _name: &str, _by: u64) {}

    fn set_gauge(&self, _name: &str, _value: f64) {}

    fn observe(&self, _name: &str, _value: f64) {}
}

impl MetricsSink for MetricRegistry {
    fn incr_counter(&self, name: &str, by: u64) {
        self.counter(name).inc_by(by);
    }

    fn set_gauge(&self, name: &str, value: f64) {
        self.gauge(name).set(value);
    }

    fn observe(&self, name: &str, value: f64) {
        self.histogram(name).observe(value);
    }
}
