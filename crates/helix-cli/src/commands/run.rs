//! run command - drive the pool with simulated jobs
//!
//! Submits a burst of jobs against the simulated runtime, waits for every
//! result and prints per-outcome counts, device occupancy and, optionally,
//! the collected metrics.

use crate::gib;
use anyhow::{Result, bail};
use helix_config::HelixConfig;
use helix_pool::{InferencePool, InferenceRequest, PoolError, SimulatedRuntime};
use helix_telemetry::MetricRegistry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const PROMPTS: &[&str] = &[
    "Hello there",
    "Can you explain how attention works?",
    "Write some code that reverses a list",
    "Give me a short summary",
    "Thanks for the help",
    "Tell me something long about accelerators",
];

/// Outcome counts for one run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub submitted: usize,
    pub rejected: usize,
    pub completed: usize,
    pub cache_hits: usize,
    pub timed_out: usize,
    pub no_capacity: usize,
    pub failed: usize,
    pub total_latency: Duration,
}

impl RunSummary {
    fn record(&mut self, result: Result<helix_pool::InferenceResponse, PoolError>) {
        match result {
            Ok(response) => {
                self.completed += 1;
                self.total_latency += response.latency;
                if response.cache_hit {
                    self.cache_hits += 1;
                }
            }
            Err(PoolError::Timeout { .. }) => self.timed_out += 1,
            Err(PoolError::InsufficientCapacity { .. }) => self.no_capacity += 1,
            Err(_) => self.failed += 1,
        }
    }

    #[must_use]
    pub fn mean_latency(&self) -> Duration {
        u32::try_from(self.completed)
            .ok()
            .filter(|n| *n > 0)
            .map_or(Duration::ZERO, |n| self.total_latency / n)
    }
}

/// Submits `jobs` requests cycling through `models` and waits for all of them
pub async fn drive(pool: &InferencePool, jobs: usize, models: &[String]) -> Result<RunSummary> {
    if models.is_empty() {
        bail!("at least one model is required");
    }

    let mut summary = RunSummary::default();
    let mut waiting = Vec::with_capacity(jobs);
    for i in 0..jobs {
        let request = InferenceRequest::new(models[i % models.len()].clone(), PROMPTS[i % PROMPTS.len()]);
        match pool.submit(request) {
            Ok(handle) => {
                summary.submitted += 1;
                waiting.push(tokio::spawn(handle.wait()));
            }
            Err(PoolError::QueueFull { capacity }) => {
                summary.rejected += 1;
                warn!(capacity, "Queue full, job rejected");
            }
            Err(e) => return Err(e.into()),
        }
    }

    for task in waiting {
        summary.record(task.await?);
    }
    Ok(summary)
}

/// Execute the run command
pub async fn execute(
    config: HelixConfig,
    jobs: usize,
    models: &[String],
    fast: bool,
    metrics: bool,
) -> Result<()> {
    let runtime = if fast {
        Arc::new(SimulatedRuntime::instant())
    } else {
        Arc::new(SimulatedRuntime::default())
    };
    let registry = Arc::new(MetricRegistry::new());
    let pool = InferencePool::new(config.pool, runtime, registry.clone())?;
    pool.start()?;

    info!(jobs, models = models.len(), "Submitting jobs");
    let started = Instant::now();
    let summary = drive(&pool, jobs, models).await;
    let elapsed = started.elapsed();
    let status = pool.system_status();
    pool.shutdown().await;
    let summary = summary?;

    println!("helix-pool - Run Summary");
    println!("{}", "=".repeat(60));
    println!("  Submitted:       {}", summary.submitted);
    println!("  Rejected:        {}", summary.rejected);
    println!("  Completed:       {}", summary.completed);
    println!("  Cache hits:      {}", summary.cache_hits);
    println!("  Timed out:       {}", summary.timed_out);
    println!("  No capacity:     {}", summary.no_capacity);
    println!("  Failed:          {}", summary.failed);
    println!("  Mean latency:    {:.1} ms", summary.mean_latency().as_secs_f64() * 1000.0);
    println!("  Wall time:       {:.2} s", elapsed.as_secs_f64());
    println!();

    println!("Devices");
    println!("{}", "-".repeat(60));
    for device in &status.devices {
        let models: Vec<_> = device.allocations.iter().map(|a| a.model_id.as_str()).collect();
        println!(
            "  {:<10} {:>10} / {:<10} {:>5.1}%  {}",
            device.id,
            gib(device.used_memory),
            gib(device.total_memory),
            device.utilization,
            models.join(", ")
        );
    }
    println!("  Cache hit ratio: {:.2}", status.cache.hit_ratio());

    if metrics {
        println!();
        print!("{}", registry.export_prometheus());
    }
    Ok(())
}
