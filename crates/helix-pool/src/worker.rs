//! Worker tasks draining the job queue

use crate::cache::ModelCache;
use crate::config::PoolConfig;
use crate::metrics::{self, MetricsSink};
use crate::queue::{Job, JobState, JobTracker};
use crate::runtime::ModelRuntime;
use crate::strategy::Placement;
use crate::types::{InferenceRequest, InferenceResponse, JobId, estimate_tokens};
use crate::{PoolError, Result};
use chrono::Utc;
use helix_telemetry::LogContext;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, warn};

/// Shared state every worker needs
pub(crate) struct WorkerContext {
    pub(crate) config: Arc<PoolConfig>,
    pub(crate) cache: Arc<ModelCache>,
    pub(crate) placement: Arc<Placement>,
    pub(crate) runtime: Arc<dyn ModelRuntime>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) tracker: Arc<JobTracker>,
}

enum Outcome {
    Finished(Result<InferenceResponse>),
    Cancelled,
    TimedOut,
}

pub(crate) fn spawn_workers(
    ctx: Arc<WorkerContext>,
    rx: mpsc::Receiver<Job>,
    count: usize,
    shutdown: &broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..count)
        .map(|index| {
            let ctx = Arc::clone(&ctx);
            let rx = Arc::clone(&rx);
            let shutdown = shutdown.subscribe();
            tokio::spawn(run_worker(index, ctx, rx, shutdown))
        })
        .collect()
}

async fn run_worker(
    index: usize,
    ctx: Arc<WorkerContext>,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    debug!(worker = index, "Worker started");
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            next = async {
                let mut rx = rx.lock().await;
                let job = rx.recv().await;
                (job, rx.len())
            } => next,
        };
        let (Some(job), depth) = next else { break };
        ctx.metrics.set_gauge(metrics::QUEUE_DEPTH, depth as f64);

        let span = LogContext::new("worker")
            .with_job_id(job.id.to_string())
            .with_model_id(job.request.model_id.clone())
            .span();
        span.in_scope(|| debug!(worker = index, priority = ?job.request.priority, "Job dispatched"));
        process(&ctx, job).instrument(span).await;
    }
    debug!(worker = index, "Worker stopped");
}

async fn process(ctx: &WorkerContext, job: Job) {
    let Job { id, request, enqueued_at, deadline, mut result_tx } = job;

    if Instant::now() >= deadline {
        if ctx.tracker.finish(id, JobState::TimedOut) {
            ctx.metrics.incr_counter(metrics::JOBS_TIMED_OUT_TOTAL, 1);
        }
        let _ = result_tx.send(Err(PoolError::Timeout { job: id, waited: enqueued_at.elapsed() }));
        debug!("Dropped job whose deadline passed in the queue");
        return;
    }
    if result_tx.is_closed() || !ctx.tracker.dispatch(id) {
        if ctx.tracker.finish(id, JobState::Cancelled) {
            ctx.metrics.incr_counter(metrics::JOBS_CANCELLED_TOTAL, 1);
        }
        debug!("Dropped job abandoned by its caller");
        return;
    }

    let outcome = tokio::select! {
        biased;
        () = result_tx.closed() => Outcome::Cancelled,
        () = tokio::time::sleep_until(deadline) => Outcome::TimedOut,
        result = execute(ctx, id, &request, enqueued_at) => Outcome::Finished(result),
    };

    match outcome {
        Outcome::Finished(Ok(response)) => {
            ctx.metrics.observe(metrics::JOB_LATENCY_MS, response.latency.as_secs_f64() * 1000.0);
            if ctx.tracker.finish(id, JobState::Completed) {
                ctx.metrics.incr_counter(metrics::JOBS_COMPLETED_TOTAL, 1);
            }
            debug!(device = %response.device_id, cache_hit = response.cache_hit, "Job completed");
            let _ = result_tx.send(Ok(response));
        }
        Outcome::Finished(Err(e)) => {
            if ctx.tracker.finish(id, JobState::Failed) {
                ctx.metrics.incr_counter(metrics::JOBS_FAILED_TOTAL, 1);
            }
            warn!(error = %e, "Job failed");
            let _ = result_tx.send(Err(e));
        }
        Outcome::Cancelled => {
            if ctx.tracker.finish(id, JobState::Cancelled) {
                ctx.metrics.incr_counter(metrics::JOBS_CANCELLED_TOTAL, 1);
            }
            info!("Job abandoned by caller, work cancelled");
        }
        Outcome::TimedOut => {
            if ctx.tracker.finish(id, JobState::TimedOut) {
                ctx.metrics.incr_counter(metrics::JOBS_TIMED_OUT_TOTAL, 1);
            }
            let waited = enqueued_at.elapsed();
            warn!(waited_ms = waited.as_millis() as u64, "Job deadline reached, work cancelled");
            let _ = result_tx.send(Err(PoolError::Timeout { job: id, waited }));
        }
    }
}

/// Resolves the model, loads it on a miss and runs generation
///
/// The lease is dropped on every exit path, including when this future is
/// cancelled mid-await.
async fn execute(
    ctx: &WorkerContext,
    id: JobId,
    request: &InferenceRequest,
    enqueued_at: Instant,
) -> Result<InferenceResponse> {
    let model = request.model_id.as_str();
    let size = ctx.config.footprint(model);
    let mut lease = match ctx.cache.acquire(model, size, &ctx.placement) {
        Ok(lease) => lease,
        Err(e) => {
            ctx.metrics.incr_counter(metrics::ALLOCATION_FAILURES_TOTAL, 1);
            return Err(e);
        }
    };

    if lease.is_hit() {
        ctx.metrics.incr_counter(metrics::CACHE_HITS_TOTAL, 1);
    } else {
        ctx.metrics.incr_counter(metrics::CACHE_MISSES_TOTAL, 1);
        ctx.metrics.incr_counter(metrics::ALLOCATIONS_TOTAL, 1);
    }
    ctx.metrics.set_gauge(metrics::CACHE_HIT_RATIO, ctx.cache.stats().hit_ratio());

    if lease.is_pending() {
        debug!(device = %lease.device(), "Waiting for model load in progress");
        lease.wait_ready().await?;
    }
    if lease.needs_load() {
        let started = Instant::now();
        if let Err(e) = ctx.runtime.load(model, lease.device()).await {
            lease.fail_load(&e);
            return Err(e);
        }
        lease.mark_ready()?;
        info!(device = %lease.device(), load_ms = started.elapsed().as_millis() as u64, "Model loaded");
    }

    let registry = ctx.cache.registry();
    let generation = ctx.runtime.generate(model, &request.input, request.max_tokens).await;
    if let Err(e) = registry.record_inference(lease.device(), model, generation.is_ok()) {
        warn!(error = %e, "Could not record inference against allocation");
    }
    let generation = generation?;

    let prompt_tokens = estimate_tokens(&request.input);
    Ok(InferenceResponse {
        job_id: id,
        model_id: model.to_string(),
        device_id: lease.device().to_string(),
        output: generation.output,
        prompt_tokens,
        completion_tokens: generation.tokens_used,
        total_tokens: prompt_tokens.saturating_add(generation.tokens_used),
        finish_reason: generation.finish_reason,
        latency: enqueued_at.elapsed(),
        cache_hit: lease.is_hit(),
        created_at: Utc::now(),
    })
}
