//! Bounded job queue
//!
//! Submission never blocks: a full queue rejects the job immediately. Each job
//! carries a one-shot result channel and an absolute deadline. The
//! [`JobTracker`] follows live jobs through
//! `Queued -> Dispatched -> Completed | Failed | TimedOut | Cancelled`;
//! whichever side reaches a terminal state first records it and the entry is
//! dropped from the tracker.

use crate::metrics::{self, MetricsSink};
use crate::types::{InferenceRequest, InferenceResponse, JobId};
use crate::{PoolError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Dispatched,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::Dispatched)
    }
}

/// Queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub capacity: usize,
    /// Jobs waiting in the channel
    pub depth: usize,
    pub queued: usize,
    pub dispatched: usize,
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
}

/// Live job states plus terminal counters
#[derive(Debug, Default)]
pub struct JobTracker {
    live: DashMap<JobId, JobState>,
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
}

impl JobTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn enqueue(&self, id: JobId) {
        self.live.insert(id, JobState::Queued);
    }

    fn withdraw(&self, id: JobId) {
        self.live.remove(&id);
    }

    /// Moves a queued job to `Dispatched`; false if it already finished
    pub(crate) fn dispatch(&self, id: JobId) -> bool {
        match self.live.get_mut(&id) {
            Some(mut state) if *state == JobState::Queued => {
                *state = JobState::Dispatched;
                true
            }
            _ => false,
        }
    }

    /// Records a terminal state once; later calls for the same job are ignored
    pub(crate) fn finish(&self, id: JobId, state: JobState) -> bool {
        debug_assert!(state.is_terminal());
        if self.live.remove(&id).is_none() {
            return false;
        }
        let counter = match state {
            JobState::Completed => &self.completed,
            JobState::Failed => &self.failed,
            JobState::TimedOut => &self.timed_out,
            JobState::Cancelled => &self.cancelled,
            JobState::Queued | JobState::Dispatched => return true,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Current state of a live job
    #[must_use]
    pub fn state(&self, id: JobId) -> Option<JobState> {
        self.live.get(&id).map(|s| *s)
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.live.len()
    }

    #[must_use]
    pub fn stats(&self, capacity: usize, depth: usize) -> QueueStats {
        let (mut queued, mut dispatched) = (0, 0);
        for state in self.live.iter() {
            match *state.value() {
                JobState::Queued => queued += 1,
                JobState::Dispatched => dispatched += 1,
                _ => {}
            }
        }
        QueueStats {
            capacity,
            depth,
            queued,
            dispatched,
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// A queued unit of work
#[derive(Debug)]
pub(crate) struct Job {
    pub(crate) id: JobId,
    pub(crate) request: InferenceRequest,
    pub(crate) enqueued_at: Instant,
    pub(crate) deadline: Instant,
    pub(crate) result_tx: oneshot::Sender<Result<InferenceResponse>>,
}

/// Caller side of a submitted job
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    enqueued_at: Instant,
    deadline: Instant,
    rx: oneshot::Receiver<Result<InferenceResponse>>,
    tracker: Arc<JobTracker>,
}

impl JobHandle {
    #[must_use]
    pub const fn id(&self) -> JobId {
        self.id
    }

    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Waits for the result until the job deadline
    ///
    /// On expiry the receiver is dropped, which the worker observes as a
    /// cancellation.
    pub async fn wait(self) -> Result<InferenceResponse> {
        let Self { id, enqueued_at, deadline, rx, tracker } = self;
        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                // dropped unprocessed at shutdown
                tracker.finish(id, JobState::Cancelled);
                Err(PoolError::ShuttingDown)
            }
            Err(_) => {
                tracker.finish(id, JobState::TimedOut);
                let waited = enqueued_at.elapsed();
                warn!(job = %id, waited_ms = waited.as_millis() as u64, "Job timed out");
                Err(PoolError::Timeout { job: id, waited })
            }
        }
    }

    /// Abandons the job
    pub fn cancel(self) {
        self.tracker.finish(self.id, JobState::Cancelled);
    }
}

/// Sending side of the bounded queue
pub(crate) struct JobQueue {
    tx: mpsc::Sender<Job>,
    capacity: usize,
    default_timeout: Duration,
    tracker: Arc<JobTracker>,
    metrics: Arc<dyn MetricsSink>,
}

impl JobQueue {
    pub(crate) fn new(
        capacity: usize,
        default_timeout: Duration,
        tracker: Arc<JobTracker>,
        metrics: Arc<dyn MetricsSink>,
    ) -> (Self, mpsc::Receiver<Job>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, capacity, default_timeout, tracker, metrics }, rx)
    }

    pub(crate) fn submit(&self, request: InferenceRequest) -> Result<JobHandle> {
        let id = JobId::new();
        let enqueued_at = Instant::now();
        let deadline = enqueued_at + request.deadline.unwrap_or(self.default_timeout);
        let (result_tx, rx) = oneshot::channel();
        let model = request.model_id.clone();
        let priority = request.priority;
        let job = Job { id, request, enqueued_at, deadline, result_tx };

        self.tracker.enqueue(id);
        match self.tx.try_send(job) {
            Ok(()) => {
                self.tracker.submitted.fetch_add(1, Ordering::Relaxed);
                self.metrics.set_gauge(metrics::QUEUE_DEPTH, self.depth() as f64);
                debug!(job = %id, model = %model, ?priority, "Job queued");
                Ok(JobHandle { id, enqueued_at, deadline, rx, tracker: Arc::clone(&self.tracker) })
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.tracker.withdraw(id);
                self.tracker.rejected.fetch_add(1, Ordering::Relaxed);
                self.metrics.incr_counter(metrics::QUEUE_REJECTED_TOTAL, 1);
                warn!(model = %model, capacity = self.capacity, "Job queue full, rejecting");
                Err(PoolError::QueueFull { capacity: self.capacity })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.tracker.withdraw(id);
                Err(PoolError::ShuttingDown)
            }
        }
    }

    /// Jobs waiting in the channel
    pub(crate) fn depth(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    pub(crate) const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;

    fn queue(capacity: usize) -> (JobQueue, mpsc::Receiver<Job>, Arc<JobTracker>) {
        let tracker = Arc::new(JobTracker::new());
        let (queue, rx) = JobQueue::new(capacity, Duration::from_secs(30), tracker.clone(), Arc::new(NoopMetrics));
        (queue, rx, tracker)
    }

    #[tokio::test]
    async fn test_full_queue_rejects_immediately() {
        let (queue, _rx, tracker) = queue(2);
        queue.submit(InferenceRequest::new("m", "a")).unwrap();
        queue.submit(InferenceRequest::new("m", "b")).unwrap();
        let err = queue.submit(InferenceRequest::new("m", "c")).unwrap_err();
        assert_eq!(err, PoolError::QueueFull { capacity: 2 });

        let stats = tracker.stats(queue.capacity(), queue.depth());
        assert_eq!(stats.depth, 2);
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.rejected, 1);
    }

    #[tokio::test]
    async fn test_closed_queue_reports_shutdown() {
        let (queue, rx, tracker) = queue(2);
        drop(rx);
        assert_eq!(queue.submit(InferenceRequest::new("m", "a")).unwrap_err(), PoolError::ShuttingDown);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_and_closes_channel() {
        let (queue, mut rx, tracker) = queue(4);
        let handle = queue.submit(InferenceRequest::new("m", "a").with_deadline(Duration::from_millis(50))).unwrap();
        let id = handle.id();
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, PoolError::Timeout { job, .. } if job == id));

        let job = rx.recv().await.unwrap();
        assert!(job.result_tx.is_closed());
        assert!(!tracker.dispatch(job.id));
        assert_eq!(tracker.stats(4, 0).timed_out, 1);
    }

    #[tokio::test]
    async fn test_result_delivered() {
        let (queue, mut rx, tracker) = queue(4);
        let handle = queue.submit(InferenceRequest::new("m", "a")).unwrap();
        let job = rx.recv().await.unwrap();
        assert!(tracker.dispatch(job.id));
        assert_eq!(tracker.state(job.id), Some(JobState::Dispatched));
        job.result_tx.send(Err(PoolError::ShuttingDown)).unwrap();
        assert_eq!(handle.wait().await.unwrap_err(), PoolError::ShuttingDown);
    }

    #[tokio::test]
    async fn test_dropped_sender_reports_shutdown() {
        let (queue, rx, _) = queue(4);
        let handle = queue.submit(InferenceRequest::new("m", "a")).unwrap();
        drop(rx);
        assert_eq!(handle.wait().await.unwrap_err(), PoolError::ShuttingDown);
    }

    #[test]
    fn test_finish_counts_once() {
        let tracker = JobTracker::new();
        let id = JobId::new();
        tracker.enqueue(id);
        assert!(tracker.finish(id, JobState::Completed));
        assert!(!tracker.finish(id, JobState::Cancelled));
        let stats = tracker.stats(1, 0);
        assert_eq!((stats.completed, stats.cancelled), (1, 0));
        assert_eq!(tracker.state(id), None);
    }
}
