//! Queue abstraction and the in-memory implementation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use appreview_core::{Clock, SystemClock};
use tracing::{debug, error, warn};

use super::types::{
    DeadLetter, FailureCallback, Job, JobId, JobState, NackOutcome, QueueError, QueueOptions,
    QueueStats,
};

/// Durable mailbox with lease-based at-least-once delivery.
///
/// A leased job stays invisible until it is acked, nacked, or its lease
/// elapses; after that any consumer may lease it again.
///
/// `ack` and `nack` take the [`Job`] returned by `lease`: its `ack_deadline`
/// identifies that particular lease, so a holder whose lease expired and was
/// handed to another consumer gets [`QueueError::LeaseExpired`] instead of
/// settling the new holder's job.
#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    /// Append a ready job.
    async fn enqueue(&self, payload: &[u8]) -> Result<JobId, QueueError>;

    /// Lease one ready job for `visibility_timeout`.
    ///
    /// Returns [`QueueError::EmptyQueue`] when nothing is leasable.
    async fn lease(&self, visibility_timeout: Duration) -> Result<Job, QueueError>;

    /// Remove a leased job for good.
    async fn ack(&self, job: &Job) -> Result<(), QueueError>;

    /// Give a leased job back for a later retry, or dead-letter it once
    /// retries are exhausted.
    async fn nack(&self, job: &Job) -> Result<NackOutcome, QueueError>;

    /// Release resources. Every later call fails with [`QueueError::Closed`].
    async fn close(&self) -> Result<(), QueueError>;

    /// Add a callback run for every dead-lettered job.
    fn register_failure_callback(&self, callback: FailureCallback);
}

#[async_trait::async_trait]
impl<Q: JobQueue + ?Sized> JobQueue for Arc<Q> {
    async fn enqueue(&self, payload: &[u8]) -> Result<JobId, QueueError> {
        (**self).enqueue(payload).await
    }

    async fn lease(&self, visibility_timeout: Duration) -> Result<Job, QueueError> {
        (**self).lease(visibility_timeout).await
    }

    async fn ack(&self, job: &Job) -> Result<(), QueueError> {
        (**self).ack(job).await
    }

    async fn nack(&self, job: &Job) -> Result<NackOutcome, QueueError> {
        (**self).nack(job).await
    }

    async fn close(&self) -> Result<(), QueueError> {
        (**self).close().await
    }

    fn register_failure_callback(&self, callback: FailureCallback) {
        (**self).register_failure_callback(callback)
    }
}

/// Callback that logs every dead-lettered payload at error level.
pub struct LogDeadLetters;

impl LogDeadLetters {
    pub fn callback() -> FailureCallback {
        Arc::new(|job: &Job| {
            error!(
                job_id = %job.id,
                payload = %job.payload_lossy(),
                retry_count = job.retry_count,
                "job dead-lettered after exhausting retries"
            );
            Ok(())
        })
    }
}

/// Run every callback once; all of them run even if one fails.
pub(crate) fn run_failure_callbacks(
    callbacks: &RwLock<Vec<FailureCallback>>,
    job: &Job,
) -> Result<(), QueueError> {
    let callbacks: Vec<FailureCallback> = callbacks
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();

    let mut first_error = None;
    for callback in &callbacks {
        if let Err(e) = callback(job) {
            warn!(job_id = %job.id, error = %e, "failure callback returned an error");
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(QueueError::FailureCallback(e)),
        None => Ok(()),
    }
}

#[derive(Debug, Default)]
struct State {
    jobs: BTreeMap<JobId, Job>,
    dead_letters: Vec<DeadLetter>,
    next_id: i64,
    closed: bool,
}

impl State {
    fn open(&mut self) -> Result<&mut Self, QueueError> {
        if self.closed {
            Err(QueueError::Closed)
        } else {
            Ok(self)
        }
    }

    /// The stored job, provided `lease` is still its current lease.
    fn leased_job(&mut self, lease: &Job, now: chrono::DateTime<chrono::Utc>) -> Result<&mut Job, QueueError> {
        let job = self.jobs.get_mut(&lease.id).ok_or(QueueError::NotFound(lease.id))?;
        if job.holds_lease(lease, now) {
            Ok(job)
        } else {
            Err(QueueError::LeaseExpired(lease.id))
        }
    }
}

/// In-memory queue for tests/dev. Same semantics as the SQLite queue,
/// nothing survives the process.
pub struct InMemoryJobQueue {
    state: Mutex<State>,
    callbacks: RwLock<Vec<FailureCallback>>,
    options: QueueOptions,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobQueue {
    pub fn new(options: QueueOptions) -> Self {
        Self::with_clock(options, Arc::new(SystemClock))
    }

    pub fn with_clock(options: QueueOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 1,
                ..State::default()
            }),
            callbacks: RwLock::new(Vec::new()),
            options,
            clock,
        }
    }

    pub fn arc(options: QueueOptions) -> Arc<Self> {
        Arc::new(Self::new(options))
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Live job by id, for inspection.
    pub fn get(&self, id: JobId) -> Option<Job> {
        self.state().jobs.get(&id).cloned()
    }

    /// Where `id` is in its lifecycle; `None` for ids never issued.
    ///
    /// Ids are never reused, so an issued id that is neither live nor
    /// dead-lettered was acked.
    pub fn job_state(&self, id: JobId) -> Option<JobState> {
        let now = self.clock.now();
        let state = self.state();
        if let Some(job) = state.jobs.get(&id) {
            return Some(job.state(now));
        }
        if state.dead_letters.iter().any(|dl| dl.job_id == id) {
            return Some(JobState::DeadLettered);
        }
        (id.0 >= 1 && id.0 < state.next_id).then_some(JobState::Acked)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state().dead_letters.clone()
    }

    pub fn stats(&self) -> QueueStats {
        let now = self.clock.now();
        let state = self.state();
        let mut stats = QueueStats {
            dead_lettered: state.dead_letters.len() as u64,
            ..QueueStats::default()
        };
        for job in state.jobs.values() {
            match job.state(now) {
                JobState::Ready => stats.ready += 1,
                _ => stats.leased += 1,
            }
        }
        stats
    }
}

#[async_trait::async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, payload: &[u8]) -> Result<JobId, QueueError> {
        let mut guard = self.state();
        let state = guard.open()?;
        let id = JobId(state.next_id);
        state.next_id += 1;
        state.jobs.insert(
            id,
            Job {
                id,
                payload: payload.to_vec(),
                ack_deadline: None,
                retry_count: 0,
            },
        );
        debug!(job_id = %id, "job enqueued");
        Ok(id)
    }

    async fn lease(&self, visibility_timeout: Duration) -> Result<Job, QueueError> {
        let now = self.clock.now();
        let mut guard = self.state();
        let state = guard.open()?;
        let job = state
            .jobs
            .values_mut()
            .find(|job| job.is_leasable(now))
            .ok_or(QueueError::EmptyQueue)?;
        job.ack_deadline = Some(QueueOptions::lease_deadline(visibility_timeout, now));
        Ok(job.clone())
    }

    async fn ack(&self, lease: &Job) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut guard = self.state();
        let state = guard.open()?;
        state.leased_job(lease, now)?;
        state.jobs.remove(&lease.id);
        Ok(())
    }

    async fn nack(&self, lease: &Job) -> Result<NackOutcome, QueueError> {
        let now = self.clock.now();
        let id = lease.id;
        let dead = {
            let mut guard = self.state();
            let state = guard.open()?;
            let job = state.leased_job(lease, now)?;
            let outcome = self.options.nack_outcome(job.retry_count, now);
            match outcome {
                NackOutcome::Retry { retry_count, until } => {
                    job.retry_count = retry_count;
                    job.ack_deadline = Some(until);
                    return Ok(outcome);
                }
                NackOutcome::DeadLettered { retry_count } => {
                    job.retry_count = retry_count;
                    let job = state.jobs.remove(&id).ok_or(QueueError::NotFound(id))?;
                    state.dead_letters.push(DeadLetter {
                        job_id: id,
                        payload: job.payload.clone(),
                        retry_count,
                        dead_lettered_at: now,
                    });
                    job
                }
            }
        };

        run_failure_callbacks(&self.callbacks, &dead)?;
        Ok(NackOutcome::DeadLettered {
            retry_count: dead.retry_count,
        })
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.state().closed = true;
        Ok(())
    }

    fn register_failure_callback(&self, callback: FailureCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }
}
