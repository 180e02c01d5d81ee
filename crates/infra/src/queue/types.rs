//! Core queue types, options and the per-job state machine.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Queue-assigned job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of work: an opaque payload plus lease bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub payload: Vec<u8>,
    /// `None` until the first lease.
    pub ack_deadline: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

/// Lifecycle of a job.
///
/// `Ready → Leased → { Acked | Ready (deadline expiry) | DeadLettered }`.
/// `Acked` and `DeadLettered` are terminal; the job is no longer stored, so
/// [`Job::state`] only yields the live states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Ready,
    Leased { until: DateTime<Utc> },
    Acked,
    DeadLettered,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Acked | JobState::DeadLettered)
    }
}

/// A deadline counts as elapsed once `now` reaches it.
pub fn deadline_elapsed(deadline: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    deadline <= now
}

impl Job {
    /// State of a live (not yet acked or dead-lettered) job at `now`.
    pub fn state(&self, now: DateTime<Utc>) -> JobState {
        match self.ack_deadline {
            Some(until) if !deadline_elapsed(until, now) => JobState::Leased { until },
            _ => JobState::Ready,
        }
    }

    pub fn is_leasable(&self, now: DateTime<Utc>) -> bool {
        self.state(now) == JobState::Ready
    }

    /// Whether `lease`, a copy handed out by a lease call, is still the
    /// current unexpired lease on this stored job.
    ///
    /// A lease is identified by its deadline plus the retry count it was
    /// issued at: a re-lease always moves the deadline forward and a nack
    /// always bumps the count, even when the backoff lands on the old deadline.
    pub fn holds_lease(&self, lease: &Job, now: DateTime<Utc>) -> bool {
        match self.state(now) {
            JobState::Leased { until } => {
                lease.id == self.id
                    && lease.ack_deadline == Some(until)
                    && lease.retry_count == self.retry_count
            }
            _ => false,
        }
    }

    /// Payload decoded as UTF-8, for logs.
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Bound on nack-driven redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryLimit {
    Limited(u32),
    Infinite,
}

impl RetryLimit {
    /// Whether a job that has now been nacked `retry_count` times is done.
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        match self {
            RetryLimit::Limited(max) => retry_count >= *max,
            RetryLimit::Infinite => false,
        }
    }
}

/// What a successful nack does to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Rescheduled; leasable again once `until` elapses.
    Retry { retry_count: u32, until: DateTime<Utc> },
    /// Retries exhausted; the job was removed and handed to failure callbacks.
    DeadLettered { retry_count: u32 },
}

/// Queue behaviour knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    /// Default lease length; also the floor for the nack backoff.
    pub visibility_timeout: Duration,
    /// Delay before a nacked job becomes leasable again.
    pub retry_backoff: Duration,
    pub max_retries: RetryLimit,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(120),
            retry_backoff: Duration::from_secs(30),
            max_retries: RetryLimit::Limited(5),
        }
    }
}

impl QueueOptions {
    pub fn lease_deadline(visibility_timeout: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(visibility_timeout)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Deadline after a nack: `now + max(retry_backoff, visibility_timeout)`.
    pub fn retry_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        Self::lease_deadline(self.retry_backoff.max(self.visibility_timeout), now)
    }

    /// Transition for a nack of a job that had been nacked `previous_retries` times.
    pub fn nack_outcome(&self, previous_retries: u32, now: DateTime<Utc>) -> NackOutcome {
        let retry_count = previous_retries.saturating_add(1);
        if self.max_retries.is_exhausted(retry_count) {
            NackOutcome::DeadLettered { retry_count }
        } else {
            NackOutcome::Retry {
                retry_count,
                until: self.retry_deadline(now),
            }
        }
    }
}

/// Record of a job removed after exhausting its retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub job_id: JobId,
    pub payload: Vec<u8>,
    pub retry_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub ready: u64,
    /// Leased, or backing off after a nack.
    pub leased: u64,
    pub dead_lettered: u64,
}

/// Dead-letter callback, invoked once per exhausted job after it is removed.
pub type FailureCallback = Arc<dyn Fn(&Job) -> Result<(), String> + Send + Sync>;

/// Queue operation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// No job is currently leasable. Expected steady state, not a failure.
    #[error("queue is empty")]
    EmptyQueue,
    #[error("lease on job {0} has expired")]
    LeaseExpired(JobId),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("queue is closed")]
    Closed,
    #[error("failure callback failed: {0}")]
    FailureCallback(String),
    #[error("storage error: {0}")]
    Storage(String),
}
