//! Durable job queue with lease-based at-least-once delivery.
//!
//! - A job is a payload (an application id) plus an `ack_deadline` and a
//!   `retry_count`.
//! - `lease` hides a job until its deadline; an unacked job reappears after it.
//! - `nack` delays redelivery by `max(retry_backoff, visibility_timeout)` and
//!   dead-letters the job once `max_retries` is reached.
//! - Dead-lettered jobs are handed to the registered failure callbacks and
//!   never re-admitted automatically.

pub mod sqlite;
pub mod store;
pub mod types;

pub use sqlite::SqliteJobQueue;
pub use store::{InMemoryJobQueue, JobQueue, LogDeadLetters};
pub use types::{
    DeadLetter, FailureCallback, Job, JobId, JobState, NackOutcome, QueueError, QueueOptions,
    QueueStats, RetryLimit,
};
