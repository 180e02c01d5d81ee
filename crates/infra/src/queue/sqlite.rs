//! SQLite-backed durable job queue.
//!
//! ## Statements
//!
//! Every state change is a single write-first statement, so SQLite's writer
//! lock is what serialises competing consumers:
//!
//! | operation | statement |
//! |-----------|-----------|
//! | lease | `UPDATE jobs SET ack_deadline … WHERE id = (SELECT … LIMIT 1) RETURNING …` |
//! | ack | `DELETE … WHERE id = ? AND ack_deadline = ? AND retry_count = ? AND ack_deadline > now` |
//! | nack (exhausted) | `DELETE … RETURNING` + `INSERT INTO dead_letter_jobs`, one transaction |
//! | nack (retry) | `UPDATE … SET retry_count = retry_count + 1 … RETURNING retry_count` |
//!
//! The `ack_deadline` written by a lease, together with the row's
//! `retry_count`, is that lease's token: ack and nack only match the row while
//! it still carries the caller's deadline and count, so a consumer whose lease expired and was re-leased cannot settle the new
//! holder's job. When an ack/nack statement matches nothing, a follow-up
//! existence check tells `LeaseExpired` from `NotFound`.
//!
//! Timestamps are unix milliseconds; a NULL `ack_deadline` means never leased.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use appreview_core::{Clock, SystemClock};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{Span, debug, info, instrument};

use super::store::{JobQueue, run_failure_callbacks};
use super::types::{
    DeadLetter, FailureCallback, Job, JobId, NackOutcome, QueueError, QueueOptions, QueueStats,
    RetryLimit,
};
use crate::db::{from_millis, to_millis};

/// Durable queue over the `jobs` and `dead_letter_jobs` tables.
pub struct SqliteJobQueue {
    pool: SqlitePool,
    options: QueueOptions,
    clock: Arc<dyn Clock>,
    callbacks: RwLock<Vec<FailureCallback>>,
    closed: AtomicBool,
}

impl SqliteJobQueue {
    /// Wrap a pool whose schema has already been migrated.
    pub fn new(pool: SqlitePool, options: QueueOptions) -> Self {
        Self::with_clock(pool, options, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: SqlitePool, options: QueueOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            options,
            clock,
            callbacks: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    /// Classify an ack/nack that matched no leased row.
    async fn missing_lease(&self, id: JobId) -> QueueError {
        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs WHERE id = ?1")
            .bind(id.0)
            .fetch_one(&self.pool)
            .await;
        match exists {
            Ok(0) => QueueError::NotFound(id),
            Ok(_) => QueueError::LeaseExpired(id),
            Err(e) => map_sqlx_error("check_job_exists", e),
        }
    }

    /// Dead-lettered jobs, oldest first.
    pub async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        self.ensure_open()?;
        let rows = sqlx::query(
            r#"
            SELECT job_id, payload, retry_count, dead_lettered_at
            FROM dead_letter_jobs
            ORDER BY dead_lettered_at ASC, job_id ASC
            LIMIT ?1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter()
            .map(|row| {
                Ok(DeadLetter {
                    job_id: JobId(row.try_get("job_id").map_err(|e| map_sqlx_error("decode_dead_letter", e))?),
                    payload: row.try_get("payload").map_err(|e| map_sqlx_error("decode_dead_letter", e))?,
                    retry_count: retry_count_from(
                        row.try_get("retry_count").map_err(|e| map_sqlx_error("decode_dead_letter", e))?,
                    ),
                    dead_lettered_at: from_millis(
                        row.try_get("dead_lettered_at")
                            .map_err(|e| map_sqlx_error("decode_dead_letter", e))?,
                    ),
                })
            })
            .collect()
    }

    /// Move a dead-lettered job back into the queue as a fresh job.
    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn requeue_dead_letter(&self, id: JobId) -> Result<JobId, QueueError> {
        self.ensure_open()?;
        let now = to_millis(self.clock.now());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let payload: Option<Vec<u8>> =
            sqlx::query_scalar("DELETE FROM dead_letter_jobs WHERE job_id = ?1 RETURNING payload")
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_dead_letter", e))?;

        let Some(payload) = payload else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(QueueError::NotFound(id));
        };

        let new_id = sqlx::query(
            "INSERT INTO jobs (payload, ack_deadline, retry_count, created_at) VALUES (?1, NULL, 0, ?2)",
        )
        .bind(&payload)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?
        .last_insert_rowid();

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        info!(new_job_id = new_id, "dead-lettered job requeued");
        Ok(JobId(new_id))
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.ensure_open()?;
        let now = to_millis(self.clock.now());

        let ready: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE ack_deadline IS NULL OR ack_deadline <= ?1",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_ready", e))?;

        let leased: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE ack_deadline > ?1")
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_leased", e))?;

        let dead_lettered: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letter_jobs")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_dead_letters", e))?;

        Ok(QueueStats {
            ready: ready.max(0) as u64,
            leased: leased.max(0) as u64,
            dead_lettered: dead_lettered.max(0) as u64,
        })
    }

    /// Limited retries only: remove the job if this nack exhausts it.
    async fn try_dead_letter(
        &self,
        lease: &Job,
        deadline: i64,
        max: u32,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<Job>, QueueError> {
        let id = lease.id;
        let now_ms = to_millis(now);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE id = ?1 AND ack_deadline = ?2 AND retry_count = ?3
              AND ack_deadline > ?4 AND retry_count + 1 >= ?5
            RETURNING payload, retry_count
            "#,
        )
        .bind(id.0)
        .bind(deadline)
        .bind(i64::from(lease.retry_count))
        .bind(now_ms)
        .bind(i64::from(max))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("delete_exhausted_job", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(None);
        };

        let payload: Vec<u8> = row
            .try_get("payload")
            .map_err(|e| map_sqlx_error("decode_job", e))?;
        let retry_count = retry_count_from(
            row.try_get::<i64, _>("retry_count")
                .map_err(|e| map_sqlx_error("decode_job", e))?,
        )
        .saturating_add(1);

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO dead_letter_jobs (job_id, payload, retry_count, dead_lettered_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(id.0)
        .bind(&payload)
        .bind(i64::from(retry_count))
        .bind(now_ms)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_dead_letter", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(Some(Job {
            id,
            payload,
            ack_deadline: None,
            retry_count,
        }))
    }
}

#[async_trait::async_trait]
impl JobQueue for SqliteJobQueue {
    #[instrument(level = "debug", skip(self, payload), fields(payload_len = payload.len()), err)]
    async fn enqueue(&self, payload: &[u8]) -> Result<JobId, QueueError> {
        self.ensure_open()?;
        let now = to_millis(self.clock.now());

        let id = sqlx::query(
            "INSERT INTO jobs (payload, ack_deadline, retry_count, created_at) VALUES (?1, NULL, 0, ?2)",
        )
        .bind(payload)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?
        .last_insert_rowid();

        debug!(job_id = id, "job enqueued");
        Ok(JobId(id))
    }

    #[instrument(level = "debug", skip(self), fields(job_id))]
    async fn lease(&self, visibility_timeout: Duration) -> Result<Job, QueueError> {
        self.ensure_open()?;
        let now = self.clock.now();
        let deadline = QueueOptions::lease_deadline(visibility_timeout, now);

        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET ack_deadline = ?1
            WHERE id = (
                SELECT id FROM jobs
                WHERE ack_deadline IS NULL OR ack_deadline <= ?2
                ORDER BY id ASC
                LIMIT 1
            )
            RETURNING id, payload, ack_deadline, retry_count
            "#,
        )
        .bind(to_millis(deadline))
        .bind(to_millis(now))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("lease", e))?;

        let job = job_from_row(&row.ok_or(QueueError::EmptyQueue)?)?;
        Span::current().record("job_id", job.id.0);
        Ok(job)
    }

    #[instrument(level = "debug", skip(self, job), fields(job_id = %job.id))]
    async fn ack(&self, job: &Job) -> Result<(), QueueError> {
        self.ensure_open()?;
        let id = job.id;
        let Some(deadline) = job.ack_deadline.map(to_millis) else {
            return Err(self.missing_lease(id).await);
        };
        let now = to_millis(self.clock.now());

        let deleted = sqlx::query(
            "DELETE FROM jobs WHERE id = ?1 AND ack_deadline = ?2 AND retry_count = ?3 AND ack_deadline > ?4",
        )
        .bind(id.0)
        .bind(deadline)
        .bind(i64::from(job.retry_count))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("ack", e))?
        .rows_affected();

        if deleted == 0 {
            return Err(self.missing_lease(id).await);
        }
        Ok(())
    }

    #[instrument(level = "debug", skip(self, job), fields(job_id = %job.id))]
    async fn nack(&self, job: &Job) -> Result<NackOutcome, QueueError> {
        self.ensure_open()?;
        let id = job.id;
        let Some(deadline) = job.ack_deadline.map(to_millis) else {
            return Err(self.missing_lease(id).await);
        };
        let now = self.clock.now();

        if let RetryLimit::Limited(max) = self.options.max_retries {
            if let Some(job) = self.try_dead_letter(job, deadline, max, now).await? {
                let retry_count = job.retry_count;
                run_failure_callbacks(&self.callbacks, &job)?;
                return Ok(NackOutcome::DeadLettered { retry_count });
            }
        }

        let until = self.options.retry_deadline(now);
        let retry_count: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET retry_count = retry_count + 1, ack_deadline = ?1
            WHERE id = ?2 AND ack_deadline = ?3 AND retry_count = ?4 AND ack_deadline > ?5
            RETURNING retry_count
            "#,
        )
        .bind(to_millis(until))
        .bind(id.0)
        .bind(deadline)
        .bind(i64::from(job.retry_count))
        .bind(to_millis(now))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("nack", e))?;

        match retry_count {
            Some(retry_count) => Ok(NackOutcome::Retry {
                retry_count: retry_count_from(retry_count),
                until,
            }),
            None => Err(self.missing_lease(id).await),
        }
    }

    async fn close(&self) -> Result<(), QueueError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.pool.close().await;
            info!("job queue closed");
        }
        Ok(())
    }

    fn register_failure_callback(&self, callback: FailureCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }
}

fn retry_count_from(raw: i64) -> u32 {
    u32::try_from(raw.max(0)).unwrap_or(u32::MAX)
}

fn job_from_row(row: &SqliteRow) -> Result<Job, QueueError> {
    let decode = |e| map_sqlx_error("decode_job", e);
    Ok(Job {
        id: JobId(row.try_get("id").map_err(decode)?),
        payload: row.try_get("payload").map_err(decode)?,
        ack_deadline: row
            .try_get::<Option<i64>, _>("ack_deadline")
            .map_err(decode)?
            .map(from_millis),
        retry_count: retry_count_from(row.try_get("retry_count").map_err(decode)?),
    })
}

/// Map SQLx errors to QueueError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::PoolClosed => QueueError::Closed,
        sqlx::Error::Database(db_err) => {
            QueueError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        _ => QueueError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
