//! Queue consumer: one job per tick, turned into a watermark-bounded feed
//! fetch whose results are persisted before the job is acked.

use std::sync::Arc;
use std::time::Duration;

use appreview_core::{AppId, Clock};
use tracing::{debug, error, info, warn};

use super::WorkerHandle;
use crate::feed::{FeedSource, FetchEngine, FetchError};
use crate::queue::{Job, JobId, JobQueue, NackOutcome, QueueError};
use crate::reviews::{ReviewStore, Watermarks};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Lease length per job. Must cover a full multi-page fetch.
    pub visibility_timeout: Duration,
    /// Lookback for applications with no persisted review.
    pub reviews_time_limit: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(120),
            reviews_time_limit: Duration::from_secs(48 * 3600),
        }
    }
}

/// Result of one consumer tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing was leasable.
    Idle,
    /// Fetch and persistence succeeded and the job was acked.
    Ingested {
        job_id: JobId,
        app_id: AppId,
        fetched: usize,
        inserted: usize,
    },
    /// The job was nacked for a later retry (or dead-lettered).
    Retried { job_id: JobId, reason: String },
    /// The payload was unusable and the job was acked without work.
    Discarded { job_id: JobId, reason: String },
}

pub struct Consumer<Q, F, S> {
    queue: Q,
    engine: FetchEngine<F>,
    store: S,
    watermarks: Watermarks<S>,
    options: ConsumerOptions,
}

impl<Q, F, S> Consumer<Q, F, S>
where
    Q: JobQueue + 'static,
    F: FeedSource + 'static,
    S: ReviewStore + Clone + 'static,
{
    pub fn new(
        queue: Q,
        engine: FetchEngine<F>,
        store: S,
        options: ConsumerOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            watermarks: Watermarks::new(store.clone(), options.reviews_time_limit, clock),
            queue,
            engine,
            store,
            options,
        }
    }

    pub async fn tick(&self) -> TickOutcome {
        let job = match self.queue.lease(self.options.visibility_timeout).await {
            Ok(job) => job,
            Err(QueueError::EmptyQueue) => {
                debug!("queue is empty, waiting for next tick");
                return TickOutcome::Idle;
            }
            Err(e) => {
                error!(error = %e, "failed to lease job");
                return TickOutcome::Idle;
            }
        };

        let app_id = match AppId::from_payload(&job.payload) {
            Ok(app_id) => app_id,
            Err(e) => {
                error!(job_id = %job.id, payload = %job.payload_lossy(), error = %e, "discarding job with invalid payload");
                self.ack(&job).await;
                return TickOutcome::Discarded {
                    job_id: job.id,
                    reason: e.to_string(),
                };
            }
        };

        let watermark = match self.watermarks.resolve(&app_id).await {
            Ok(watermark) => watermark,
            Err(e) => {
                error!(job_id = %job.id, app_id = %app_id, error = %e, "failed to resolve watermark");
                return self.retry(&job, e.to_string()).await;
            }
        };
        if watermark.is_default() {
            info!(app_id = %app_id, cutoff = %watermark.cutoff(), "no persisted review, using lookback window");
        }

        let entries = match self.engine.fetch_new_reviews(&app_id, watermark.cutoff()).await {
            Ok(entries) => entries,
            Err(FetchError::NoReviews) => {
                info!(job_id = %job.id, app_id = %app_id, "feed has no reviews");
                return self.retry(&job, FetchError::NoReviews.to_string()).await;
            }
            Err(e) => {
                warn!(job_id = %job.id, app_id = %app_id, error = %e, "failed to fetch reviews");
                return self.retry(&job, e.to_string()).await;
            }
        };

        // Oldest first: if this tick dies part-way, the watermark only ever
        // covers reviews that are already stored.
        let mut inserted = 0;
        for entry in entries.iter().rev() {
            let review = match entry.to_review(&app_id) {
                Ok(review) => review,
                Err(e) => {
                    warn!(app_id = %app_id, review_id = %entry.id.label, error = %e, "skipping malformed review");
                    continue;
                }
            };
            match self.store.upsert_review(&review).await {
                Ok(true) => inserted += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(job_id = %job.id, app_id = %app_id, error = %e, "failed to store review");
                    return self.retry(&job, e.to_string()).await;
                }
            }
        }

        self.ack(&job).await;
        info!(job_id = %job.id, app_id = %app_id, fetched = entries.len(), inserted, "reviews ingested");
        TickOutcome::Ingested {
            job_id: job.id,
            app_id,
            fetched: entries.len(),
            inserted,
        }
    }

    async fn ack(&self, job: &Job) {
        if let Err(e) = self.queue.ack(job).await {
            warn!(job_id = %job.id, error = %e, "failed to ack job");
        }
    }

    async fn retry(&self, job: &Job, reason: String) -> TickOutcome {
        match self.queue.nack(job).await {
            Ok(NackOutcome::Retry { retry_count, until }) => {
                debug!(job_id = %job.id, retry_count, until = %until, "job scheduled for retry");
            }
            Ok(NackOutcome::DeadLettered { retry_count }) => {
                warn!(job_id = %job.id, retry_count, "job dead-lettered");
            }
            Err(e) => warn!(job_id = %job.id, error = %e, "failed to nack job"),
        }
        TickOutcome::Retried {
            job_id: job.id,
            reason,
        }
    }

    pub fn spawn(self: Arc<Self>, period: Duration) -> WorkerHandle {
        WorkerHandle::spawn("consumer", period, move || {
            let consumer = self.clone();
            async move {
                consumer.tick().await;
            }
        })
    }
}
