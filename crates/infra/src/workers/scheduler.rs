//! Periodic fan-out of one queue job per registered application.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::WorkerHandle;
use crate::apps::AppCatalog;
use crate::queue::JobQueue;

/// Result of one scheduler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    pub apps: usize,
    pub enqueued: usize,
    pub failed: usize,
}

/// Enqueues every application in the catalog on each tick.
///
/// No dedup against jobs already in flight: an application whose previous
/// job is still queued gets a second one, and the review store's idempotent
/// insert absorbs the overlap.
pub struct Scheduler<C, Q> {
    catalog: C,
    queue: Q,
}

impl<C, Q> Scheduler<C, Q>
where
    C: AppCatalog + 'static,
    Q: JobQueue + 'static,
{
    pub fn new(catalog: C, queue: Q) -> Self {
        Self { catalog, queue }
    }

    pub async fn tick(&self) -> ScheduleReport {
        let apps = match self.catalog.list_apps().await {
            Ok(apps) => apps,
            Err(e) => {
                error!(error = %e, "failed to list apps, skipping tick");
                return ScheduleReport::default();
            }
        };

        let mut report = ScheduleReport {
            apps: apps.len(),
            ..ScheduleReport::default()
        };
        for app in &apps {
            match self.queue.enqueue(app.id.as_bytes()).await {
                Ok(job_id) => {
                    debug!(app_id = %app.id, job_id = %job_id, "app scheduled");
                    report.enqueued += 1;
                }
                Err(e) => {
                    warn!(app_id = %app.id, error = %e, "failed to enqueue app");
                    report.failed += 1;
                }
            }
        }

        info!(apps = report.apps, enqueued = report.enqueued, failed = report.failed, "scheduler tick complete");
        report
    }

    pub fn spawn(self: Arc<Self>, period: Duration) -> WorkerHandle {
        WorkerHandle::spawn("scheduler", period, move || {
            let scheduler = self.clone();
            async move {
                scheduler.tick().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::{CatalogError, InMemoryAppCatalog, seed_catalog};
    use crate::queue::{InMemoryJobQueue, QueueError, QueueOptions};
    use appreview_core::{App, AppId};

    struct BrokenCatalog;

    #[async_trait::async_trait]
    impl AppCatalog for BrokenCatalog {
        async fn list_apps(&self) -> Result<Vec<App>, CatalogError> {
            Err(CatalogError::Storage("disk on fire".into()))
        }

        async fn add_app(&self, _app: App) -> Result<bool, CatalogError> {
            Err(CatalogError::Storage("disk on fire".into()))
        }
    }

    async fn catalog(ids: &[&str]) -> Arc<InMemoryAppCatalog> {
        let catalog = InMemoryAppCatalog::arc();
        let ids: Vec<AppId> = ids.iter().map(|s| AppId::new(*s).unwrap()).collect();
        seed_catalog(&*catalog, &ids).await.unwrap();
        catalog
    }

    #[tokio::test]
    async fn enqueues_one_job_per_app() {
        let queue = InMemoryJobQueue::arc(QueueOptions::default());
        let scheduler = Scheduler::new(catalog(&["111", "222"]).await, queue.clone());

        let report = scheduler.tick().await;
        assert_eq!(report, ScheduleReport { apps: 2, enqueued: 2, failed: 0 });

        let mut payloads = Vec::new();
        while let Ok(job) = queue.lease(Duration::from_secs(60)).await {
            payloads.push(job.payload);
        }
        payloads.sort();
        assert_eq!(payloads, vec![b"111".to_vec(), b"222".to_vec()]);
    }

    #[tokio::test]
    async fn repeated_ticks_do_not_dedup() {
        let queue = InMemoryJobQueue::arc(QueueOptions::default());
        let scheduler = Scheduler::new(catalog(&["111"]).await, queue.clone());
        scheduler.tick().await;
        scheduler.tick().await;
        assert_eq!(queue.stats().ready, 2);
    }

    #[tokio::test]
    async fn enqueue_failures_are_counted() {
        let queue = InMemoryJobQueue::arc(QueueOptions::default());
        queue.close().await.unwrap();
        let scheduler = Scheduler::new(catalog(&["111", "222"]).await, queue.clone());

        let report = scheduler.tick().await;
        assert_eq!(report, ScheduleReport { apps: 2, enqueued: 0, failed: 2 });
        assert_eq!(queue.lease(Duration::from_secs(60)).await, Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn catalog_failure_ends_the_tick() {
        let queue = InMemoryJobQueue::arc(QueueOptions::default());
        let scheduler = Scheduler::new(BrokenCatalog, queue.clone());
        assert_eq!(scheduler.tick().await, ScheduleReport::default());
        assert_eq!(queue.stats().ready, 0);
    }

    #[tokio::test]
    async fn spawned_scheduler_fills_the_queue() {
        let queue = InMemoryJobQueue::arc(QueueOptions::default());
        let scheduler = Arc::new(Scheduler::new(catalog(&["111"]).await, queue.clone()));
        let handle = scheduler.spawn(Duration::from_secs(3600));

        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.stats().ready == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        handle.shutdown().await;
        assert_eq!(queue.stats().ready, 1);
    }
}
