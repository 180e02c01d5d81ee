use std::sync::Arc;

use anyhow::Context;
use appreview_core::SystemClock;
use appreview_infra::apps::{SqliteAppCatalog, seed_catalog};
use appreview_infra::config::PipelineConfig;
use appreview_infra::db;
use appreview_infra::feed::{FetchEngine, HttpFeedClient};
use appreview_infra::queue::{JobQueue, LogDeadLetters, SqliteJobQueue};
use appreview_infra::reviews::SqliteReviewStore;
use appreview_infra::workers::{Consumer, Scheduler};
use tracing::{Instrument, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let service = appreview_observability::init("appreview-worker");
    run().instrument(service).await
}

async fn run() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env().context("failed to load configuration")?;
    info!(
        role = ?config.role,
        apps = config.app_ids.len(),
        polling_interval = ?config.polling_interval,
        consumer_interval = ?config.consumer_interval,
        "starting review pipeline"
    );

    let pool = db::connect(&config.database_url)
        .await
        .context("failed to open review database")?;
    db::migrate(&pool).await.context("failed to migrate review database")?;

    let queue_pool = if config.queue_database_url == config.database_url {
        pool.clone()
    } else {
        let queue_pool = db::connect(&config.queue_database_url)
            .await
            .context("failed to open queue database")?;
        db::migrate(&queue_pool)
            .await
            .context("failed to migrate queue database")?;
        queue_pool
    };

    let queue = Arc::new(SqliteJobQueue::new(queue_pool, config.queue));
    queue.register_failure_callback(LogDeadLetters::callback());
    match queue.stats().await {
        Ok(stats) => info!(
            ready = stats.ready,
            leased = stats.leased,
            dead_lettered = stats.dead_lettered,
            "job queue opened"
        ),
        Err(e) => warn!(error = %e, "failed to read queue stats"),
    }

    let catalog = Arc::new(SqliteAppCatalog::new(pool.clone()));
    seed_catalog(&*catalog, &config.app_ids)
        .await
        .context("failed to seed app catalog")?;

    let mut workers = Vec::new();
    if config.role.runs_scheduler() {
        let scheduler = Arc::new(Scheduler::new(catalog.clone(), queue.clone()));
        workers.push(scheduler.spawn(config.polling_interval));
    }
    if config.role.runs_consumer() {
        let feed = HttpFeedClient::new(config.feed_url_template.clone(), config.feed_timeout)
            .context("failed to build feed client")?;
        let consumer = Arc::new(Consumer::new(
            queue.clone(),
            FetchEngine::with_max_pages(feed, config.feed_max_pages),
            Arc::new(SqliteReviewStore::new(pool.clone())),
            config.consumer_options(),
            Arc::new(SystemClock),
        ));
        workers.push(consumer.spawn(config.consumer_interval));
    }

    shutdown_signal().await;
    info!("shutdown signal received, stopping workers");

    for worker in workers {
        let name = worker.name();
        worker.shutdown().await;
        info!(worker = name, "worker stopped");
    }

    queue.close().await.context("failed to close job queue")?;
    pool.close().await;
    info!("review pipeline stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
