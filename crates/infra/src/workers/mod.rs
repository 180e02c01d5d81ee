//! Background workers: the scheduler that fills the queue and the consumer
//! that drains it.

pub mod consumer;
pub mod scheduler;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, info, warn};

pub use consumer::{Consumer, ConsumerOptions, TickOutcome};
pub use scheduler::{ScheduleReport, Scheduler};

/// Handle to stop and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Run `tick` every `period`, starting immediately.
    ///
    /// A tick that overruns its period delays the next one instead of
    /// queueing a burst. Shutdown is observed between ticks only, so a tick
    /// that has started always finishes.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();

        let join = tokio::spawn(async move {
            info!(worker = name, period = ?period, "worker started");
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = signal.notified() => {
                        info!(worker = name, "worker received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => tick().await,
                }
            }
        }
        .in_current_span());

        Self {
            name,
            shutdown,
            join,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.join.await {
            warn!(worker = self.name, error = %e, "worker task ended abnormally");
        }
    }
}
