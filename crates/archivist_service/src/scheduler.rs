//! Cancellable periodic tasks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// One iteration of a background job.
pub trait PeriodicJob: Send + Sync + 'static {
    fn run_once(&self) -> impl Future<Output = ()> + Send;
}

/// Handle for a job running on an interval.
pub struct PeriodicTask {
    name: String,
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Run `job` every `interval`, first run one interval from now.
    pub fn spawn<J: PeriodicJob>(name: impl Into<String>, interval: Duration, job: Arc<J>) -> Self {
        let name = name.into();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let task_name = name.clone();

        let join_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately, skip it
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = &mut shutdown_rx => break,

                    _ = ticker.tick() => {
                        debug!(task = %task_name, "Periodic task tick");
                        job.run_once().await;
                    }
                }
            }
            debug!(task = %task_name, "Periodic task loop exited");
        });

        info!(task = %name, interval = ?interval, "Scheduled periodic task");
        Self {
            name,
            shutdown_tx,
            join_handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop after the current iteration, if any, finishes.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.join_handle.await {
            tracing::error!(task = %self.name, "Periodic task panicked: {}", e);
        }
        info!(task = %self.name, "Periodic task stopped");
    }
}
