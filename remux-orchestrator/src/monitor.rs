use remux_service_base::queue::TaskQueue;
use remux_service_base::repo::task::TaskRepo;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::auth::WorkerAuthService;
use remux_common::time::unix_now;

/// A worker is dead after this long without a heartbeat.
const WORKER_TIMEOUT_SECONDS: f64 = 300.0;
/// A claimed task is abandoned after this long without completion.
const TASK_TIMEOUT_SECONDS: f64 = 1800.0;
const MONITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Reaps timed-out distributed workers and returns their tasks to the
/// pending queue. This is the at-least-once recovery path: a task claimed
/// by a worker that disappears is always dispatched again.
pub struct DistributedWorkerMonitor {
    auth: Arc<WorkerAuthService>,
    queue: Arc<dyn TaskQueue>,
    task_repo: Arc<dyn TaskRepo>,
}

impl DistributedWorkerMonitor {
    pub fn new(
        auth: Arc<WorkerAuthService>,
        queue: Arc<dyn TaskQueue>,
        task_repo: Arc<dyn TaskRepo>,
    ) -> Self {
        Self {
            auth,
            queue,
            task_repo,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("Distributed worker monitor started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(MONITOR_INTERVAL) => {}
                }
                if let Err(error) = self.reap(unix_now()).await {
                    error!(%error, "Error in distributed worker monitor loop");
                }
            }
            info!("Distributed worker monitor stopped");
        })
    }

    /// One monitor pass at the given wall-clock time.
    pub async fn reap(&self, now: f64) -> Result<(), String> {
        let timed_out = self
            .auth
            .deactivate_stale_workers(now - WORKER_TIMEOUT_SECONDS)
            .map_err(|e| e.to_string())?;

        let in_progress = self
            .queue
            .list_in_progress_tasks(None)
            .await
            .map_err(|e| e.to_string())?;

        for task in in_progress {
            let owned_by_dead_worker = task
                .processed_by_worker
                .as_ref()
                .map(|worker_id| timed_out.contains(worker_id))
                .unwrap_or(false);
            let timed_out_task = task
                .start_time
                .map(|start| start < now - TASK_TIMEOUT_SECONDS)
                .unwrap_or(false);

            if owned_by_dead_worker || timed_out_task {
                warn!(
                    task_id = task.id,
                    worker = task.processed_by_worker.as_deref().unwrap_or(""),
                    "Requeueing abandoned task"
                );
                self.task_repo
                    .release(task.id)
                    .await
                    .map_err(|e| e.to_string())?;
            }
        }

        Ok(())
    }
}
