use remux_service_base::queue::TaskQueue;
use remux_service_base::repo::task::TaskRecord;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clients::links::{RemoteInstallation, RemoteTaskExchange};
use crate::task::TaskManager;

/// How long a freshly spawned manager waits for a task before dying.
pub const PRE_CLAIM_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Foreman-side handle to one remote task manager.
pub struct RemoteManagerHandle {
    pub manager_id: String,
    pub installation_uuid: String,
    pub installation_address: String,
    redundant_flag: Arc<AtomicBool>,
    join: tokio::task::JoinHandle<()>,
}

impl RemoteManagerHandle {
    pub fn is_alive(&self) -> bool {
        !self.join.is_finished()
    }

    pub fn mark_redundant(&self) {
        self.redundant_flag.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct RemoteManagerDeps {
    pub task_manager: Arc<TaskManager>,
    pub queue: Arc<dyn TaskQueue>,
    pub exchange: Arc<dyn RemoteTaskExchange>,
}

/// Spawn a manager for one outbound task. The manager lives for at most
/// `idle_timeout` before claiming from the shared remote handoff slot, and
/// then for exactly one task: upload, poll, artifact retrieval, and the
/// hand-back on the complete channel.
pub fn spawn_remote_task_manager(
    manager_id: &str,
    installation: RemoteInstallation,
    handoff_rx: Arc<Mutex<mpsc::Receiver<TaskRecord>>>,
    complete_tx: mpsc::UnboundedSender<i64>,
    deps: RemoteManagerDeps,
    cancel: CancellationToken,
    idle_timeout: Duration,
) -> RemoteManagerHandle {
    let redundant_flag = Arc::new(AtomicBool::new(false));
    let manager = RemoteTaskManager {
        manager_id: manager_id.to_string(),
        installation: installation.clone(),
        handoff_rx,
        complete_tx,
        deps,
        cancel,
        redundant_flag: redundant_flag.clone(),
        idle_timeout,
    };
    let join = tokio::spawn(manager.run());

    RemoteManagerHandle {
        manager_id: manager_id.to_string(),
        installation_uuid: installation.uuid,
        installation_address: installation.address,
        redundant_flag,
        join,
    }
}

struct RemoteTaskManager {
    manager_id: String,
    installation: RemoteInstallation,
    handoff_rx: Arc<Mutex<mpsc::Receiver<TaskRecord>>>,
    complete_tx: mpsc::UnboundedSender<i64>,
    deps: RemoteManagerDeps,
    cancel: CancellationToken,
    redundant_flag: Arc<AtomicBool>,
    idle_timeout: Duration,
}

impl RemoteTaskManager {
    async fn run(self) {
        let task = {
            let mut handoff = self.handoff_rx.lock().await;
            tokio::select! {
                _ = self.cancel.cancelled() => None,
                task = tokio::time::timeout(self.idle_timeout, handoff.recv()) => {
                    task.ok().flatten()
                }
            }
        };

        let Some(task) = task else {
            info!(manager = %self.manager_id, "No task claimed within the idle window, exiting");
            return;
        };

        info!(
            manager = %self.manager_id,
            task_id = task.id,
            peer = %self.installation.address,
            "Handing task to remote installation"
        );
        self.process_task(task).await;
    }

    async fn process_task(&self, task: TaskRecord) {
        let scratch_json = self
            .deps
            .task_manager
            .scratch()
            .export_task_state_json(task.id);

        let remote_task_id = match self
            .deps
            .exchange
            .submit_task(&self.installation, Path::new(&task.abspath), &scratch_json)
            .await
        {
            Ok(remote_task_id) => remote_task_id,
            Err(error) => {
                warn!(
                    manager = %self.manager_id,
                    task_id = task.id,
                    %error,
                    "Failed to hand task to remote installation, requeueing"
                );
                if let Err(error) = self.deps.queue.requeue_at_bottom(task.id).await {
                    warn!(task_id = task.id, %error, "Failed to requeue task");
                }
                return;
            }
        };

        let success = self.await_remote_completion(&task, &remote_task_id).await;

        if let Err(error) = self.deps.task_manager.set_success(task.id, success).await {
            warn!(task_id = task.id, %error, "Failed to record remote task result");
        }
        if self.complete_tx.send(task.id).is_err() {
            warn!(task_id = task.id, "Complete channel closed");
        }
    }

    async fn await_remote_completion(&self, task: &TaskRecord, remote_task_id: &str) -> bool {
        loop {
            if self.cancel.is_cancelled() || self.redundant_flag.load(Ordering::SeqCst) {
                return false;
            }

            match self
                .deps
                .exchange
                .poll_status(&self.installation, remote_task_id)
                .await
            {
                Ok(status) => match status.status.as_str() {
                    "completed" | "complete" => {
                        let Some(cache_path) = task.cache_path.as_deref() else {
                            warn!(task_id = task.id, "Task has no cache path");
                            return false;
                        };
                        return match self
                            .deps
                            .exchange
                            .fetch_artifact(
                                &self.installation,
                                remote_task_id,
                                Path::new(cache_path),
                            )
                            .await
                        {
                            Ok(()) => status.success.unwrap_or(true),
                            Err(error) => {
                                warn!(task_id = task.id, %error, "Failed to fetch remote artifact");
                                false
                            }
                        };
                    }
                    "failed" => return false,
                    _ => {}
                },
                Err(error) => {
                    warn!(
                        manager = %self.manager_id,
                        task_id = task.id,
                        %error,
                        "Remote status poll failed"
                    );
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(STATUS_POLL_INTERVAL) => {}
            }
        }
    }
}
