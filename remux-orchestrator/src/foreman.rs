use remux_common::model::{PushMessage, PushMessageType, ScheduleAction};
use remux_common::time::{local_hhmm, local_weekday, unix_now};
use remux_service_base::queue::{QueueError, TaskQueue};
use remux_service_base::repo::task::TaskRecord;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clients::integrity::IntegrityChecker;
use crate::clients::links::{LinkDiscovery, RemoteInstallation, RemoteTaskExchange};
use crate::clients::plugins::PluginRuntime;
use crate::config::HealthCheckConfig;
use crate::gpu::GpuManager;
use crate::messages::FrontendPushMessages;
use crate::metrics;
use crate::remote::{
    spawn_remote_task_manager, RemoteManagerDeps, RemoteManagerHandle, PRE_CLAIM_IDLE_TIMEOUT,
};
use crate::task::TaskManager;
use crate::worker::{spawn_worker, SharedHandoffSlot, WorkerDeps, WorkerHandle, WorkerStatus};
use crate::worker_group::{WorkerGroupService, MAX_WORKERS_PER_GROUP};

const TICK_INTERVAL: Duration = Duration::from_secs(2);
const LINK_HEARTBEAT_INTERVAL_SECONDS: f64 = 10.0;
const REMOTE_AVAILABILITY_TTL_SECONDS: f64 = 30.0;

pub const MSG_PLUGIN_SETTINGS_CHANGED: &str = "pluginSettingsChangeWorkersStopped";
pub const MSG_POSTPROCESSOR_QUEUE_FULL: &str = "pendingTaskHaltedPostProcessorQueueFull";

#[derive(Clone)]
pub struct ForemanDeps {
    pub queue: Arc<dyn TaskQueue>,
    pub task_manager: Arc<TaskManager>,
    pub worker_groups: Arc<WorkerGroupService>,
    pub plugin_runtime: Arc<dyn PluginRuntime>,
    pub links: Arc<dyn LinkDiscovery>,
    pub exchange: Arc<dyn RemoteTaskExchange>,
    pub messages: Arc<FrontendPushMessages>,
    pub integrity_checker: Arc<dyn IntegrityChecker>,
    pub gpu_manager: Arc<GpuManager>,
    pub health_check: HealthCheckConfig,
}

struct AvailableRemote {
    installation: RemoteInstallation,
    created: f64,
}

/// The central scheduler. One foreman task owns the local worker pool and
/// the remote task managers, matches pending tasks to capable workers each
/// tick, enforces pause/resume and scheduled workload policies, and reacts
/// to configuration drift by pausing the pool until it settles.
pub struct Foreman {
    deps: ForemanDeps,
    worker_threads: HashMap<String, WorkerHandle>,
    paused_worker_threads: Vec<String>,
    remote_task_manager_threads: HashMap<String, RemoteManagerHandle>,
    available_remote_managers: HashMap<String, AvailableRemote>,
    // One size-1 handoff slot per role: local workers share one, remote
    // task managers the other.
    workers_handoff_tx: mpsc::Sender<TaskRecord>,
    workers_handoff_rx: SharedHandoffSlot,
    remote_handoff_tx: mpsc::Sender<TaskRecord>,
    remote_handoff_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<TaskRecord>>>,
    complete_tx: mpsc::UnboundedSender<i64>,
    complete_rx: mpsc::UnboundedReceiver<i64>,
    current_settings_hash: String,
    last_schedule_run: String,
    link_heartbeat_last_run: f64,
    // When the idle local workers' tags keep rejecting every pending task,
    // skip them for one pass so remote dispatch is not starved.
    allow_local_idle_worker_check: bool,
    cancel: CancellationToken,
}

impl Foreman {
    pub async fn new(deps: ForemanDeps, cancel: CancellationToken) -> Self {
        let (workers_handoff_tx, workers_handoff_rx) = mpsc::channel(1);
        let (remote_handoff_tx, remote_handoff_rx) = mpsc::channel(1);
        let (complete_tx, complete_rx) = mpsc::unbounded_channel();

        let mut foreman = Self {
            deps,
            worker_threads: HashMap::new(),
            paused_worker_threads: vec![],
            remote_task_manager_threads: HashMap::new(),
            available_remote_managers: HashMap::new(),
            workers_handoff_tx,
            workers_handoff_rx: Arc::new(tokio::sync::Mutex::new(workers_handoff_rx)),
            remote_handoff_tx,
            remote_handoff_rx: Arc::new(tokio::sync::Mutex::new(remote_handoff_rx)),
            complete_tx,
            complete_rx,
            current_settings_hash: String::new(),
            last_schedule_run: local_hhmm(),
            link_heartbeat_last_run: 0.0,
            allow_local_idle_worker_check: true,
            cancel,
        };
        // Prime the drift detector with the current configuration.
        foreman.configuration_changed().await;
        foreman
    }

    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("Starting foreman monitor loop");
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(TICK_INTERVAL) => {}
                }
                self.tick().await;
            }
            self.stop();
            info!("Leaving foreman monitor loop");
        })
    }

    /// Mark every worker and remote task manager redundant. Running tasks
    /// are finished, never killed.
    pub fn stop(&mut self) {
        self.paused_worker_threads.clear();
        self.cancel.cancel();
        for handle in self.worker_threads.values() {
            handle.mark_redundant();
        }
        for handle in self.remote_task_manager_threads.values() {
            handle.mark_redundant();
        }
    }

    /// One scheduler pass.
    pub async fn tick(&mut self) {
        self.drain_complete_queue().await;

        if self.cancel.is_cancelled() {
            return;
        }

        if let Err(error) = self.init_worker_threads().await {
            error!(%error, "Failed to reconcile worker threads");
        }

        self.record_worker_metrics();

        if !self.validate_worker_config().await {
            self.pause_all_worker_threads(None, true);
            return;
        } else if !self.paused_worker_threads.is_empty() {
            self.resume_recorded_worker_threads();
            self.deps.messages.remove_item(MSG_PLUGIN_SETTINGS_CHANGED);
        }

        if let Err(error) = self.manage_event_schedules().await {
            error!(%error, "Failed to run worker event schedules");
        }

        if let Err(error) = self.dispatch().await {
            error!(%error, "Dispatch failed");
        }
    }

    async fn drain_complete_queue(&mut self) {
        while let Ok(task_id) = self.complete_rx.try_recv() {
            match self.deps.queue.mark_processed(task_id).await {
                Ok(_) => debug!(task_id, "Task moved to the post-processor queue"),
                Err(error) => {
                    warn!(task_id, %error, "Failed to mark completed task as processed")
                }
            }
        }
    }

    fn worker_deps(&self) -> WorkerDeps {
        WorkerDeps {
            task_manager: self.deps.task_manager.clone(),
            plugin_runtime: self.deps.plugin_runtime.clone(),
            integrity_checker: self.deps.integrity_checker.clone(),
            gpu_manager: self.deps.gpu_manager.clone(),
            health_check: self.deps.health_check.clone(),
        }
    }

    fn start_worker_thread(&mut self, worker_id: &str, worker_name: &str, group_id: i64) {
        debug!(worker = worker_id, "Spawning worker");
        let handle = spawn_worker(
            worker_id,
            worker_name,
            group_id,
            self.worker_deps(),
            self.workers_handoff_rx.clone(),
            self.complete_tx.clone(),
            self.cancel.child_token(),
        );
        self.worker_threads.insert(worker_id.to_string(), handle);
    }

    /// Ensure the worker population matches the configured groups. Worker
    /// count reductions and group removals only ever retire idle workers.
    async fn init_worker_threads(&mut self) -> Result<(), crate::worker_group::WorkerGroupError> {
        self.worker_threads.retain(|_, handle| handle.is_alive());

        let groups = self.deps.worker_groups.get_all_worker_groups().await?;
        let group_ids: HashSet<i64> = groups.iter().map(|group| group.id).collect();
        let mut expected_names: HashSet<String> = HashSet::new();

        for group in &groups {
            for index in 0..group.number_of_workers {
                let worker_id = format!("{}-{}", group.name, index);
                let worker_name = format!("{}-Worker-{}", group.name, index + 1);
                expected_names.insert(worker_name.clone());
                if !self.worker_threads.contains_key(&worker_id) {
                    self.start_worker_thread(&worker_id, &worker_name, group.id);
                }
            }
            for index in group.number_of_workers..MAX_WORKERS_PER_GROUP {
                let worker_id = format!("{}-{}", group.name, index);
                if let Some(handle) = self.worker_threads.get(&worker_id) {
                    if handle.idle() {
                        handle.mark_redundant();
                    }
                }
            }
        }

        for handle in self.worker_threads.values() {
            if (!group_ids.contains(&handle.worker_group_id)
                || !expected_names.contains(&handle.name))
                && handle.idle()
            {
                handle.mark_redundant();
            }
        }

        Ok(())
    }

    fn record_worker_metrics(&self) {
        for handle in self.worker_threads.values() {
            let status = handle.get_status();
            metrics::WORKER_IDLE
                .with_label_values(&[status.name.as_str()])
                .set(status.idle as i64);
            metrics::WORKER_PAUSED
                .with_label_values(&[status.name.as_str()])
                .set(status.paused as i64);
        }
    }

    pub fn get_all_worker_status(&self) -> Vec<WorkerStatus> {
        self.worker_threads
            .values()
            .map(|handle| handle.get_status())
            .collect()
    }

    async fn configuration_changed(&mut self) -> bool {
        let configuration = self
            .deps
            .plugin_runtime
            .get_library_plugin_configuration()
            .await;
        let encoded = serde_json::to_string(&configuration).unwrap_or_default();
        let digest = Sha256::digest(encoded.as_bytes());
        let hash: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();

        if hash == self.current_settings_hash {
            return false;
        }
        debug!("Library plugin configuration changed; all workers will be paused");
        self.current_settings_hash = hash;
        true
    }

    fn within_library_count_limits(&self) -> bool {
        true
    }

    /// A failing validation pauses all workers with recorded resume; the
    /// recorded set is resumed on the next passing tick.
    async fn validate_worker_config(&mut self) -> bool {
        let mut valid = true;

        if !self
            .deps
            .plugin_runtime
            .get_incompatible_enabled_plugins()
            .await
            .is_empty()
        {
            valid = false;
        }
        if !self.deps.links.within_enabled_link_limits() {
            valid = false;
        }
        if self.configuration_changed().await {
            let _ = self.deps.messages.add(PushMessage {
                id: MSG_PLUGIN_SETTINGS_CHANGED.to_string(),
                message_type: PushMessageType::Warning,
                code: MSG_PLUGIN_SETTINGS_CHANGED.to_string(),
                message: "".to_string(),
                timeout: 0,
            });
            valid = false;
        }
        if !self.within_library_count_limits() {
            valid = false;
        }

        valid
    }

    pub fn pause_worker_thread(&mut self, worker_id: &str, record_paused: bool) -> bool {
        let Some(handle) = self.worker_threads.get(worker_id) else {
            warn!(worker = worker_id, "Asked to pause an unknown worker");
            return false;
        };
        if !handle.paused() {
            handle.pause();
            if record_paused && !self.paused_worker_threads.contains(&worker_id.to_string()) {
                self.paused_worker_threads.push(worker_id.to_string());
            }
        }
        true
    }

    pub fn pause_all_worker_threads(&mut self, group_id: Option<i64>, record_paused: bool) {
        for (worker_id, handle) in &self.worker_threads {
            if let Some(group_id) = group_id {
                if handle.worker_group_id != group_id {
                    continue;
                }
            }
            if !handle.paused() {
                handle.pause();
                if record_paused && !self.paused_worker_threads.contains(worker_id) {
                    self.paused_worker_threads.push(worker_id.clone());
                }
            }
        }
    }

    /// Resume exactly the workers recorded by a validation pause; workers
    /// paused for other reasons stay paused.
    fn resume_recorded_worker_threads(&mut self) {
        for worker_id in std::mem::take(&mut self.paused_worker_threads) {
            if let Some(handle) = self.worker_threads.get(&worker_id) {
                handle.resume();
            }
        }
    }

    pub fn resume_all_worker_threads(&mut self, group_id: Option<i64>) {
        for (worker_id, handle) in &self.worker_threads {
            if let Some(group_id) = group_id {
                if handle.worker_group_id != group_id {
                    continue;
                }
            }
            handle.resume();
            self.paused_worker_threads.retain(|id| id != worker_id);
        }
    }

    /// Run schedule events whose time is now. Events fire at most once per
    /// minute.
    async fn manage_event_schedules(&mut self) -> Result<(), crate::worker_group::WorkerGroupError>
    {
        let time_now = local_hhmm();
        if time_now == self.last_schedule_run {
            return Ok(());
        }
        let day = local_weekday();

        let groups = self.deps.worker_groups.get_all_worker_groups().await?;
        for group in groups {
            for event in &group.schedules {
                if event.schedule_time != time_now || !event.repetition.matches_day(day) {
                    continue;
                }
                self.last_schedule_run = time_now.clone();
                match event.schedule_task {
                    ScheduleAction::Pause => {
                        debug!(group = %group.name, "Scheduled event: pausing worker group");
                        self.pause_all_worker_threads(Some(group.id), false);
                    }
                    ScheduleAction::Resume => {
                        debug!(group = %group.name, "Scheduled event: resuming worker group");
                        self.resume_all_worker_threads(Some(group.id));
                    }
                    ScheduleAction::Count => {
                        let count = event.schedule_worker_count.unwrap_or(group.number_of_workers);
                        debug!(group = %group.name, count, "Scheduled event: setting worker count");
                        self.deps
                            .worker_groups
                            .set_number_of_workers(group.id, count)
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Remote-link housekeeping, run at most every ten seconds: terminate
    /// managers whose link was removed, reap dead managers, expire stale
    /// availability and refresh it from peer discovery.
    async fn link_manager_heartbeat(&mut self) {
        let now = unix_now();
        if self.link_heartbeat_last_run > now - LINK_HEARTBEAT_INTERVAL_SECONDS {
            return;
        }

        let configured = self.deps.links.configured_links().await;
        for handle in self.remote_task_manager_threads.values() {
            match configured.get(&handle.installation_uuid) {
                None => {
                    info!(
                        uuid = %handle.installation_uuid,
                        "Remote installation link removed from settings, terminating manager"
                    );
                    handle.mark_redundant();
                }
                Some(address) if *address != handle.installation_address => {
                    info!(
                        address = %handle.installation_address,
                        "Remote installation address changed, terminating manager"
                    );
                    handle.mark_redundant();
                }
                _ => {}
            }
        }

        self.remote_task_manager_threads
            .retain(|_, handle| handle.is_alive());

        self.available_remote_managers
            .retain(|_, available| available.created >= now - REMOTE_AVAILABILITY_TTL_SECONDS);

        let available = self
            .deps
            .links
            .check_remote_installation_for_available_workers()
            .await;
        for (uuid, installation) in available {
            for slot in 0..installation.available_slots {
                let manager_id = format!("{uuid}|M{slot}");
                if self.available_remote_managers.contains_key(&manager_id)
                    || self.remote_task_manager_threads.contains_key(&manager_id)
                {
                    continue;
                }
                self.available_remote_managers.insert(
                    manager_id,
                    AvailableRemote {
                        installation: installation.clone(),
                        created: now,
                    },
                );
            }
        }

        self.link_heartbeat_last_run = now;
    }

    /// The first available remote slot matching a library name, reserved on
    /// return.
    fn fetch_available_remote_installation(
        &mut self,
        library_name: Option<&str>,
    ) -> Option<(String, RemoteInstallation)> {
        let manager_id = self
            .available_remote_managers
            .iter()
            .find(|(manager_id, available)| {
                if self.remote_task_manager_threads.contains_key(*manager_id) {
                    return false;
                }
                match library_name {
                    Some(name) => available
                        .installation
                        .library_names
                        .iter()
                        .any(|library| library == name),
                    None => true,
                }
            })
            .map(|(manager_id, _)| manager_id.clone())?;
        let available = self.available_remote_managers.remove(&manager_id)?;
        Some((manager_id, available.installation))
    }

    async fn postprocessor_queue_full(&self) -> Result<bool, QueueError> {
        let processed = self.deps.queue.list_processed_tasks(None).await?;
        metrics::PROCESSED_TASKS.set(processed.len() as i64);

        let total_workers = self
            .deps
            .worker_groups
            .total_worker_count()
            .await
            .unwrap_or(0);
        let limit = total_workers
            + 1
            + self.available_remote_managers.len() as i64
            + self.remote_task_manager_threads.len() as i64;

        if processed.len() as i64 > limit {
            warn!(
                current = processed.len(),
                limit, "Post-processor queue full, halting worker dispatch"
            );
            let _ = self.deps.messages.update(PushMessage {
                id: MSG_POSTPROCESSOR_QUEUE_FULL.to_string(),
                message_type: PushMessageType::Status,
                code: MSG_POSTPROCESSOR_QUEUE_FULL.to_string(),
                message: "".to_string(),
                timeout: 0,
            });
            return Ok(true);
        }

        self.deps.messages.remove_item(MSG_POSTPROCESSOR_QUEUE_FULL);
        Ok(false)
    }

    fn eligible_worker_ids(&self) -> Vec<String> {
        self.worker_threads
            .iter()
            .filter(|(_, handle)| {
                handle.idle() && handle.is_alive() && !handle.paused() && !handle.redundant()
            })
            .map(|(worker_id, _)| worker_id.clone())
            .collect()
    }

    async fn fire_task_scheduled_event(&self, task: &TaskRecord) {
        if task.task_type != "local" {
            // Tasks received from a peer were already scheduled on the
            // installation that considers them local.
            return;
        }
        let basename = std::path::Path::new(&task.abspath)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        self.deps
            .plugin_runtime
            .run_event_plugins_for_plugin_type(
                "events.task_scheduled",
                json!({
                    "library_id": task.library_id,
                    "task_id": task.id,
                    "task_type": task.task_type,
                    "task_schedule_type": "local",
                    "remote_installation_info": {},
                    "source_data": {"abspath": task.abspath, "basename": basename},
                }),
            )
            .await;
    }

    async fn dispatch(&mut self) -> Result<(), QueueError> {
        metrics::PENDING_TASKS.set(self.deps.queue.list_pending_tasks(None).await?.len() as i64);

        if self.deps.queue.pending_is_empty().await? {
            return Ok(());
        }

        self.link_manager_heartbeat().await;

        // A full handoff slot means the thread assigned to collect the
        // previous task has not done so yet; handing out another task now
        // would let a different thread take the first thread's task. Skip
        // the tick until both slots are clear.
        if self.workers_handoff_tx.capacity() == 0 || self.remote_handoff_tx.capacity() == 0 {
            return Ok(());
        }

        let worker_ids = self.eligible_worker_ids();
        if self.allow_local_idle_worker_check && !worker_ids.is_empty() {
            if self.postprocessor_queue_full().await? {
                return Ok(());
            }
            self.dispatch_local(worker_ids).await
        } else if !self.available_remote_managers.is_empty() {
            self.allow_local_idle_worker_check = true;
            if self.postprocessor_queue_full().await? {
                return Ok(());
            }
            self.dispatch_remote().await
        } else {
            self.allow_local_idle_worker_check = true;
            Ok(())
        }
    }

    /// Try each idle local worker in turn against its group's tag filter.
    async fn dispatch_local(&mut self, worker_ids: Vec<String>) -> Result<(), QueueError> {
        let groups = match self.deps.worker_groups.get_all_worker_groups().await {
            Ok(groups) => groups,
            Err(error) => {
                debug!(%error, "Unable to fetch worker groups for dispatch");
                return Ok(());
            }
        };
        let tags_by_group: HashMap<i64, Vec<String>> = groups
            .into_iter()
            .map(|group| (group.id, group.tags))
            .collect();

        for worker_id in worker_ids {
            let Some(handle) = self.worker_threads.get(&worker_id) else {
                continue;
            };
            // The group can disappear mid-tick; reconciliation cleans the
            // worker up on the next pass.
            let Some(tags) = tags_by_group.get(&handle.worker_group_id) else {
                break;
            };

            let Some(task) = self
                .deps
                .queue
                .get_next_pending_task(false, None, Some(tags))
                .await?
            else {
                continue;
            };

            info!(task_id = task.id, file = %task.abspath, worker = %worker_id, "Processing item");
            match self.workers_handoff_tx.try_send(task.clone()) {
                Ok(()) => {
                    // Only the matched worker is nudged to collect, so the
                    // task stays within its tag-compatible group.
                    handle.notify_pickup();
                    self.fire_task_scheduled_event(&task).await;
                }
                Err(error) => {
                    warn!(
                        task_id = task.id,
                        worker = %worker_id,
                        %error,
                        "Handoff slot rejected task, re-queueing at the bottom"
                    );
                    self.deps.queue.requeue_at_bottom(task.id).await?;
                }
            }
            return Ok(());
        }

        // No tag-compatible pending task for any idle local worker; give
        // remote dispatch a chance on the next pass.
        self.allow_local_idle_worker_check = false;
        Ok(())
    }

    /// Hand the next local-origin task matching an advertised remote
    /// library to a freshly spawned remote task manager.
    async fn dispatch_remote(&mut self) -> Result<(), QueueError> {
        let remote_library_names: Vec<String> = {
            let mut names: Vec<String> = self
                .available_remote_managers
                .values()
                .flat_map(|available| available.installation.library_names.clone())
                .collect();
            names.sort();
            names.dedup();
            names
        };

        let Some(task) = self
            .deps
            .queue
            .get_next_pending_task(true, Some(&remote_library_names), None)
            .await?
        else {
            return Ok(());
        };

        let library_name = self
            .deps
            .task_manager
            .library_name(task.library_id)
            .await
            .ok()
            .flatten();

        let Some((manager_id, installation)) =
            self.fetch_available_remote_installation(library_name.as_deref())
        else {
            warn!(
                task_id = task.id,
                "No remote installation available for task, re-queueing at the bottom"
            );
            self.deps.queue.requeue_at_bottom(task.id).await?;
            return Ok(());
        };

        if let Err(error) = self.remote_handoff_tx.try_send(task.clone()) {
            warn!(task_id = task.id, %error, "Remote handoff slot rejected task");
            self.available_remote_managers.insert(
                manager_id,
                AvailableRemote {
                    installation,
                    created: unix_now(),
                },
            );
            self.deps.queue.requeue_at_bottom(task.id).await?;
            return Ok(());
        }

        info!(
            task_id = task.id,
            manager = %manager_id,
            peer = %installation.address,
            "Handing task to a remote task manager"
        );
        let handle = spawn_remote_task_manager(
            &manager_id,
            installation,
            self.remote_handoff_rx.clone(),
            self.complete_tx.clone(),
            RemoteManagerDeps {
                task_manager: self.deps.task_manager.clone(),
                queue: self.deps.queue.clone(),
                exchange: self.deps.exchange.clone(),
            },
            self.cancel.child_token(),
            PRE_CLAIM_IDLE_TIMEOUT,
        );
        self.remote_task_manager_threads.insert(manager_id, handle);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn push_message_ids_are_stable() {
        // These ids are part of the frontend contract.
        assert_eq!(
            MSG_PLUGIN_SETTINGS_CHANGED,
            "pluginSettingsChangeWorkersStopped"
        );
        assert_eq!(
            MSG_POSTPROCESSOR_QUEUE_FULL,
            "pendingTaskHaltedPostProcessorQueueFull"
        );
    }
}
