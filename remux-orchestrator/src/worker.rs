use remux_service_base::repo::task::TaskRecord;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clients::integrity::{IntegrityChecker, IntegrityStatus};
use crate::clients::plugins::{PipelineProgress, PipelineRequest, PluginRuntime};
use crate::config::HealthCheckConfig;
use crate::gpu::GpuManager;
use crate::task::TaskManager;
use remux_common::time::unix_now;

/// Lines of subprocess output retained per worker.
const WORKER_LOG_TAIL: usize = 500;

const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The handoff slot all local workers share. The foreman fills it with one
/// task at a time and nudges the chosen worker to collect; it is never
/// refilled until that worker has drained it.
pub type SharedHandoffSlot = Arc<tokio::sync::Mutex<mpsc::Receiver<TaskRecord>>>;

#[derive(Default)]
struct SubprocessStats {
    pid: Option<u32>,
    percent: f64,
    start_time: Option<f64>,
    cpu_percent: f64,
    mem_percent: f64,
    rss_bytes: u64,
    vms_bytes: u64,
}

/// Tracks the transcode subprocess a worker currently drives. Stats are
/// sampled lazily when status is read.
pub struct SubprocessMonitor {
    stats: Mutex<SubprocessStats>,
    system: Mutex<System>,
}

impl Default for SubprocessMonitor {
    fn default() -> Self {
        Self {
            stats: Mutex::new(SubprocessStats::default()),
            system: Mutex::new(System::new()),
        }
    }
}

impl SubprocessMonitor {
    pub fn set_pid(&self, pid: Option<u32>) {
        let mut stats = self.stats.lock().expect("subprocess stats lock poisoned");
        stats.pid = pid;
        if pid.is_some() && stats.start_time.is_none() {
            stats.start_time = Some(unix_now());
        }
    }

    pub fn set_percent(&self, percent: f64) {
        self.stats
            .lock()
            .expect("subprocess stats lock poisoned")
            .percent = percent;
    }

    pub fn reset(&self) {
        *self.stats.lock().expect("subprocess stats lock poisoned") =
            SubprocessStats::default();
    }

    fn sample(&self) {
        let pid = {
            let stats = self.stats.lock().expect("subprocess stats lock poisoned");
            stats.pid
        };
        let Some(pid) = pid else { return };

        let mut system = self.system.lock().expect("subprocess system lock poisoned");
        system.refresh_memory();
        system.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
        let total_memory = system.total_memory();

        let mut stats = self.stats.lock().expect("subprocess stats lock poisoned");
        match system.process(Pid::from_u32(pid)) {
            Some(process) => {
                stats.cpu_percent = process.cpu_usage() as f64;
                stats.rss_bytes = process.memory();
                stats.vms_bytes = process.virtual_memory();
                stats.mem_percent = if total_memory > 0 {
                    (process.memory() as f64 / total_memory as f64) * 100.0
                } else {
                    0.0
                };
            }
            None => {
                stats.cpu_percent = 0.0;
                stats.mem_percent = 0.0;
            }
        }
    }

    /// All values string-coerced, as consumed by the UI.
    pub fn get_subprocess_stats(&self) -> HashMap<String, String> {
        self.sample();
        let stats = self.stats.lock().expect("subprocess stats lock poisoned");
        let elapsed = stats
            .start_time
            .map(|start| (unix_now() - start) as i64)
            .unwrap_or(0);
        HashMap::from([
            (
                "pid".to_string(),
                stats
                    .pid
                    .map(|pid| pid.to_string())
                    .unwrap_or_else(|| "None".to_string()),
            ),
            ("percent".to_string(), stats.percent.to_string()),
            ("elapsed".to_string(), elapsed.to_string()),
            ("cpu_percent".to_string(), stats.cpu_percent.to_string()),
            ("mem_percent".to_string(), stats.mem_percent.to_string()),
            ("rss_bytes".to_string(), stats.rss_bytes.to_string()),
            ("vms_bytes".to_string(), stats.vms_bytes.to_string()),
        ])
    }
}

struct WorkerProgress {
    subprocess: Arc<SubprocessMonitor>,
    worker_log: Arc<Mutex<VecDeque<String>>>,
    runners_info: Arc<Mutex<HashMap<String, String>>>,
}

impl PipelineProgress for WorkerProgress {
    fn set_subprocess_pid(&self, pid: Option<u32>) {
        self.subprocess.set_pid(pid);
    }

    fn set_subprocess_percent(&self, percent: f64) {
        self.subprocess.set_percent(percent);
    }

    fn set_runner_status(&self, runner: &str, status: &str) {
        self.runners_info
            .lock()
            .expect("runners info lock poisoned")
            .insert(runner.to_string(), status.to_string());
    }

    fn append_log(&self, line: &str) {
        let mut log = self.worker_log.lock().expect("worker log lock poisoned");
        log.push_back(line.to_string());
        while log.len() > WORKER_LOG_TAIL {
            log.pop_front();
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub id: String,
    pub name: String,
    pub idle: bool,
    pub paused: bool,
    pub start_time: String,
    pub current_task: String,
    pub current_file: String,
    pub worker_log_tail: Vec<String>,
    pub runners_info: HashMap<String, String>,
    pub subprocess: HashMap<String, String>,
    pub gpu: String,
}

#[derive(Clone)]
pub struct WorkerDeps {
    pub task_manager: Arc<TaskManager>,
    pub plugin_runtime: Arc<dyn PluginRuntime>,
    pub integrity_checker: Arc<dyn IntegrityChecker>,
    pub gpu_manager: Arc<GpuManager>,
    pub health_check: HealthCheckConfig,
}

#[derive(Clone)]
struct WorkerState {
    idle: Arc<AtomicBool>,
    paused_flag: Arc<AtomicBool>,
    redundant_flag: Arc<AtomicBool>,
    // The flag carries the pickup signal; the notify only shortens the
    // wait, so a wake-up racing the poll timer cannot be lost.
    pickup_flag: Arc<AtomicBool>,
    pickup: Arc<Notify>,
    start_time: Arc<Mutex<Option<f64>>>,
    current_task: Arc<Mutex<Option<(i64, String)>>>,
    current_gpu: Arc<Mutex<Option<String>>>,
    subprocess: Arc<SubprocessMonitor>,
    worker_log: Arc<Mutex<VecDeque<String>>>,
    runners_info: Arc<Mutex<HashMap<String, String>>>,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            idle: Arc::new(AtomicBool::new(true)),
            paused_flag: Arc::new(AtomicBool::new(false)),
            redundant_flag: Arc::new(AtomicBool::new(false)),
            pickup_flag: Arc::new(AtomicBool::new(false)),
            pickup: Arc::new(Notify::new()),
            start_time: Arc::new(Mutex::new(None)),
            current_task: Arc::new(Mutex::new(None)),
            current_gpu: Arc::new(Mutex::new(None)),
            subprocess: Arc::new(SubprocessMonitor::default()),
            worker_log: Arc::new(Mutex::new(VecDeque::new())),
            runners_info: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// The foreman-side handle to one spawned worker.
pub struct WorkerHandle {
    pub thread_id: String,
    pub name: String,
    pub worker_group_id: i64,
    state: WorkerState,
    join: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    pub fn is_alive(&self) -> bool {
        !self.join.is_finished()
    }

    pub fn idle(&self) -> bool {
        self.state.idle.load(Ordering::SeqCst)
    }

    pub fn paused(&self) -> bool {
        self.state.paused_flag.load(Ordering::SeqCst)
    }

    pub fn redundant(&self) -> bool {
        self.state.redundant_flag.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.state.paused_flag.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.state.paused_flag.store(false, Ordering::SeqCst);
    }

    pub fn mark_redundant(&self) {
        self.state.redundant_flag.store(true, Ordering::SeqCst);
    }

    /// Tell this worker to collect the task waiting in the shared handoff
    /// slot. Only the worker the foreman matched is ever nudged, so the
    /// task cannot be taken by a worker with different tags.
    pub fn notify_pickup(&self) {
        self.state.pickup_flag.store(true, Ordering::SeqCst);
        self.state.pickup.notify_one();
    }

    pub fn get_status(&self) -> WorkerStatus {
        let (current_task, current_file) = self
            .state
            .current_task
            .lock()
            .expect("worker state lock poisoned")
            .clone()
            .map(|(id, file)| (id.to_string(), file))
            .unwrap_or_default();
        WorkerStatus {
            id: self.thread_id.clone(),
            name: self.name.clone(),
            idle: self.idle(),
            paused: self.paused(),
            start_time: self
                .state
                .start_time
                .lock()
                .expect("worker state lock poisoned")
                .map(|t| t.to_string())
                .unwrap_or_default(),
            current_task,
            current_file,
            worker_log_tail: self
                .state
                .worker_log
                .lock()
                .expect("worker log lock poisoned")
                .iter()
                .cloned()
                .collect(),
            runners_info: self
                .state
                .runners_info
                .lock()
                .expect("runners info lock poisoned")
                .clone(),
            subprocess: self.state.subprocess.get_subprocess_stats(),
            gpu: self
                .state
                .current_gpu
                .lock()
                .expect("worker state lock poisoned")
                .clone()
                .unwrap_or_default(),
        }
    }
}

/// Spawn a worker task bound to one worker group. Workers collect one task
/// at a time from the shared handoff slot when nudged by the foreman, and
/// report finished tasks on the shared complete channel.
pub fn spawn_worker(
    thread_id: &str,
    name: &str,
    worker_group_id: i64,
    deps: WorkerDeps,
    handoff_rx: SharedHandoffSlot,
    complete_tx: mpsc::UnboundedSender<i64>,
    cancel: CancellationToken,
) -> WorkerHandle {
    let state = WorkerState::new();

    let worker = Worker {
        thread_id: thread_id.to_string(),
        state: state.clone(),
        deps,
        handoff_rx,
        complete_tx,
        cancel,
    };
    let join = tokio::spawn(worker.run());

    WorkerHandle {
        thread_id: thread_id.to_string(),
        name: name.to_string(),
        worker_group_id,
        state,
        join,
    }
}

struct Worker {
    thread_id: String,
    state: WorkerState,
    deps: WorkerDeps,
    handoff_rx: SharedHandoffSlot,
    complete_tx: mpsc::UnboundedSender<i64>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        info!(worker = %self.thread_id, "Worker started");
        loop {
            if self.state.redundant_flag.load(Ordering::SeqCst) {
                break;
            }

            if self.state.pickup_flag.swap(false, Ordering::SeqCst) {
                let task = {
                    let mut handoff = self.handoff_rx.lock().await;
                    handoff.try_recv().ok()
                };
                if let Some(task) = task {
                    self.process_task(task).await;
                    if self.state.redundant_flag.load(Ordering::SeqCst) {
                        break;
                    }
                }
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.state.pickup.notified() => {}
                // Re-check the pickup and redundant flags while parked.
                _ = tokio::time::sleep(PAUSE_POLL_INTERVAL) => {}
            }
        }
        info!(worker = %self.thread_id, "Worker stopped");
    }

    /// Suspend between pipeline stages while the pause flag is set. The
    /// active subprocess is never interrupted mid-stream.
    async fn wait_while_paused(&self) {
        while self.state.paused_flag.load(Ordering::SeqCst)
            && !self.state.redundant_flag.load(Ordering::SeqCst)
            && !self.cancel.is_cancelled()
        {
            tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
        }
    }

    async fn process_task(&self, task: TaskRecord) {
        let task_id = task.id;
        self.state.idle.store(false, Ordering::SeqCst);
        *self
            .state
            .start_time
            .lock()
            .expect("worker state lock poisoned") = Some(unix_now());
        *self
            .state
            .current_task
            .lock()
            .expect("worker state lock poisoned") = Some((task_id, task.abspath.clone()));
        self.state
            .worker_log
            .lock()
            .expect("worker log lock poisoned")
            .clear();
        self.state
            .runners_info
            .lock()
            .expect("runners info lock poisoned")
            .clear();

        info!(worker = %self.thread_id, task_id, file = %task.abspath, "Picked up task");

        self.wait_while_paused().await;

        let gpu = self.deps.gpu_manager.allocate(&self.thread_id, None);
        *self
            .state
            .current_gpu
            .lock()
            .expect("worker state lock poisoned") = gpu.map(|device| device.device_id);

        let mut success = self.run_pipeline_stages(&task).await;

        if let Err(error) = self.deps.task_manager.set_success(task_id, success).await {
            warn!(worker = %self.thread_id, task_id, %error, "Failed to record task result");
            success = false;
        }
        debug!(worker = %self.thread_id, task_id, success, "Task finished");

        self.deps.gpu_manager.release(&self.thread_id);
        *self
            .state
            .current_gpu
            .lock()
            .expect("worker state lock poisoned") = None;

        if self.complete_tx.send(task_id).is_err() {
            warn!(worker = %self.thread_id, task_id, "Complete channel closed");
        }

        *self
            .state
            .current_task
            .lock()
            .expect("worker state lock poisoned") = None;
        self.state.subprocess.reset();
        *self
            .state
            .start_time
            .lock()
            .expect("worker state lock poisoned") = None;
        self.state.idle.store(true, Ordering::SeqCst);
    }

    async fn run_pipeline_stages(&self, task: &TaskRecord) -> bool {
        let health = &self.deps.health_check;
        let source = std::path::Path::new(&task.abspath);

        if health.run_pre_transcode_check {
            let report = self
                .deps
                .integrity_checker
                .run_integrity_check(source, health.clamped_timeout())
                .await;
            if report.status == IntegrityStatus::Corrupted && health.fail_on_pre_check_corruption
            {
                warn!(
                    worker = %self.thread_id,
                    task_id = task.id,
                    "Source file failed the pre-transcode integrity check"
                );
                return false;
            }
        }

        self.wait_while_paused().await;

        let Some(cache_path) = task.cache_path.clone() else {
            warn!(worker = %self.thread_id, task_id = task.id, "Task has no cache path");
            return false;
        };
        let request = PipelineRequest {
            task_id: task.id,
            library_id: task.library_id,
            source_abspath: task.abspath.clone(),
            cache_path: cache_path.clone(),
        };
        let progress = WorkerProgress {
            subprocess: self.state.subprocess.clone(),
            worker_log: self.state.worker_log.clone(),
            runners_info: self.state.runners_info.clone(),
        };
        let outcome = self
            .deps
            .plugin_runtime
            .run_worker_pipeline(&request, &progress)
            .await;
        if !outcome.log.is_empty() {
            if let Err(error) = self
                .deps
                .task_manager
                .save_command_log(task.id, &outcome.log)
                .await
            {
                warn!(worker = %self.thread_id, task_id = task.id, %error, "Failed to save command log");
            }
        }
        if !outcome.success {
            return false;
        }

        self.wait_while_paused().await;

        if health.run_post_transcode_check {
            let report = self
                .deps
                .integrity_checker
                .run_integrity_check(std::path::Path::new(&cache_path), health.clamped_timeout())
                .await;
            if report.status == IntegrityStatus::Corrupted {
                warn!(
                    worker = %self.thread_id,
                    task_id = task.id,
                    "Cache artifact failed the post-transcode integrity check"
                );
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::clients::integrity::NoopIntegrityChecker;
    use crate::clients::plugins::{NoopPluginRuntime, PipelineOutcome};
    use crate::config::GpuConfig;
    use crate::scratch::TaskDataStore;
    use async_trait::async_trait;
    use remux_common::model::TaskType;
    use remux_service_base::db::in_memory_pool;
    use remux_service_base::queue::sqlite::SqliteTaskQueue;
    use remux_service_base::queue::TaskQueue;
    use remux_service_base::repo::library::{DbLibraryRepo, LibraryRepo};
    use remux_service_base::repo::task::DbTaskRepo;

    async fn deps() -> (WorkerDeps, Arc<dyn TaskQueue>) {
        let pool = Arc::new(in_memory_pool().await);
        let task_repo = Arc::new(DbTaskRepo::new(pool.clone()));
        let library_repo: Arc<dyn LibraryRepo> = Arc::new(DbLibraryRepo::new(pool));
        library_repo.create("Movies", "/library", 0).await.unwrap();
        let queue: Arc<dyn TaskQueue> = Arc::new(SqliteTaskQueue::new(task_repo.clone()));
        let task_manager = Arc::new(TaskManager::new(
            task_repo,
            library_repo,
            queue.clone(),
            Arc::new(TaskDataStore::new()),
            std::path::PathBuf::from("/tmp/remux"),
        ));
        (
            WorkerDeps {
                task_manager,
                plugin_runtime: Arc::new(NoopPluginRuntime),
                integrity_checker: Arc::new(NoopIntegrityChecker),
                gpu_manager: Arc::new(GpuManager::from_config(&GpuConfig::default())),
                health_check: HealthCheckConfig::default(),
            },
            queue,
        )
    }

    fn shared_slot() -> (mpsc::Sender<TaskRecord>, SharedHandoffSlot) {
        let (tx, rx) = mpsc::channel(1);
        (tx, Arc::new(tokio::sync::Mutex::new(rx)))
    }

    #[test]
    async fn processes_an_assigned_task_to_the_complete_channel() {
        let (deps, queue) = deps().await;
        deps.task_manager
            .create_task("/library/A.mkv", TaskType::Local, 1, 0)
            .await
            .unwrap();
        let claimed = queue
            .get_next_pending_task(false, None, None)
            .await
            .unwrap()
            .unwrap();

        let (handoff_tx, handoff_rx) = shared_slot();
        let (complete_tx, mut complete_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = spawn_worker(
            "default-0",
            "default-Worker-1",
            1,
            deps.clone(),
            handoff_rx,
            complete_tx,
            cancel.clone(),
        );

        handoff_tx.try_send(claimed.clone()).unwrap();
        handle.notify_pickup();
        let finished = tokio::time::timeout(Duration::from_secs(5), complete_rx.recv())
            .await
            .expect("worker did not finish in time")
            .unwrap();
        assert_eq!(finished, claimed.id);

        let record = deps
            .task_manager
            .get_task(claimed.id)
            .await
            .unwrap()
            .unwrap();
        assert!(record.success);

        // Worker settles back to idle with no current task.
        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.idle() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker never became idle");
        let status = handle.get_status();
        assert_eq!(status.current_task, "");
        assert_eq!(status.subprocess.get("pid").map(String::as_str), Some("None"));

        cancel.cancel();
    }

    #[test]
    async fn redundant_worker_exits_after_current_task() {
        let (deps, _queue) = deps().await;
        let (_handoff_tx, handoff_rx) = shared_slot();
        let (complete_tx, _complete_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = spawn_worker(
            "default-0",
            "default-Worker-1",
            1,
            deps,
            handoff_rx,
            complete_tx,
            cancel.clone(),
        );

        assert!(handle.is_alive());
        handle.mark_redundant();

        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.is_alive() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker never exited");
    }

    #[test]
    async fn shared_handoff_slot_holds_a_single_task() {
        let (deps, queue) = deps().await;
        deps.task_manager
            .create_task("/library/A.mkv", TaskType::Local, 1, 0)
            .await
            .unwrap();
        deps.task_manager
            .create_task("/library/B.mkv", TaskType::Local, 1, 0)
            .await
            .unwrap();

        let (handoff_tx, handoff_rx) = shared_slot();
        let (complete_tx, _complete_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let _handle = spawn_worker(
            "default-0",
            "default-Worker-1",
            1,
            deps.clone(),
            handoff_rx,
            complete_tx,
            cancel.clone(),
        );

        let first = queue
            .get_next_pending_task(false, None, None)
            .await
            .unwrap()
            .unwrap();
        let second = queue
            .get_next_pending_task(false, None, None)
            .await
            .unwrap()
            .unwrap();

        // Without a pickup nudge the slot stays occupied, so a second task
        // cannot be placed until the first is collected.
        assert!(handoff_tx.try_send(first).is_ok());
        assert!(handoff_tx.try_send(second).is_err());

        cancel.cancel();
    }

    #[test]
    async fn runner_state_is_surfaced_in_worker_status() {
        struct RunnerReportingRuntime;

        #[async_trait]
        impl PluginRuntime for RunnerReportingRuntime {
            async fn get_incompatible_enabled_plugins(&self) -> Vec<String> {
                vec![]
            }

            async fn get_library_plugin_configuration(&self) -> serde_json::Value {
                serde_json::Value::Object(serde_json::Map::new())
            }

            async fn run_worker_pipeline(
                &self,
                _request: &PipelineRequest,
                progress: &dyn PipelineProgress,
            ) -> PipelineOutcome {
                progress.set_runner_status("video_transcoder", "complete");
                progress.set_runner_status("audio_normalizer", "skipped");
                PipelineOutcome {
                    success: true,
                    log: vec![],
                }
            }

            async fn run_event_plugins_for_plugin_type(
                &self,
                _event_type: &str,
                _data: serde_json::Value,
            ) {
            }
        }

        let (mut deps, queue) = deps().await;
        deps.plugin_runtime = Arc::new(RunnerReportingRuntime);
        deps.task_manager
            .create_task("/library/A.mkv", TaskType::Local, 1, 0)
            .await
            .unwrap();
        let claimed = queue
            .get_next_pending_task(false, None, None)
            .await
            .unwrap()
            .unwrap();

        let (handoff_tx, handoff_rx) = shared_slot();
        let (complete_tx, mut complete_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = spawn_worker(
            "default-0",
            "default-Worker-1",
            1,
            deps,
            handoff_rx,
            complete_tx,
            cancel.clone(),
        );

        handoff_tx.try_send(claimed).unwrap();
        handle.notify_pickup();
        tokio::time::timeout(Duration::from_secs(5), complete_rx.recv())
            .await
            .expect("worker did not finish in time")
            .unwrap();

        // Runner state persists after the task, like the worker log, until
        // the next pickup clears it.
        let status = handle.get_status();
        assert_eq!(
            status.runners_info.get("video_transcoder").map(String::as_str),
            Some("complete")
        );
        assert_eq!(
            status.runners_info.get("audio_normalizer").map(String::as_str),
            Some("skipped")
        );

        cancel.cancel();
    }

    #[test]
    fn subprocess_stats_default_to_string_coerced_zeroes() {
        let monitor = SubprocessMonitor::default();
        let stats = monitor.get_subprocess_stats();
        assert_eq!(stats.get("pid").map(String::as_str), Some("None"));
        assert_eq!(stats.get("percent").map(String::as_str), Some("0"));
        assert_eq!(stats.get("elapsed").map(String::as_str), Some("0"));
    }

    #[test]
    fn subprocess_percent_updates() {
        let monitor = SubprocessMonitor::default();
        monitor.set_percent(75.0);
        let stats = monitor.get_subprocess_stats();
        assert_eq!(stats.get("percent").map(String::as_str), Some("75"));
    }
}
