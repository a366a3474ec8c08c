use remux_common::model::TaskStatus;
use remux_service_base::queue::TaskQueue;
use remux_service_base::repo::task::TaskRecord;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clients::history::HistorySink;
use crate::clients::plugins::PluginRuntime;
use crate::task::TaskManager;

const MAX_RETRIES: u32 = 3;
const BACKOFF_BASE_SECONDS: u64 = 2;
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Moves transcoded artifacts from the cache into the library.
///
/// Consumes tasks in `processed`. A failed move is retried with
/// exponential backoff (2s, 4s, 8s); a missing cache artifact fails
/// immediately. Terminal outcomes write exactly one history record.
pub struct PostProcessor {
    queue: Arc<dyn TaskQueue>,
    task_manager: Arc<TaskManager>,
    plugin_runtime: Arc<dyn PluginRuntime>,
    history: Arc<dyn HistorySink>,
    retry_counts: Mutex<HashMap<String, u32>>,
}

/// Move a file, falling back to copy-and-delete across filesystems.
/// Returns false without waiting when the source does not exist.
fn move_artifact(source: &Path, destination: &Path) -> bool {
    if !source.exists() {
        return false;
    }
    if let Some(parent) = destination.parent() {
        if std::fs::create_dir_all(parent).is_err() {
            return false;
        }
    }
    if std::fs::rename(source, destination).is_ok() {
        return true;
    }
    match std::fs::copy(source, destination) {
        Ok(_) => {
            let _ = std::fs::remove_file(source);
            true
        }
        Err(error) => {
            warn!(
                source = %source.display(),
                destination = %destination.display(),
                %error,
                "Failed to move artifact"
            );
            false
        }
    }
}

impl PostProcessor {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        task_manager: Arc<TaskManager>,
        plugin_runtime: Arc<dyn PluginRuntime>,
        history: Arc<dyn HistorySink>,
    ) -> Self {
        Self {
            queue,
            task_manager,
            plugin_runtime,
            history,
            retry_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("Post-processor started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                }
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    match self.queue.get_next_processed_task().await {
                        Ok(Some(task)) => self.handle_task(task, &cancel).await,
                        Ok(None) => break,
                        Err(error) => {
                            error!(%error, "Failed to fetch processed task");
                            break;
                        }
                    }
                }
            }
            info!("Post-processor stopped");
        })
    }

    fn retry_count(&self, key: &str) -> u32 {
        *self
            .retry_counts
            .lock()
            .expect("retry counts lock poisoned")
            .get(key)
            .unwrap_or(&0)
    }

    fn set_retry_count(&self, key: &str, count: u32) {
        self.retry_counts
            .lock()
            .expect("retry counts lock poisoned")
            .insert(key.to_string(), count);
    }

    fn clear_retry_count(&self, key: &str) {
        self.retry_counts
            .lock()
            .expect("retry counts lock poisoned")
            .remove(key);
    }

    /// Process one task through to a terminal outcome or a scheduled retry.
    pub async fn handle_task(&self, record: TaskRecord, cancel: &CancellationToken) {
        let source_abspath = record.abspath.clone();

        if !record.success {
            // The pipeline failed before producing an artifact; give the
            // task another run later rather than losing it.
            debug!(
                task_id = record.id,
                "Task reported failure, re-queueing at the bottom"
            );
            if let Err(error) = self.queue.requeue_at_bottom(record.id).await {
                error!(task_id = record.id, %error, "Failed to requeue task");
            }
            self.clear_retry_count(&source_abspath);
            return;
        }

        let cache_path = record.cache_path.clone().unwrap_or_default();
        let mut retry_count = self.retry_count(&source_abspath) + 1;
        self.set_retry_count(&source_abspath, retry_count);

        if cache_path.is_empty() || !Path::new(&cache_path).exists() {
            // Nothing to retry: the artifact will not appear by waiting.
            error!(
                task_id = record.id,
                cache_path, "Cache artifact missing, failing task immediately"
            );
            retry_count = MAX_RETRIES;
            self.set_retry_count(&source_abspath, retry_count);
        } else {
            let destination = match self.task_manager.destination_data(&record) {
                Ok(destination) => destination,
                Err(error) => {
                    error!(task_id = record.id, %error, "Cannot resolve destination");
                    self.finalize_failure(&record, vec![error.to_string()]).await;
                    self.clear_retry_count(&source_abspath);
                    return;
                }
            };

            if move_artifact(Path::new(&cache_path), &destination.abspath) {
                self.finalize_success(&record, &cache_path).await;
                self.clear_retry_count(&source_abspath);
                return;
            }

            if retry_count < MAX_RETRIES {
                let backoff = BACKOFF_BASE_SECONDS.pow(retry_count);
                warn!(
                    task_id = record.id,
                    retry_count, backoff, "Artifact move failed, backing off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(backoff)) => {}
                }
                if let Err(error) = self.queue.requeue_at_bottom(record.id).await {
                    error!(task_id = record.id, %error, "Failed to requeue task");
                }
                return;
            }
        }

        // Retries exhausted (or the artifact was missing outright).
        self.finalize_failure(
            &record,
            vec![format!(
                "Failed to move artifact '{cache_path}' after {retry_count} attempts"
            )],
        )
        .await;
        self.clear_retry_count(&source_abspath);
    }

    async fn finalize_success(&self, record: &TaskRecord, cache_path: &str) {
        let payload = json!({
            "library_id": record.library_id,
            "task_id": record.id,
            "task_type": record.task_type,
            "source_data": {"abspath": record.abspath},
            "task_success": true,
        });
        self.plugin_runtime
            .run_event_plugins_for_plugin_type("events.post_process", payload)
            .await;

        let history_record = self.task_manager.history_record(record, vec![]);
        if let Err(error) = self.history.save_task_history(history_record).await {
            error!(task_id = record.id, %error, "Failed to write history record");
        }

        if let Err(error) = self
            .task_manager
            .set_status(record.id, TaskStatus::Complete)
            .await
        {
            error!(task_id = record.id, %error, "Failed to complete task");
        }

        self.cleanup_cache_directory(cache_path);
        info!(task_id = record.id, file = %record.abspath, "Task completed");
    }

    /// Terminal failure: one history record, then the task row is removed.
    async fn finalize_failure(&self, record: &TaskRecord, errors: Vec<String>) {
        let mut failed = record.clone();
        failed.success = false;
        let history_record = self.task_manager.history_record(&failed, errors);
        if let Err(error) = self.history.save_task_history(history_record).await {
            error!(task_id = record.id, %error, "Failed to write history record");
        }

        match self.task_manager.delete_task(record.id).await {
            Ok(true) => {}
            Ok(false) => debug!(task_id = record.id, "Task row already gone"),
            // Deletion is opportunistic; the history record is what counts.
            Err(error) => warn!(task_id = record.id, %error, "Failed to delete task"),
        }
    }

    /// Remove the per-task conversion directory once its artifact has been
    /// moved out. Only directories created by the cache-path scheme are
    /// touched.
    fn cleanup_cache_directory(&self, cache_path: &str) {
        let Some(parent) = Path::new(cache_path).parent() else {
            return;
        };
        let is_conversion_dir = parent
            .file_name()
            .map(|name| {
                name.to_string_lossy()
                    .starts_with("unmanic_file_conversion-")
            })
            .unwrap_or(false);
        if is_conversion_dir && parent.exists() {
            if let Err(error) = std::fs::remove_dir_all(parent) {
                warn!(directory = %parent.display(), %error, "Failed to remove cache directory");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::clients::history::RecordingHistorySink;
    use crate::clients::plugins::NoopPluginRuntime;
    use crate::scratch::TaskDataStore;
    use remux_common::model::TaskType;
    use remux_service_base::db::in_memory_pool;
    use remux_service_base::queue::sqlite::SqliteTaskQueue;
    use remux_service_base::repo::library::{DbLibraryRepo, LibraryRepo};
    use remux_service_base::repo::task::DbTaskRepo;
    use std::time::Instant;

    struct Fixture {
        processor: PostProcessor,
        task_manager: Arc<TaskManager>,
        history: Arc<RecordingHistorySink>,
        queue: Arc<dyn TaskQueue>,
        _library_dir: tempfile::TempDir,
        library_path: std::path::PathBuf,
        cache_root: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let library_dir = tempfile::tempdir().unwrap();
        let cache_root = tempfile::tempdir().unwrap();
        let pool = Arc::new(in_memory_pool().await);
        let task_repo = Arc::new(DbTaskRepo::new(pool.clone()));
        let library_repo: Arc<dyn LibraryRepo> = Arc::new(DbLibraryRepo::new(pool));
        library_repo
            .create("Movies", library_dir.path().to_str().unwrap(), 0)
            .await
            .unwrap();
        let queue: Arc<dyn TaskQueue> = Arc::new(SqliteTaskQueue::new(task_repo.clone()));
        let task_manager = Arc::new(TaskManager::new(
            task_repo,
            library_repo,
            queue.clone(),
            Arc::new(TaskDataStore::new()),
            cache_root.path().to_path_buf(),
        ));
        let history = Arc::new(RecordingHistorySink::new());
        let library_path = library_dir.path().to_path_buf();
        Fixture {
            processor: PostProcessor::new(
                queue.clone(),
                task_manager.clone(),
                Arc::new(NoopPluginRuntime),
                history.clone(),
            ),
            task_manager,
            history,
            queue,
            _library_dir: library_dir,
            library_path,
            cache_root,
        }
    }

    /// Create a task and march it to `processed` with the given success.
    async fn processed_task(fixture: &Fixture, basename: &str, success: bool) -> TaskRecord {
        let abspath = fixture.library_path.join(basename);
        std::fs::write(&abspath, b"source").unwrap();
        let record = fixture
            .task_manager
            .create_task(abspath.to_str().unwrap(), TaskType::Local, 1, 0)
            .await
            .unwrap();
        fixture.queue.mark_in_progress(record.id).await.unwrap();
        fixture.task_manager.set_success(record.id, success).await.unwrap();
        fixture.queue.mark_processed(record.id).await.unwrap()
    }

    #[test]
    async fn missing_cache_fails_immediately_without_waiting() {
        let fixture = fixture().await;
        let mut record = processed_task(&fixture, "A.mkv", true).await;
        record.success = true;
        // Cache path points at a file that was never written.

        let started = Instant::now();
        fixture
            .processor
            .handle_task(record.clone(), &CancellationToken::new())
            .await;
        assert!(started.elapsed() < Duration::from_millis(100));

        let records = fixture.history.records();
        assert_eq!(records.len(), 1);
        assert!(!records[0].task_success);

        // The task row is gone and the retry counter dropped.
        assert!(fixture
            .task_manager
            .get_task(record.id)
            .await
            .unwrap()
            .is_none());
        assert_eq!(fixture.processor.retry_count(&record.abspath), 0);
    }

    #[test]
    async fn successful_move_completes_the_task() {
        let fixture = fixture().await;
        let record = processed_task(&fixture, "A.mkv", true).await;

        // Write the artifact the pipeline would have produced.
        let cache_path = std::path::PathBuf::from(record.cache_path.clone().unwrap());
        std::fs::create_dir_all(cache_path.parent().unwrap()).unwrap();
        std::fs::write(&cache_path, b"transcoded").unwrap();

        fixture
            .processor
            .handle_task(record.clone(), &CancellationToken::new())
            .await;

        let destination = fixture.library_path.join("A.mkv");
        assert_eq!(std::fs::read(&destination).unwrap(), b"transcoded");

        let stored = fixture
            .task_manager
            .get_task(record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, "complete");
        assert!(!fixture.task_manager.scratch().has_entries_for(record.id));

        let records = fixture.history.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].task_success);

        // The per-task conversion directory was removed.
        assert!(!cache_path.parent().unwrap().exists());
        let _ = &fixture.cache_root;
    }

    #[test]
    async fn unsuccessful_tasks_are_requeued_at_the_bottom() {
        let fixture = fixture().await;
        let record = processed_task(&fixture, "A.mkv", false).await;

        fixture
            .processor
            .handle_task(record.clone(), &CancellationToken::new())
            .await;

        // No history record yet: a pipeline failure is retried, not final.
        assert!(fixture.history.records().is_empty());
        let stored = fixture
            .task_manager
            .get_task(record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, "pending");
    }

    #[test]
    fn move_artifact_returns_false_for_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let started = Instant::now();
        let moved = move_artifact(
            &dir.path().join("missing.mkv"),
            &dir.path().join("out.mkv"),
        );
        assert!(!moved);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn backoff_is_exponential() {
        assert_eq!(BACKOFF_BASE_SECONDS.pow(1), 2);
        assert_eq!(BACKOFF_BASE_SECONDS.pow(2), 4);
        assert_eq!(BACKOFF_BASE_SECONDS.pow(3), 8);
    }
}
