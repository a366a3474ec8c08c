use rand::distr::Alphanumeric;
use rand::Rng;
use remux_common::model::{TaskStatus, TaskType};
use remux_common::time::unix_now;
use remux_common::SafeDisplay;
use remux_service_base::queue::{QueueError, TaskQueue};
use remux_service_base::repo::library::LibraryRepo;
use remux_service_base::repo::task::{TaskRecord, TaskRepo};
use remux_service_base::repo::RepoError;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::clients::history::TaskHistoryRecord;
use crate::scratch::TaskDataStore;

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatus { from: TaskStatus, to: TaskStatus },
    #[error("Task {0} not found")]
    NotFound(i64),
    #[error("A task already exists for '{0}'")]
    DuplicateAbspath(String),
    #[error("Task {0} has no cache path")]
    MissingCachePath(i64),
    #[error("Library {0} not found")]
    LibraryNotFound(i64),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
    #[error(transparent)]
    InternalQueueError(#[from] QueueError),
    #[error("Corrupt task record: {0}")]
    InternalConversionError(String),
}

impl SafeDisplay for TaskError {
    fn to_safe_string(&self) -> String {
        match self {
            TaskError::InvalidStatus { .. }
            | TaskError::NotFound(_)
            | TaskError::DuplicateAbspath(_)
            | TaskError::MissingCachePath(_)
            | TaskError::LibraryNotFound(_) => self.to_string(),
            TaskError::InternalRepoError(inner) => inner.to_safe_string(),
            TaskError::InternalQueueError(inner) => inner.to_safe_string(),
            TaskError::InternalConversionError(_) => "Internal task error".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationData {
    pub basename: String,
    pub abspath: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorderDirection {
    Top,
    Bottom,
}

/// Status reported by a distributed worker for a claimed task.
#[derive(Debug, Clone, PartialEq)]
pub enum DistributedTaskStatus {
    Processing { progress: Option<f64> },
    Completed,
    Failed { message: String },
}

/// Split a file basename into (stem, extension-without-dot).
fn split_stem_ext(basename: &str) -> (String, String) {
    match basename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), ext.to_string()),
        _ => (basename.to_string(), String::new()),
    }
}

fn random_suffix() -> String {
    let random: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{}-{}", random.to_lowercase(), unix_now() as i64)
}

/// Destination path for a finished artifact: the source directory and stem
/// with the cache artifact's extension.
pub fn prepare_file_destination_data(pathname: &Path, file_extension: &str) -> DestinationData {
    let basename = pathname
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let dirname = pathname.parent().unwrap_or_else(|| Path::new(""));
    let (stem, _) = split_stem_ext(&basename);

    let basename = format!("{stem}.{file_extension}");
    let abspath = dirname.join(&basename);
    DestinationData { basename, abspath }
}

/// All task mutations flow through here: creation, the legal status
/// transitions, cache-path handling and deletion. Status changes that reach
/// `complete` purge the scratch store.
pub struct TaskManager {
    task_repo: Arc<dyn TaskRepo>,
    library_repo: Arc<dyn LibraryRepo>,
    queue: Arc<dyn TaskQueue>,
    scratch: Arc<TaskDataStore>,
    cache_path: PathBuf,
}

impl TaskManager {
    pub fn new(
        task_repo: Arc<dyn TaskRepo>,
        library_repo: Arc<dyn LibraryRepo>,
        queue: Arc<dyn TaskQueue>,
        scratch: Arc<TaskDataStore>,
        cache_path: PathBuf,
    ) -> Self {
        Self {
            task_repo,
            library_repo,
            queue,
            scratch,
            cache_path,
        }
    }

    pub fn scratch(&self) -> &Arc<TaskDataStore> {
        &self.scratch
    }

    /// Create a task for a source file. Local tasks are promoted straight
    /// to `pending`; remote tasks stay in `creating` until the peer
    /// protocol promotes them.
    pub async fn create_task(
        &self,
        abspath: &str,
        task_type: TaskType,
        library_id: i64,
        priority_offset: i64,
    ) -> Result<TaskRecord, TaskError> {
        let library = self
            .library_repo
            .get(library_id)
            .await?
            .ok_or(TaskError::LibraryNotFound(library_id))?;

        if self.task_repo.get_by_abspath(abspath).await?.is_some() {
            return Err(TaskError::DuplicateAbspath(abspath.to_string()));
        }

        let mut record = self
            .task_repo
            .create(abspath, &task_type.to_string(), library_id)
            .await?;
        debug!(task_id = record.id, abspath, "Created new task");

        self.apply_cache_path(&mut record, None, None)?;
        record.priority = record.id + library.priority_score + priority_offset;

        if task_type == TaskType::Local {
            record.status = TaskStatus::Pending.to_string();
        }
        self.task_repo.update(&record).await?;

        if record.status == TaskStatus::Pending.to_string() {
            self.queue.enqueue_task(&record).await?;
        }

        Ok(record)
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>, TaskError> {
        Ok(self.task_repo.get(task_id).await?)
    }

    pub async fn get_task_by_abspath(
        &self,
        abspath: &str,
    ) -> Result<Option<TaskRecord>, TaskError> {
        Ok(self.task_repo.get_by_abspath(abspath).await?)
    }

    pub async fn library_name(&self, library_id: i64) -> Result<Option<String>, TaskError> {
        Ok(self
            .library_repo
            .get(library_id)
            .await?
            .map(|library| library.name))
    }

    fn parse_status(record: &TaskRecord) -> Result<TaskStatus, TaskError> {
        TaskStatus::from_str(&record.status).map_err(TaskError::InternalConversionError)
    }

    /// Apply a legal status transition. `complete` purges scratch state;
    /// a transition into `pending` makes the task visible to the
    /// dispatcher.
    pub async fn set_status(
        &self,
        task_id: i64,
        status: TaskStatus,
    ) -> Result<TaskRecord, TaskError> {
        let mut record = self
            .task_repo
            .get(task_id)
            .await?
            .ok_or(TaskError::NotFound(task_id))?;
        let current = Self::parse_status(&record)?;
        if !current.can_transition_to(status) {
            return Err(TaskError::InvalidStatus {
                from: current,
                to: status,
            });
        }

        record.status = status.to_string();
        match status {
            TaskStatus::InProgress => record.start_time = Some(unix_now()),
            TaskStatus::Processed => record.finish_time = Some(unix_now()),
            _ => {}
        }
        self.task_repo.update(&record).await?;

        match status {
            TaskStatus::Complete => self.scratch.clear_task(task_id),
            TaskStatus::Pending => self.queue.enqueue_task(&record).await?,
            _ => {}
        }

        Ok(record)
    }

    pub async fn set_success(&self, task_id: i64, success: bool) -> Result<(), TaskError> {
        let mut record = self
            .task_repo
            .get(task_id)
            .await?
            .ok_or(TaskError::NotFound(task_id))?;
        record.success = success;
        self.task_repo.update(&record).await?;
        Ok(())
    }

    /// Update the cache path. When a cache path already exists only the
    /// extension is substituted: the filename stem, including the frozen
    /// random suffix, must survive so the post-processor finds the exact
    /// file the pipeline wrote.
    pub async fn set_cache_path(
        &self,
        task_id: i64,
        cache_directory: Option<&Path>,
        file_extension: Option<&str>,
    ) -> Result<TaskRecord, TaskError> {
        let mut record = self
            .task_repo
            .get(task_id)
            .await?
            .ok_or(TaskError::NotFound(task_id))?;
        self.apply_cache_path(&mut record, cache_directory, file_extension)?;
        self.task_repo.update(&record).await?;
        Ok(record)
    }

    fn apply_cache_path(
        &self,
        record: &mut TaskRecord,
        cache_directory: Option<&Path>,
        file_extension: Option<&str>,
    ) -> Result<(), TaskError> {
        let source_basename = Path::new(&record.abspath)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let (source_stem, source_ext) = split_stem_ext(&source_basename);
        let file_extension = file_extension.unwrap_or(&source_ext);

        if let Some(existing) = &record.cache_path {
            let existing = PathBuf::from(existing);
            let existing_basename = existing
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            let (existing_stem, _) = split_stem_ext(&existing_basename);
            let directory = cache_directory
                .map(Path::to_path_buf)
                .or_else(|| existing.parent().map(Path::to_path_buf))
                .unwrap_or_default();
            record.cache_path = Some(
                directory
                    .join(format!("{existing_stem}.{file_extension}"))
                    .to_string_lossy()
                    .to_string(),
            );
            return Ok(());
        }

        // Fresh cache path: the suffix generated here is frozen for the
        // lifetime of the task.
        let suffix = random_suffix();
        let out_file = format!("{source_stem}-{suffix}.{file_extension}");
        let directory = match cache_directory {
            Some(directory) => directory.to_path_buf(),
            None => self
                .cache_path
                .join(format!("unmanic_file_conversion-{suffix}")),
        };
        record.cache_path = Some(directory.join(out_file).to_string_lossy().to_string());
        Ok(())
    }

    pub fn destination_data(&self, record: &TaskRecord) -> Result<DestinationData, TaskError> {
        let cache_path = record
            .cache_path
            .as_ref()
            .ok_or(TaskError::MissingCachePath(record.id))?;
        let cache_basename = Path::new(cache_path)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let (_, cache_ext) = split_stem_ext(&cache_basename);
        Ok(prepare_file_destination_data(
            Path::new(&record.abspath),
            &cache_ext,
        ))
    }

    pub async fn modify_path(&self, task_id: i64, new_path: &str) -> Result<(), TaskError> {
        let mut record = self
            .task_repo
            .get(task_id)
            .await?
            .ok_or(TaskError::NotFound(task_id))?;
        record.abspath = new_path.to_string();
        self.task_repo.update(&record).await?;
        Ok(())
    }

    /// Append command output to the task's cumulative log.
    pub async fn save_command_log(&self, task_id: i64, lines: &[String]) -> Result<(), TaskError> {
        let mut record = self
            .task_repo
            .get(task_id)
            .await?
            .ok_or(TaskError::NotFound(task_id))?;
        record.log.push_str(&lines.concat());
        self.task_repo.update(&record).await?;
        Ok(())
    }

    pub async fn assign_worker(&self, task_id: i64, worker_id: &str) -> Result<(), TaskError> {
        Ok(self.task_repo.assign_worker(task_id, worker_id).await?)
    }

    /// Delete the task row and purge its scratch state.
    pub async fn delete_task(&self, task_id: i64) -> Result<bool, TaskError> {
        self.scratch.clear_task(task_id);
        Ok(self.task_repo.delete(task_id).await?)
    }

    pub async fn reorder_tasks(
        &self,
        task_ids: &[i64],
        direction: ReorderDirection,
    ) -> Result<(), TaskError> {
        let offset = self.task_repo.max_priority().await? + 500;
        for task_id in task_ids {
            if let Some(mut record) = self.task_repo.get(*task_id).await? {
                record.priority = match direction {
                    ReorderDirection::Top => record.priority + offset,
                    ReorderDirection::Bottom => 0,
                };
                self.task_repo.update(&record).await?;
            }
        }
        Ok(())
    }

    /// Apply a status report from a distributed worker. These bypass the
    /// local lifecycle: the peer transcodes and delivers the artifact
    /// itself, so `completed` lands straight in `complete`.
    pub async fn apply_distributed_status(
        &self,
        task_id: i64,
        status: DistributedTaskStatus,
    ) -> Result<TaskRecord, TaskError> {
        let mut record = self
            .task_repo
            .get(task_id)
            .await?
            .ok_or(TaskError::NotFound(task_id))?;

        match status {
            DistributedTaskStatus::Processing { progress } => {
                if let Some(progress) = progress {
                    self.scratch
                        .set_task_state(
                            Some(task_id),
                            "progress",
                            serde_json::Value::from(progress),
                        )
                        .ok();
                }
            }
            DistributedTaskStatus::Completed => {
                record.status = TaskStatus::Complete.to_string();
                record.success = true;
                record.finish_time = Some(unix_now());
                self.task_repo.update(&record).await?;
                self.scratch.clear_task(task_id);
            }
            DistributedTaskStatus::Failed { message } => {
                record.status = TaskStatus::Failed.to_string();
                record.success = false;
                record.log.push_str(&message);
                self.task_repo.update(&record).await?;
            }
        }

        Ok(record)
    }

    /// The one-shot history payload for a finished task.
    pub fn history_record(&self, record: &TaskRecord, errors: Vec<String>) -> TaskHistoryRecord {
        let basename = Path::new(&record.abspath)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        TaskHistoryRecord {
            task_label: basename,
            abspath: record.abspath.clone(),
            task_success: record.success,
            start_time: record.start_time,
            finish_time: record.finish_time,
            processed_by_worker: record.processed_by_worker.clone(),
            errors,
            log: record.log.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use remux_service_base::db::in_memory_pool;
    use remux_service_base::queue::sqlite::SqliteTaskQueue;
    use remux_service_base::repo::library::DbLibraryRepo;
    use remux_service_base::repo::task::DbTaskRepo;

    async fn manager() -> TaskManager {
        let pool = Arc::new(in_memory_pool().await);
        let task_repo: Arc<dyn TaskRepo> = Arc::new(DbTaskRepo::new(pool.clone()));
        let library_repo: Arc<dyn LibraryRepo> = Arc::new(DbLibraryRepo::new(pool));
        library_repo.create("Movies", "/library", 10).await.unwrap();
        let queue = Arc::new(SqliteTaskQueue::new(task_repo.clone()));
        TaskManager::new(
            task_repo,
            library_repo,
            queue,
            Arc::new(TaskDataStore::new()),
            PathBuf::from("/tmp/remux"),
        )
    }

    #[test]
    async fn create_assigns_priority_and_cache_path() {
        let manager = manager().await;
        let record = manager
            .create_task("/library/A.mkv", TaskType::Local, 1, 5)
            .await
            .unwrap();

        assert_eq!(record.status, "pending");
        // id + library priority score + offset
        assert_eq!(record.priority, record.id + 10 + 5);

        let cache_path = record.cache_path.as_ref().unwrap();
        assert!(cache_path.contains("unmanic_file_conversion-"));
        assert!(cache_path.ends_with(".mkv"));
        let file_stem = Path::new(cache_path)
            .file_stem()
            .unwrap()
            .to_string_lossy()
            .to_string();
        assert!(file_stem.starts_with("A-"));
    }

    #[test]
    async fn remote_tasks_stay_in_creating() {
        let manager = manager().await;
        let record = manager
            .create_task("/incoming/B.mkv", TaskType::Remote, 1, 0)
            .await
            .unwrap();
        assert_eq!(record.status, "creating");
    }

    #[test]
    async fn duplicate_abspath_is_rejected() {
        let manager = manager().await;
        manager
            .create_task("/library/A.mkv", TaskType::Local, 1, 0)
            .await
            .unwrap();
        let err = manager
            .create_task("/library/A.mkv", TaskType::Local, 1, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::DuplicateAbspath(_)));
    }

    #[test]
    async fn extension_updates_preserve_the_frozen_suffix() {
        let manager = manager().await;
        let record = manager
            .create_task("/library/A.mkv", TaskType::Local, 1, 0)
            .await
            .unwrap();
        let original = record.cache_path.clone().unwrap();
        let original_stem = Path::new(&original)
            .file_stem()
            .unwrap()
            .to_string_lossy()
            .to_string();
        let directory = Path::new(&original).parent().unwrap().to_path_buf();

        // Repeated extension-only updates must never regenerate the stem.
        for extension in ["mp4", "avi", "mkv", "mp4"] {
            let updated = manager
                .set_cache_path(record.id, Some(&directory), Some(extension))
                .await
                .unwrap();
            let cache_path = updated.cache_path.unwrap();
            let stem = Path::new(&cache_path)
                .file_stem()
                .unwrap()
                .to_string_lossy()
                .to_string();
            assert_eq!(stem, original_stem);
            assert!(cache_path.ends_with(&format!(".{extension}")));
        }
    }

    #[test]
    async fn destination_data_uses_cache_extension() {
        let manager = manager().await;
        let mut record = manager
            .create_task("/library/Movies/A.mkv", TaskType::Local, 1, 0)
            .await
            .unwrap();
        record = manager
            .set_cache_path(record.id, None, Some("mp4"))
            .await
            .unwrap();

        let destination = manager.destination_data(&record).unwrap();
        assert_eq!(destination.basename, "A.mp4");
        assert_eq!(destination.abspath, PathBuf::from("/library/Movies/A.mp4"));
    }

    #[test]
    async fn illegal_transitions_are_rejected() {
        let manager = manager().await;
        let record = manager
            .create_task("/library/A.mkv", TaskType::Local, 1, 0)
            .await
            .unwrap();

        let err = manager
            .set_status(record.id, TaskStatus::Complete)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TaskError::InvalidStatus {
                from: TaskStatus::Pending,
                to: TaskStatus::Complete
            }
        ));
    }

    #[test]
    async fn completing_a_task_purges_scratch_state() {
        let manager = manager().await;
        let record = manager
            .create_task("/library/A.mkv", TaskType::Local, 1, 0)
            .await
            .unwrap();
        manager
            .scratch()
            .set_task_state(Some(record.id), "progress", serde_json::json!(1.0))
            .unwrap();

        manager
            .set_status(record.id, TaskStatus::InProgress)
            .await
            .unwrap();
        manager
            .set_status(record.id, TaskStatus::Processed)
            .await
            .unwrap();
        assert!(manager.scratch().has_entries_for(record.id));

        manager
            .set_status(record.id, TaskStatus::Complete)
            .await
            .unwrap();
        assert!(!manager.scratch().has_entries_for(record.id));
    }

    #[test]
    async fn command_log_is_append_only() {
        let manager = manager().await;
        let record = manager
            .create_task("/library/A.mkv", TaskType::Local, 1, 0)
            .await
            .unwrap();

        manager
            .save_command_log(record.id, &["first\n".to_string()])
            .await
            .unwrap();
        manager
            .save_command_log(record.id, &["second\n".to_string()])
            .await
            .unwrap();

        let record = manager.get_task(record.id).await.unwrap().unwrap();
        assert_eq!(record.log, "first\nsecond\n");
    }
}
