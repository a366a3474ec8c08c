use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use remux_common::config::QueueBackendConfig;
use remux_common::model::TaskStatus;
use remux_common::SafeDisplay;
use tracing::info;

use crate::repo::library::LibraryRepo;
use crate::repo::task::{TaskRecord, TaskRepo};
use crate::repo::RepoError;

pub mod redis;
pub mod sqlite;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatus { from: TaskStatus, to: TaskStatus },
    #[error("Task {0} not found")]
    TaskNotFound(i64),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
    #[error("Key-value store error: {0}")]
    InternalRedisError(String),
    #[error("Corrupt task record: {0}")]
    InternalConversionError(String),
}

impl From<::redis::RedisError> for QueueError {
    fn from(error: ::redis::RedisError) -> Self {
        QueueError::InternalRedisError(error.to_string())
    }
}

impl SafeDisplay for QueueError {
    fn to_safe_string(&self) -> String {
        match self {
            QueueError::InvalidStatus { .. } => self.to_string(),
            QueueError::TaskNotFound(_) => self.to_string(),
            QueueError::InternalRepoError(inner) => inner.to_safe_string(),
            QueueError::InternalRedisError(_) => "Internal queue error".to_string(),
            QueueError::InternalConversionError(_) => "Internal queue error".to_string(),
        }
    }
}

pub(crate) fn parse_status(record: &TaskRecord) -> Result<TaskStatus, QueueError> {
    TaskStatus::from_str(&record.status).map_err(QueueError::InternalConversionError)
}

/// Priority-ordered dispatch over the task lifecycle. Implementations must
/// make the pending claim atomic: of any number of concurrent claimers,
/// exactly one receives a given task.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn list_pending_tasks(&self, limit: Option<i64>)
        -> Result<Vec<TaskRecord>, QueueError>;

    async fn list_in_progress_tasks(
        &self,
        limit: Option<i64>,
    ) -> Result<Vec<TaskRecord>, QueueError>;

    async fn list_processed_tasks(
        &self,
        limit: Option<i64>,
    ) -> Result<Vec<TaskRecord>, QueueError>;

    /// Atomically claim the highest-priority pending task matching all
    /// filters; the claimed task is left in `in_progress`.
    ///
    /// `library_tags`: `None` = no filter; `Some([])` = only libraries with
    /// no tags; non-empty = libraries with at least one intersecting tag.
    async fn get_next_pending_task(
        &self,
        local_only: bool,
        library_names: Option<&[String]>,
        library_tags: Option<&[String]>,
    ) -> Result<Option<TaskRecord>, QueueError>;

    async fn get_next_processed_task(&self) -> Result<Option<TaskRecord>, QueueError>;

    async fn mark_in_progress(&self, task_id: i64) -> Result<TaskRecord, QueueError>;

    async fn mark_processed(&self, task_id: i64) -> Result<TaskRecord, QueueError>;

    async fn pending_is_empty(&self) -> Result<bool, QueueError>;

    async fn in_progress_is_empty(&self) -> Result<bool, QueueError>;

    async fn processed_is_empty(&self) -> Result<bool, QueueError>;

    /// Move a task to the bottom of the pending queue. Succeeds even when
    /// the task is no longer pending.
    async fn requeue_at_bottom(&self, task_id: i64) -> Result<bool, QueueError>;

    async fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>, QueueError>;

    /// Make a freshly created pending task visible to the dispatcher.
    async fn enqueue_task(&self, record: &TaskRecord) -> Result<(), QueueError>;
}

/// Build the configured queue backend. Sqlite is the default; the redis
/// backend runs in hybrid mode with sqlite staying authoritative.
pub async fn create_task_queue(
    backend: &QueueBackendConfig,
    task_repo: Arc<dyn TaskRepo>,
    library_repo: Arc<dyn LibraryRepo>,
) -> Result<Arc<dyn TaskQueue>, QueueError> {
    match backend {
        QueueBackendConfig::Sqlite => {
            info!("Initializing sqlite task queue backend");
            Ok(Arc::new(sqlite::SqliteTaskQueue::new(task_repo)))
        }
        QueueBackendConfig::Redis(config) => {
            info!(
                host = %config.host,
                port = config.port,
                database = config.database,
                "Initializing redis task queue backend"
            );
            let queue =
                redis::RedisTaskQueue::connect(config, task_repo, library_repo).await?;
            queue.sync_from_store().await?;
            Ok(Arc::new(queue))
        }
    }
}
