use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Pool, QueryBuilder, Row, Sqlite};

use crate::repo::RepoError;

const TASK_COLUMNS: &str = "id, abspath, library_id, type, status, priority, cache_path, \
     success, start_time, finish_time, processed_by_worker, log";

/// One row of the `tasks` table. Status strings are the lowercase lifecycle
/// names; timestamps are unix seconds.
#[derive(sqlx::FromRow, Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub id: i64,
    pub abspath: String,
    pub library_id: i64,
    #[sqlx(rename = "type")]
    pub task_type: String,
    pub status: String,
    pub priority: i64,
    pub cache_path: Option<String>,
    pub success: bool,
    pub start_time: Option<f64>,
    pub finish_time: Option<f64>,
    pub processed_by_worker: Option<String>,
    pub log: String,
}

#[async_trait]
pub trait TaskRepo: Send + Sync {
    /// Insert a new task in status `creating`. Fails on duplicate abspath.
    async fn create(
        &self,
        abspath: &str,
        task_type: &str,
        library_id: i64,
    ) -> Result<TaskRecord, RepoError>;

    async fn get(&self, task_id: i64) -> Result<Option<TaskRecord>, RepoError>;

    async fn get_by_abspath(&self, abspath: &str) -> Result<Option<TaskRecord>, RepoError>;

    /// Write back every mutable column of the record.
    async fn update(&self, record: &TaskRecord) -> Result<(), RepoError>;

    async fn delete(&self, task_id: i64) -> Result<bool, RepoError>;

    async fn list_by_status(
        &self,
        status: &str,
        limit: Option<i64>,
    ) -> Result<Vec<TaskRecord>, RepoError>;

    async fn count_by_status(&self, status: &str) -> Result<i64, RepoError>;

    /// Atomically claim the highest-priority pending task matching all
    /// filters, moving it to `in_progress`. Concurrent claimers never see
    /// the same task.
    ///
    /// Tag filter semantics: `None` means no tag filter, `Some([])` matches
    /// only libraries with no tags, a non-empty list matches libraries with
    /// at least one intersecting tag.
    async fn claim_next_pending(
        &self,
        now: f64,
        local_only: bool,
        library_names: Option<&[String]>,
        library_tags: Option<&[String]>,
    ) -> Result<Option<TaskRecord>, RepoError>;

    /// Claim one specific pending task by id (used by the key-value
    /// dispatcher to mirror its claim into the authoritative store).
    async fn claim_task(&self, task_id: i64, now: f64) -> Result<Option<TaskRecord>, RepoError>;

    /// The highest-priority task currently in `processed`.
    async fn next_processed(&self) -> Result<Option<TaskRecord>, RepoError>;

    /// `in_progress -> processed`; returns `None` when the task was not in
    /// `in_progress`.
    async fn mark_processed(
        &self,
        task_id: i64,
        now: f64,
    ) -> Result<Option<TaskRecord>, RepoError>;

    /// Put the task back in `pending` below every other pending task.
    async fn requeue_at_bottom(&self, task_id: i64) -> Result<bool, RepoError>;

    /// Return an abandoned task to `pending`, clearing its worker
    /// assignment and start time.
    async fn release(&self, task_id: i64) -> Result<bool, RepoError>;

    async fn assign_worker(&self, task_id: i64, worker_id: &str) -> Result<(), RepoError>;

    async fn max_priority(&self) -> Result<i64, RepoError>;
}

pub struct DbTaskRepo {
    db_pool: Arc<Pool<Sqlite>>,
}

impl DbTaskRepo {
    pub fn new(db_pool: Arc<Pool<Sqlite>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl TaskRepo for DbTaskRepo {
    async fn create(
        &self,
        abspath: &str,
        task_type: &str,
        library_id: i64,
    ) -> Result<TaskRecord, RepoError> {
        sqlx::query_as::<_, TaskRecord>(&format!(
            "INSERT INTO tasks (abspath, type, status, library_id) \
             VALUES ($1, $2, 'creating', $3) RETURNING {TASK_COLUMNS}"
        ))
        .bind(abspath)
        .bind(task_type)
        .bind(library_id)
        .fetch_one(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn get(&self, task_id: i64) -> Result<Option<TaskRecord>, RepoError> {
        sqlx::query_as::<_, TaskRecord>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"
        ))
        .bind(task_id)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn get_by_abspath(&self, abspath: &str) -> Result<Option<TaskRecord>, RepoError> {
        sqlx::query_as::<_, TaskRecord>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE abspath = $1"
        ))
        .bind(abspath)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn update(&self, record: &TaskRecord) -> Result<(), RepoError> {
        sqlx::query(
            "UPDATE tasks \
             SET abspath = $2, library_id = $3, type = $4, status = $5, priority = $6, \
                 cache_path = $7, success = $8, start_time = $9, finish_time = $10, \
                 processed_by_worker = $11, log = $12 \
             WHERE id = $1",
        )
        .bind(record.id)
        .bind(record.abspath.clone())
        .bind(record.library_id)
        .bind(record.task_type.clone())
        .bind(record.status.clone())
        .bind(record.priority)
        .bind(record.cache_path.clone())
        .bind(record.success)
        .bind(record.start_time)
        .bind(record.finish_time)
        .bind(record.processed_by_worker.clone())
        .bind(record.log.clone())
        .execute(self.db_pool.deref())
        .await?;

        Ok(())
    }

    async fn delete(&self, task_id: i64) -> Result<bool, RepoError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(task_id)
            .execute(self.db_pool.deref())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_by_status(
        &self,
        status: &str,
        limit: Option<i64>,
    ) -> Result<Vec<TaskRecord>, RepoError> {
        let limit = limit.unwrap_or(-1);
        sqlx::query_as::<_, TaskRecord>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = $1 \
             ORDER BY priority DESC, id ASC LIMIT $2"
        ))
        .bind(status)
        .bind(limit)
        .fetch_all(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn count_by_status(&self, status: &str) -> Result<i64, RepoError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM tasks WHERE status = $1")
            .bind(status)
            .fetch_one(self.db_pool.deref())
            .await?;
        Ok(row.get::<i64, _>("count"))
    }

    async fn claim_next_pending(
        &self,
        now: f64,
        local_only: bool,
        library_names: Option<&[String]>,
        library_tags: Option<&[String]>,
    ) -> Result<Option<TaskRecord>, RepoError> {
        if let Some(names) = library_names {
            // An explicit empty name list can never match anything.
            if names.is_empty() {
                return Ok(None);
            }
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE tasks SET status = 'in_progress', start_time = ");
        builder.push_bind(now);
        builder.push(
            " WHERE id = (SELECT tasks.id FROM tasks \
             JOIN libraries ON libraries.id = tasks.library_id",
        );
        if library_tags.is_some() {
            builder.push(
                " LEFT JOIN library_tags ON library_tags.library_id = libraries.id \
                 LEFT JOIN tags ON tags.id = library_tags.tag_id",
            );
        }
        builder.push(" WHERE tasks.status = 'pending'");
        if local_only {
            builder.push(" AND tasks.type = 'local'");
        }
        if let Some(names) = library_names {
            builder.push(" AND libraries.name IN (");
            {
                let mut separated = builder.separated(", ");
                for name in names {
                    separated.push_bind(name.clone());
                }
            }
            builder.push(")");
        }
        if let Some(tags) = library_tags {
            if tags.is_empty() {
                builder.push(" AND tags.id IS NULL");
            } else {
                builder.push(" AND tags.name IN (");
                {
                    let mut separated = builder.separated(", ");
                    for tag in tags {
                        separated.push_bind(tag.clone());
                    }
                }
                builder.push(")");
            }
        }
        builder.push(&format!(
            " GROUP BY tasks.id ORDER BY tasks.priority DESC, tasks.id ASC LIMIT 1) \
             AND status = 'pending' RETURNING {TASK_COLUMNS}"
        ));

        builder
            .build_query_as::<TaskRecord>()
            .fetch_optional(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn claim_task(&self, task_id: i64, now: f64) -> Result<Option<TaskRecord>, RepoError> {
        sqlx::query_as::<_, TaskRecord>(&format!(
            "UPDATE tasks SET status = 'in_progress', start_time = $2 \
             WHERE id = $1 AND status = 'pending' RETURNING {TASK_COLUMNS}"
        ))
        .bind(task_id)
        .bind(now)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn next_processed(&self) -> Result<Option<TaskRecord>, RepoError> {
        sqlx::query_as::<_, TaskRecord>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'processed' \
             ORDER BY priority DESC, id ASC LIMIT 1"
        ))
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn mark_processed(
        &self,
        task_id: i64,
        now: f64,
    ) -> Result<Option<TaskRecord>, RepoError> {
        sqlx::query_as::<_, TaskRecord>(&format!(
            "UPDATE tasks SET status = 'processed', finish_time = $2 \
             WHERE id = $1 AND status = 'in_progress' RETURNING {TASK_COLUMNS}"
        ))
        .bind(task_id)
        .bind(now)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn requeue_at_bottom(&self, task_id: i64) -> Result<bool, RepoError> {
        let mut tx = self.db_pool.begin().await?;

        let row = sqlx::query("SELECT MIN(priority) AS min FROM tasks WHERE status = 'pending'")
            .fetch_one(&mut *tx)
            .await?;
        let new_priority = row.get::<Option<i64>, _>("min").map(|p| p - 1).unwrap_or(0);

        let result = sqlx::query(
            "UPDATE tasks \
             SET status = 'pending', priority = $2, start_time = NULL, \
                 processed_by_worker = NULL \
             WHERE id = $1",
        )
        .bind(task_id)
        .bind(new_priority)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, task_id: i64) -> Result<bool, RepoError> {
        let result = sqlx::query(
            "UPDATE tasks \
             SET status = 'pending', start_time = NULL, processed_by_worker = NULL \
             WHERE id = $1 AND status = 'in_progress'",
        )
        .bind(task_id)
        .execute(self.db_pool.deref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn assign_worker(&self, task_id: i64, worker_id: &str) -> Result<(), RepoError> {
        sqlx::query("UPDATE tasks SET processed_by_worker = $2 WHERE id = $1")
            .bind(task_id)
            .bind(worker_id)
            .execute(self.db_pool.deref())
            .await?;
        Ok(())
    }

    async fn max_priority(&self) -> Result<i64, RepoError> {
        let row = sqlx::query("SELECT MAX(priority) AS max FROM tasks")
            .fetch_one(self.db_pool.deref())
            .await?;
        Ok(row.get::<Option<i64>, _>("max").unwrap_or(0))
    }
}
