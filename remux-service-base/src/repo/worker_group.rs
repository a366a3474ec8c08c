use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Pool, Row, Sqlite};

use crate::repo::RepoError;

#[derive(sqlx::FromRow, Debug, Clone, PartialEq)]
pub struct WorkerGroupRecord {
    pub id: i64,
    pub name: String,
    pub locked: bool,
    pub number_of_workers: i64,
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq)]
pub struct WorkerScheduleRecord {
    pub id: i64,
    pub worker_group_id: i64,
    pub repetition: String,
    pub schedule_time: String,
    pub schedule_task: String,
    pub schedule_worker_count: Option<i64>,
}

#[async_trait]
pub trait WorkerGroupRepo: Send + Sync {
    async fn create(
        &self,
        name: &str,
        number_of_workers: i64,
        locked: bool,
    ) -> Result<WorkerGroupRecord, RepoError>;

    async fn get(&self, group_id: i64) -> Result<Option<WorkerGroupRecord>, RepoError>;

    async fn get_all(&self) -> Result<Vec<WorkerGroupRecord>, RepoError>;

    async fn set_number_of_workers(&self, group_id: i64, count: i64) -> Result<(), RepoError>;

    async fn get_tags(&self, group_id: i64) -> Result<Vec<String>, RepoError>;

    async fn set_tags(&self, group_id: i64, tags: &[String]) -> Result<(), RepoError>;

    async fn get_schedules(&self, group_id: i64)
        -> Result<Vec<WorkerScheduleRecord>, RepoError>;

    /// Replace the full schedule set of a group in one transaction.
    async fn replace_schedules(
        &self,
        group_id: i64,
        schedules: &[(String, String, String, Option<i64>)],
    ) -> Result<(), RepoError>;

    /// Deleting a locked group is refused.
    async fn delete(&self, group_id: i64) -> Result<bool, RepoError>;
}

pub struct DbWorkerGroupRepo {
    db_pool: Arc<Pool<Sqlite>>,
}

impl DbWorkerGroupRepo {
    pub fn new(db_pool: Arc<Pool<Sqlite>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl WorkerGroupRepo for DbWorkerGroupRepo {
    async fn create(
        &self,
        name: &str,
        number_of_workers: i64,
        locked: bool,
    ) -> Result<WorkerGroupRecord, RepoError> {
        sqlx::query_as::<_, WorkerGroupRecord>(
            "INSERT INTO worker_groups (name, number_of_workers, locked) VALUES ($1, $2, $3) \
             RETURNING id, name, locked, number_of_workers",
        )
        .bind(name)
        .bind(number_of_workers)
        .bind(locked)
        .fetch_one(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn get(&self, group_id: i64) -> Result<Option<WorkerGroupRecord>, RepoError> {
        sqlx::query_as::<_, WorkerGroupRecord>(
            "SELECT id, name, locked, number_of_workers FROM worker_groups WHERE id = $1",
        )
        .bind(group_id)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn get_all(&self) -> Result<Vec<WorkerGroupRecord>, RepoError> {
        sqlx::query_as::<_, WorkerGroupRecord>(
            "SELECT id, name, locked, number_of_workers FROM worker_groups ORDER BY id ASC",
        )
        .fetch_all(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn set_number_of_workers(&self, group_id: i64, count: i64) -> Result<(), RepoError> {
        sqlx::query("UPDATE worker_groups SET number_of_workers = $2 WHERE id = $1")
            .bind(group_id)
            .bind(count)
            .execute(self.db_pool.deref())
            .await?;
        Ok(())
    }

    async fn get_tags(&self, group_id: i64) -> Result<Vec<String>, RepoError> {
        let rows = sqlx::query(
            "SELECT tag FROM worker_group_tags WHERE worker_group_id = $1 ORDER BY tag ASC",
        )
        .bind(group_id)
        .fetch_all(self.db_pool.deref())
        .await?;
        Ok(rows.iter().map(|row| row.get::<String, _>("tag")).collect())
    }

    async fn set_tags(&self, group_id: i64, tags: &[String]) -> Result<(), RepoError> {
        let mut tx = self.db_pool.begin().await?;

        sqlx::query("DELETE FROM worker_group_tags WHERE worker_group_id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;

        for tag in tags {
            sqlx::query("INSERT INTO worker_group_tags (worker_group_id, tag) VALUES ($1, $2)")
                .bind(group_id)
                .bind(tag)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_schedules(
        &self,
        group_id: i64,
    ) -> Result<Vec<WorkerScheduleRecord>, RepoError> {
        sqlx::query_as::<_, WorkerScheduleRecord>(
            "SELECT id, worker_group_id, repetition, schedule_time, schedule_task, \
             schedule_worker_count \
             FROM worker_event_schedules WHERE worker_group_id = $1 ORDER BY id ASC",
        )
        .bind(group_id)
        .fetch_all(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn replace_schedules(
        &self,
        group_id: i64,
        schedules: &[(String, String, String, Option<i64>)],
    ) -> Result<(), RepoError> {
        let mut tx = self.db_pool.begin().await?;

        sqlx::query("DELETE FROM worker_event_schedules WHERE worker_group_id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;

        for (repetition, schedule_time, schedule_task, schedule_worker_count) in schedules {
            sqlx::query(
                "INSERT INTO worker_event_schedules \
                 (worker_group_id, repetition, schedule_time, schedule_task, \
                  schedule_worker_count) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(group_id)
            .bind(repetition)
            .bind(schedule_time)
            .bind(schedule_task)
            .bind(schedule_worker_count)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, group_id: i64) -> Result<bool, RepoError> {
        let result = sqlx::query("DELETE FROM worker_groups WHERE id = $1 AND locked = 0")
            .bind(group_id)
            .execute(self.db_pool.deref())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
