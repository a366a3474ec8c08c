use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Pool, Row, Sqlite};

use crate::repo::RepoError;

#[derive(sqlx::FromRow, Debug, Clone, PartialEq)]
pub struct LibraryRecord {
    pub id: i64,
    pub name: String,
    pub path: String,
    pub priority_score: i64,
}

#[async_trait]
pub trait LibraryRepo: Send + Sync {
    async fn create(
        &self,
        name: &str,
        path: &str,
        priority_score: i64,
    ) -> Result<LibraryRecord, RepoError>;

    async fn get(&self, library_id: i64) -> Result<Option<LibraryRecord>, RepoError>;

    async fn get_by_name(&self, name: &str) -> Result<Option<LibraryRecord>, RepoError>;

    async fn get_all(&self) -> Result<Vec<LibraryRecord>, RepoError>;

    async fn get_tags(&self, library_id: i64) -> Result<Vec<String>, RepoError>;

    /// Attach a tag, creating the tag row if it does not exist yet.
    async fn add_tag(&self, library_id: i64, tag: &str) -> Result<(), RepoError>;

    async fn delete(&self, library_id: i64) -> Result<bool, RepoError>;
}

pub struct DbLibraryRepo {
    db_pool: Arc<Pool<Sqlite>>,
}

impl DbLibraryRepo {
    pub fn new(db_pool: Arc<Pool<Sqlite>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl LibraryRepo for DbLibraryRepo {
    async fn create(
        &self,
        name: &str,
        path: &str,
        priority_score: i64,
    ) -> Result<LibraryRecord, RepoError> {
        sqlx::query_as::<_, LibraryRecord>(
            "INSERT INTO libraries (name, path, priority_score) VALUES ($1, $2, $3) \
             RETURNING id, name, path, priority_score",
        )
        .bind(name)
        .bind(path)
        .bind(priority_score)
        .fetch_one(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn get(&self, library_id: i64) -> Result<Option<LibraryRecord>, RepoError> {
        sqlx::query_as::<_, LibraryRecord>(
            "SELECT id, name, path, priority_score FROM libraries WHERE id = $1",
        )
        .bind(library_id)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<LibraryRecord>, RepoError> {
        sqlx::query_as::<_, LibraryRecord>(
            "SELECT id, name, path, priority_score FROM libraries WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn get_all(&self) -> Result<Vec<LibraryRecord>, RepoError> {
        sqlx::query_as::<_, LibraryRecord>(
            "SELECT id, name, path, priority_score FROM libraries ORDER BY id ASC",
        )
        .fetch_all(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn get_tags(&self, library_id: i64) -> Result<Vec<String>, RepoError> {
        let rows = sqlx::query(
            "SELECT tags.name AS name FROM tags \
             JOIN library_tags ON library_tags.tag_id = tags.id \
             WHERE library_tags.library_id = $1 ORDER BY tags.name ASC",
        )
        .bind(library_id)
        .fetch_all(self.db_pool.deref())
        .await?;
        Ok(rows.iter().map(|row| row.get::<String, _>("name")).collect())
    }

    async fn add_tag(&self, library_id: i64, tag: &str) -> Result<(), RepoError> {
        let mut tx = self.db_pool.begin().await?;

        sqlx::query("INSERT INTO tags (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(tag)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO library_tags (library_id, tag_id) \
             SELECT $1, id FROM tags WHERE name = $2 \
             ON CONFLICT (library_id, tag_id) DO NOTHING",
        )
        .bind(library_id)
        .bind(tag)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, library_id: i64) -> Result<bool, RepoError> {
        let result = sqlx::query("DELETE FROM libraries WHERE id = $1")
            .bind(library_id)
            .execute(self.db_pool.deref())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
