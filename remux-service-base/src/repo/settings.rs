use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Pool, Row, Sqlite};

use crate::repo::RepoError;

/// Simple key/value settings persisted alongside the task tables. Holds
/// installation-scoped values such as the legacy scalar worker count and
/// linked-installation records.
#[async_trait]
pub trait SettingsRepo: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, RepoError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), RepoError>;

    async fn delete(&self, key: &str) -> Result<bool, RepoError>;
}

pub struct DbSettingsRepo {
    db_pool: Arc<Pool<Sqlite>>,
}

impl DbSettingsRepo {
    pub fn new(db_pool: Arc<Pool<Sqlite>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl SettingsRepo for DbSettingsRepo {
    async fn get(&self, key: &str) -> Result<Option<String>, RepoError> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = $1")
            .bind(key)
            .fetch_optional(self.db_pool.deref())
            .await?;
        Ok(row.map(|row| row.get::<String, _>("value")))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = $2",
        )
        .bind(key)
        .bind(value)
        .execute(self.db_pool.deref())
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, RepoError> {
        let result = sqlx::query("DELETE FROM settings WHERE key = $1")
            .bind(key)
            .execute(self.db_pool.deref())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
