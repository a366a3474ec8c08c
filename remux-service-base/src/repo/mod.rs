use remux_common::SafeDisplay;

pub mod library;
pub mod settings;
pub mod task;
pub mod worker_group;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("Database error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for RepoError {
    fn from(error: sqlx::Error) -> Self {
        RepoError::Internal(error.to_string())
    }
}

impl SafeDisplay for RepoError {
    fn to_safe_string(&self) -> String {
        match self {
            RepoError::Internal(_) => "Internal repository error".to_string(),
        }
    }
}
