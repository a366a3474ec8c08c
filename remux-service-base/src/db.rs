use remux_common::config::DbSqliteConfig;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Connection, Pool, Sqlite, SqliteConnection};
use std::error::Error;
use tracing::info;

pub static MIGRATIONS: Migrator = sqlx::migrate!("db/migration/sqlite");

pub fn sqlite_connect_options(config: &DbSqliteConfig) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(std::path::Path::new(config.database.as_str()))
        .create_if_missing(true)
}

pub async fn create_sqlite_pool(config: &DbSqliteConfig) -> Result<Pool<Sqlite>, Box<dyn Error>> {
    info!("DB Pool: sqlite://{}", config.database);
    let conn_options = sqlite_connect_options(config);

    SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(conn_options)
        .await
        .map_err(|e| e.into())
}

pub async fn sqlite_migrate(config: &DbSqliteConfig) -> Result<(), Box<dyn Error>> {
    info!("DB migration: sqlite://{}", config.database);
    let conn_options = sqlite_connect_options(config);
    let mut conn = SqliteConnection::connect_with(&conn_options).await?;
    MIGRATIONS.run(&mut conn).await?;
    let _ = conn.close().await;
    Ok(())
}

/// An isolated in-memory database with the full schema applied. Test-only.
pub async fn in_memory_pool() -> Pool<Sqlite> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to open in-memory sqlite");
    MIGRATIONS
        .run(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}
