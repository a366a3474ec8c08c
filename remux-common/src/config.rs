use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Loads a service configuration by layering, in increasing precedence:
/// struct defaults, a TOML config file, then `REMUX__`-prefixed environment
/// variables (`__` separates nesting levels, e.g. `REMUX__DB__DATABASE`).
pub struct ConfigLoader<T> {
    pub config_file_name: PathBuf,
    phantom: PhantomData<T>,
}

impl<T: DeserializeOwned + Serialize + Default> ConfigLoader<T> {
    pub fn new(config_file_name: &Path) -> ConfigLoader<T> {
        ConfigLoader {
            config_file_name: config_file_name.to_path_buf(),
            phantom: PhantomData,
        }
    }

    pub fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file_name))
            .merge(Env::prefixed("REMUX__").split("__").lowercase(true))
    }

    pub fn load(&self) -> figment::Result<T> {
        self.figment().extract()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbSqliteConfig {
    pub database: String,
    pub max_connections: u32,
}

impl Default for DbSqliteConfig {
    fn default() -> Self {
        Self {
            database: "remux.db".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub database: i64,
    pub password: Option<String>,
    pub key_prefix: String,
}

impl RedisConfig {
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.database
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            database: 0,
            password: None,
            key_prefix: "remux".to_string(),
        }
    }
}

/// Which task-queue backend dispatches tasks. Sqlite is always the source
/// of truth for persistence; the redis backend is a fast priority index
/// layered over the same rows.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QueueBackendConfig {
    Sqlite,
    Redis(RedisConfig),
}

impl Default for QueueBackendConfig {
    fn default() -> Self {
        QueueBackendConfig::Sqlite
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    struct TestConfig {
        db: DbSqliteConfig,
        queue: QueueBackendConfig,
    }

    #[test]
    fn defaults_load_without_a_config_file() {
        let loader: ConfigLoader<TestConfig> =
            ConfigLoader::new(Path::new("does-not-exist.toml"));
        let config = loader.load().expect("Failed to load config");
        assert_eq!(config.db.max_connections, 10);
        assert!(matches!(config.queue, QueueBackendConfig::Sqlite));
    }

    #[test]
    fn redis_url_includes_password_when_set() {
        let mut config = RedisConfig::default();
        assert_eq!(config.url(), "redis://localhost:6379/0");
        config.password = Some("secret".to_string());
        assert_eq!(config.url(), "redis://:secret@localhost:6379/0");
    }
}
