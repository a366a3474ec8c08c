use remux_common::config::{ConfigLoader, DbSqliteConfig, QueueBackendConfig};
use remux_common::model::GpuAllocationStrategy;
use remux_common::tracing::TracingConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub tracing: TracingConfig,
    pub http_port: u16,
    /// Directory holding the auth secret, worker registry and other
    /// installation-scoped files.
    pub config_path: PathBuf,
    /// Root directory for in-flight transcode artifacts.
    pub cache_path: PathBuf,
    pub db: DbSqliteConfig,
    pub queue: QueueBackendConfig,
    pub health_check: HealthCheckConfig,
    pub gpu: GpuConfig,
    pub cors_origin_regex: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("remux-orchestrator"),
            http_port: 8888,
            config_path: PathBuf::from(".remux/config"),
            cache_path: PathBuf::from("/tmp/remux"),
            db: DbSqliteConfig::default(),
            queue: QueueBackendConfig::default(),
            health_check: HealthCheckConfig::default(),
            gpu: GpuConfig::default(),
            cors_origin_regex: "https://*".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub run_pre_transcode_check: bool,
    pub run_post_transcode_check: bool,
    /// Abort the task when the pre-transcode check reports corruption.
    pub fail_on_pre_check_corruption: bool,
    /// Clamped to 30..=3600 seconds on use.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl HealthCheckConfig {
    pub fn clamped_timeout(&self) -> Duration {
        self.timeout
            .clamp(Duration::from_secs(30), Duration::from_secs(3600))
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            run_pre_transcode_check: false,
            run_post_transcode_check: false,
            fail_on_pre_check_corruption: true,
            timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GpuDeviceConfig {
    /// e.g. "cuda:0" or "vaapi:/dev/dri/renderD128"
    pub device_id: String,
    pub hwaccel_device: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GpuConfig {
    pub devices: Vec<GpuDeviceConfig>,
    pub max_workers_per_gpu: u32,
    pub strategy: GpuAllocationStrategy,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            devices: vec![],
            max_workers_per_gpu: 2,
            strategy: GpuAllocationStrategy::RoundRobin,
        }
    }
}

pub fn make_config_loader() -> ConfigLoader<OrchestratorConfig> {
    ConfigLoader::new(&PathBuf::from("config/orchestrator.toml"))
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use crate::config::make_config_loader;

    #[test]
    pub fn config_is_loadable() {
        make_config_loader().load().expect("Failed to load config");
    }

    #[test]
    pub fn health_check_timeout_is_clamped() {
        use super::HealthCheckConfig;
        use std::time::Duration;

        let mut config = HealthCheckConfig::default();
        config.timeout = Duration::from_secs(5);
        assert_eq!(config.clamped_timeout(), Duration::from_secs(30));
        config.timeout = Duration::from_secs(10_000);
        assert_eq!(config.clamped_timeout(), Duration::from_secs(3600));
        config.timeout = Duration::from_secs(300);
        assert_eq!(config.clamped_timeout(), Duration::from_secs(300));
    }
}
