use lazy_static::lazy_static;
use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, Object, OpenApi};
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::api::ApiTags;
use crate::config::OrchestratorConfig;
use crate::VERSION;

lazy_static! {
    static ref APP_START: Instant = Instant::now();
}

#[derive(Debug, Clone, PartialEq, Eq, Object)]
pub struct ComponentHealth {
    /// healthy | degraded | unhealthy
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, Object)]
pub struct HealthResponse {
    /// healthy | degraded | unhealthy
    pub status: String,
    pub version: String,
    pub uptime_seconds: i64,
    pub components: HashMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Object)]
pub struct LivenessResponse {
    pub status: String,
}

#[derive(Debug, Clone, Object)]
pub struct ReadinessResponse {
    pub status: String,
    pub reason: Option<String>,
}

#[derive(ApiResponse)]
pub enum HealthApiResponse {
    #[oai(status = 200)]
    Ok(Json<HealthResponse>),
    #[oai(status = 503)]
    Unhealthy(Json<HealthResponse>),
}

#[derive(ApiResponse)]
pub enum ReadinessApiResponse {
    #[oai(status = 200)]
    Ready(Json<ReadinessResponse>),
    #[oai(status = 503)]
    NotReady(Json<ReadinessResponse>),
}

pub struct HealthcheckApi {
    pub db_pool: Arc<Pool<Sqlite>>,
    pub config: Arc<OrchestratorConfig>,
}

impl HealthcheckApi {
    async fn check_database(&self) -> ComponentHealth {
        match sqlx::query("SELECT 1").execute(self.db_pool.as_ref()).await {
            Ok(_) => ComponentHealth {
                status: "healthy".to_string(),
                message: "OK".to_string(),
            },
            Err(error) => ComponentHealth {
                status: "unhealthy".to_string(),
                message: error.to_string(),
            },
        }
    }

    fn check_directory(path: &Path, missing_is_unhealthy: bool) -> ComponentHealth {
        if !path.exists() {
            return ComponentHealth {
                status: if missing_is_unhealthy {
                    "unhealthy"
                } else {
                    "degraded"
                }
                .to_string(),
                message: format!("Path not found: {}", path.display()),
            };
        }
        match std::fs::metadata(path) {
            Ok(metadata) if metadata.permissions().readonly() => ComponentHealth {
                status: "degraded".to_string(),
                message: format!("Path not writable: {}", path.display()),
            },
            Ok(_) => ComponentHealth {
                status: "healthy".to_string(),
                message: "OK".to_string(),
            },
            Err(error) => ComponentHealth {
                status: "degraded".to_string(),
                message: error.to_string(),
            },
        }
    }
}

#[OpenApi(prefix_path = "/", tag = ApiTags::HealthCheck)]
impl HealthcheckApi {
    /// Full component health
    #[oai(path = "/health", method = "get", operation_id = "health")]
    async fn health(&self) -> HealthApiResponse {
        let mut components = HashMap::new();
        let mut overall = "healthy";

        let database = self.check_database().await;
        let config = Self::check_directory(&self.config.config_path, true);
        let cache = Self::check_directory(&self.config.cache_path, false);

        for component in [&database, &config, &cache] {
            match component.status.as_str() {
                "unhealthy" => overall = "unhealthy",
                "degraded" if overall == "healthy" => overall = "degraded",
                _ => {}
            }
        }

        components.insert("database".to_string(), database);
        components.insert("config".to_string(), config);
        components.insert("cache".to_string(), cache);

        let response = HealthResponse {
            status: overall.to_string(),
            version: VERSION.to_string(),
            uptime_seconds: APP_START.elapsed().as_secs() as i64,
            components,
        };

        if overall == "unhealthy" {
            HealthApiResponse::Unhealthy(Json(response))
        } else {
            HealthApiResponse::Ok(Json(response))
        }
    }

    /// Liveness probe
    #[oai(path = "/health/live", method = "get", operation_id = "health_live")]
    async fn liveness(&self) -> Json<LivenessResponse> {
        Json(LivenessResponse {
            status: "alive".to_string(),
        })
    }

    /// Readiness probe
    #[oai(path = "/health/ready", method = "get", operation_id = "health_ready")]
    async fn readiness(&self) -> ReadinessApiResponse {
        let database = self.check_database().await;
        if database.status != "healthy" {
            return ReadinessApiResponse::NotReady(Json(ReadinessResponse {
                status: "not_ready".to_string(),
                reason: Some(database.message),
            }));
        }
        ReadinessApiResponse::Ready(Json(ReadinessResponse {
            status: "ready".to_string(),
            reason: None,
        }))
    }
}
