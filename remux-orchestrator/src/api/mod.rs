use poem_openapi::auth::Bearer;
use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, Object, OpenApiService, SecurityScheme, Tags};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::AuthError;
use crate::bootstrap::Services;
use crate::task::TaskError;
use remux_common::SafeDisplay;
use remux_service_base::queue::QueueError;

pub mod healthcheck;
pub mod tasks;
pub mod workers;

#[derive(Tags)]
pub enum ApiTags {
    Workers,
    Tasks,
    HealthCheck,
}

/// Bearer token carried by distributed workers. Validation (signature,
/// expiry, revocation, role) happens in the handlers so each failure mode
/// maps to its own response.
#[derive(SecurityScheme)]
#[oai(rename = "WorkerToken", ty = "bearer", checker = "bearer_checker")]
pub struct WorkerTokenScheme(pub String);

async fn bearer_checker(_: &poem::Request, bearer: Bearer) -> Option<String> {
    Some(bearer.token)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

#[derive(ApiResponse, Debug, Clone)]
pub enum ApiError {
    #[oai(status = 400)]
    BadRequest(Json<ErrorResponse>),
    #[oai(status = 401)]
    Unauthorized(Json<ErrorResponse>),
    #[oai(status = 403)]
    Forbidden(Json<ErrorResponse>),
    #[oai(status = 404)]
    NotFound(Json<ErrorResponse>),
    #[oai(status = 409)]
    Conflict(Json<ErrorResponse>),
    #[oai(status = 500)]
    InternalError(Json<ErrorResponse>),
}

impl ApiError {
    pub fn bad_request(error: impl Into<String>) -> Self {
        ApiError::BadRequest(Json(ErrorResponse::new(error)))
    }

    pub fn not_found(error: impl Into<String>) -> Self {
        ApiError::NotFound(Json(ErrorResponse::new(error)))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<AuthError> for ApiError {
    fn from(value: AuthError) -> Self {
        match value {
            AuthError::Invalid(_)
            | AuthError::Expired
            | AuthError::NotRegistered(_)
            | AuthError::Inactive(_) => {
                ApiError::Unauthorized(Json(ErrorResponse::new(value.to_safe_string())))
            }
            AuthError::InsufficientRole => {
                ApiError::Forbidden(Json(ErrorResponse::new(value.to_safe_string())))
            }
            AuthError::Internal(_) => {
                ApiError::InternalError(Json(ErrorResponse::new(value.to_safe_string())))
            }
        }
    }
}

impl From<TaskError> for ApiError {
    fn from(value: TaskError) -> Self {
        match value {
            TaskError::NotFound(_) => {
                ApiError::NotFound(Json(ErrorResponse::new(value.to_safe_string())))
            }
            TaskError::InvalidStatus { .. } | TaskError::DuplicateAbspath(_) => {
                ApiError::Conflict(Json(ErrorResponse::new(value.to_safe_string())))
            }
            TaskError::MissingCachePath(_) | TaskError::LibraryNotFound(_) => {
                ApiError::BadRequest(Json(ErrorResponse::new(value.to_safe_string())))
            }
            TaskError::InternalRepoError(_)
            | TaskError::InternalQueueError(_)
            | TaskError::InternalConversionError(_) => {
                ApiError::InternalError(Json(ErrorResponse::new(value.to_safe_string())))
            }
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(value: QueueError) -> Self {
        match value {
            QueueError::TaskNotFound(_) => {
                ApiError::NotFound(Json(ErrorResponse::new(value.to_safe_string())))
            }
            QueueError::InvalidStatus { .. } => {
                ApiError::Conflict(Json(ErrorResponse::new(value.to_safe_string())))
            }
            _ => ApiError::InternalError(Json(ErrorResponse::new(value.to_safe_string()))),
        }
    }
}

pub type Apis = (
    workers::WorkersApi,
    tasks::TasksApi,
    healthcheck::HealthcheckApi,
);

pub fn make_open_api_service(services: &Services) -> OpenApiService<Apis, ()> {
    OpenApiService::new(
        (
            workers::WorkersApi {
                auth_service: services.auth_service.clone(),
            },
            tasks::TasksApi {
                auth_service: services.auth_service.clone(),
                task_manager: services.task_manager.clone(),
                queue: services.queue.clone(),
            },
            healthcheck::HealthcheckApi {
                db_pool: services.db_pool.clone(),
                config: Arc::new(services.config.clone()),
            },
        ),
        "Remux API",
        crate::VERSION,
    )
}
