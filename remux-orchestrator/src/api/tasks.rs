use poem_openapi::param::Path;
use poem_openapi::payload::Json;
use poem_openapi::{Object, OpenApi};
use remux_common::model::WorkerRole;
use remux_service_base::queue::TaskQueue;
use std::sync::Arc;
use tracing::info;

use crate::api::{ApiError, ApiResult, ApiTags};
use crate::auth::WorkerAuthService;
use crate::task::{DistributedTaskStatus, TaskManager};

#[derive(Debug, Clone, Object)]
pub struct ClaimTaskRequest {
    pub worker_id: String,
    #[oai(default)]
    pub capabilities: Vec<String>,
    #[oai(default = "default_max_tasks")]
    pub max_tasks: i64,
}

fn default_max_tasks() -> i64 {
    1
}

#[derive(Debug, Clone, Object)]
pub struct ClaimedTask {
    pub task_id: i64,
    pub source_file: String,
    pub cache_path: String,
    pub settings: TaskSettings,
}

#[derive(Debug, Clone, Object)]
pub struct TaskSettings {
    pub library_id: i64,
    pub priority: i64,
}

#[derive(Debug, Clone, Object)]
pub struct ClaimTaskResponse {
    pub success: bool,
    pub task: Option<ClaimedTask>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Object)]
pub struct TaskStatusRequest {
    pub worker_id: String,
    /// One of `processing`, `completed`, `failed`.
    pub status: String,
    pub progress: Option<f64>,
    pub message: Option<String>,
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Object)]
pub struct TaskStatusResponse {
    pub success: bool,
    pub message: String,
}

pub struct TasksApi {
    pub auth_service: Arc<WorkerAuthService>,
    pub task_manager: Arc<TaskManager>,
    pub queue: Arc<dyn TaskQueue>,
}

#[OpenApi(prefix_path = "/api/v2/tasks", tag = ApiTags::Tasks)]
impl TasksApi {
    /// Claim the next pending task
    ///
    /// Atomically claims the highest-priority pending task for the calling
    /// worker. Returns `task: null` when the queue is empty.
    #[oai(path = "/claim", method = "post", operation_id = "claim_task")]
    async fn claim(
        &self,
        request: Json<ClaimTaskRequest>,
        token: crate::api::WorkerTokenScheme,
    ) -> ApiResult<Json<ClaimTaskResponse>> {
        self.auth_service
            .validate_token_with_roles(&token.0, &[WorkerRole::Worker, WorkerRole::Admin])?;

        let Some(task) = self.queue.get_next_pending_task(false, None, None).await? else {
            return Ok(Json(ClaimTaskResponse {
                success: true,
                task: None,
                message: Some("No tasks available".to_string()),
            }));
        };

        self.task_manager
            .assign_worker(task.id, &request.0.worker_id)
            .await?;
        info!(
            task_id = task.id,
            worker_id = %request.0.worker_id,
            "Task claimed by distributed worker"
        );

        Ok(Json(ClaimTaskResponse {
            success: true,
            task: Some(ClaimedTask {
                task_id: task.id,
                source_file: task.abspath.clone(),
                cache_path: task.cache_path.clone().unwrap_or_default(),
                settings: TaskSettings {
                    library_id: task.library_id,
                    priority: task.priority,
                },
            }),
            message: None,
        }))
    }

    /// Report the status of a claimed task
    #[oai(
        path = "/:task_id/status",
        method = "post",
        operation_id = "update_task_status"
    )]
    async fn update_status(
        &self,
        task_id: Path<i64>,
        request: Json<TaskStatusRequest>,
        token: crate::api::WorkerTokenScheme,
    ) -> ApiResult<Json<TaskStatusResponse>> {
        self.auth_service
            .validate_token_with_roles(&token.0, &[WorkerRole::Worker, WorkerRole::Admin])?;

        let status = match request.0.status.as_str() {
            "processing" => DistributedTaskStatus::Processing {
                progress: request.0.progress,
            },
            "completed" => DistributedTaskStatus::Completed,
            "failed" => DistributedTaskStatus::Failed {
                message: request.0.message.clone().unwrap_or_default(),
            },
            other => {
                return Err(ApiError::bad_request(format!(
                    "Invalid status '{other}'. Must be one of: processing, completed, failed"
                )))
            }
        };

        self.task_manager
            .apply_distributed_status(task_id.0, status)
            .await?;
        info!(
            task_id = task_id.0,
            worker_id = %request.0.worker_id,
            status = %request.0.status,
            "Task status updated by distributed worker"
        );

        Ok(Json(TaskStatusResponse {
            success: true,
            message: format!("Task {} status updated to {}", task_id.0, request.0.status),
        }))
    }
}
