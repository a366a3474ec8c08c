use poem_openapi::param::{Path, Query};
use poem_openapi::payload::Json;
use poem_openapi::{Object, OpenApi};
use remux_common::model::{WorkerInfo, WorkerRole};
use remux_common::time::unix_now;
use std::sync::Arc;
use tracing::info;

use crate::api::{ApiError, ApiResult, ApiTags, ErrorResponse, WorkerTokenScheme};
use crate::auth::WorkerAuthService;

#[derive(Debug, Clone, Object)]
pub struct RegisterWorkerRequest {
    pub name: String,
    pub hostname: String,
    #[oai(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Object)]
pub struct RegisterWorkerResponse {
    pub success: bool,
    pub worker_id: String,
    pub name: String,
    pub token: String,
}

#[derive(Debug, Clone, Object)]
pub struct IssueTokenRequest {
    pub worker_id: String,
    pub validity_seconds: Option<i64>,
}

#[derive(Debug, Clone, Object)]
pub struct TokenResponse {
    pub success: bool,
    pub token: String,
}

#[derive(Debug, Clone, Object)]
pub struct RevokeTokenRequest {
    pub token: String,
}

#[derive(Debug, Clone, Object)]
pub struct RevokeTokenResponse {
    pub success: bool,
    pub revoked: bool,
}

#[derive(Debug, Clone, Object)]
pub struct ListWorkersResponse {
    pub success: bool,
    pub workers: Vec<WorkerInfo>,
}

#[derive(Debug, Clone, Object)]
pub struct WorkerResponse {
    pub success: bool,
    pub worker: WorkerInfo,
}

#[derive(Debug, Clone, Object)]
pub struct UpdateWorkerRequest {
    pub name: Option<String>,
    pub roles: Option<Vec<WorkerRole>>,
    pub capabilities: Option<Vec<String>>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Object)]
pub struct DeleteWorkerResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Object)]
pub struct VerifyResponse {
    pub success: bool,
    pub worker_id: String,
    pub roles: Vec<WorkerRole>,
}

#[derive(Debug, Clone, Object)]
pub struct HeartbeatRequest {
    pub worker_id: String,
    #[oai(default)]
    pub status: Option<String>,
    #[oai(default)]
    pub current_tasks: Vec<i64>,
    pub system_info: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Object)]
pub struct HeartbeatResponse {
    pub success: bool,
    pub message: String,
    pub server_time: f64,
}

pub struct WorkersApi {
    pub auth_service: Arc<WorkerAuthService>,
}

#[OpenApi(prefix_path = "/api/v2/workers", tag = ApiTags::Workers)]
impl WorkersApi {
    /// Register a new worker
    ///
    /// Registration is open by design; front this endpoint with a reverse
    /// proxy when that matters operationally. Returns the worker id and an
    /// initial token.
    #[oai(path = "/register", method = "post", operation_id = "register_worker")]
    async fn register(
        &self,
        request: Json<RegisterWorkerRequest>,
    ) -> ApiResult<Json<RegisterWorkerResponse>> {
        let worker = self.auth_service.register_worker(
            &request.0.name,
            &request.0.hostname,
            request.0.capabilities,
        )?;
        let token = self.auth_service.generate_token(&worker.worker_id, None)?;
        Ok(Json(RegisterWorkerResponse {
            success: true,
            worker_id: worker.worker_id,
            name: worker.name,
            token,
        }))
    }

    /// Issue a token for a registered worker
    #[oai(path = "/token", method = "post", operation_id = "issue_token")]
    async fn issue_token(
        &self,
        request: Json<IssueTokenRequest>,
    ) -> ApiResult<Json<TokenResponse>> {
        let token = self
            .auth_service
            .generate_token(&request.0.worker_id, request.0.validity_seconds)?;
        Ok(Json(TokenResponse {
            success: true,
            token,
        }))
    }

    /// Exchange a valid token for a fresh one
    #[oai(
        path = "/token/refresh",
        method = "post",
        operation_id = "refresh_token"
    )]
    async fn refresh_token(&self, token: WorkerTokenScheme) -> ApiResult<Json<TokenResponse>> {
        let claims = self.auth_service.validate_token(&token.0)?;
        let fresh = self.auth_service.generate_token(&claims.sub, None)?;
        Ok(Json(TokenResponse {
            success: true,
            token: fresh,
        }))
    }

    /// Revoke a token
    #[oai(path = "/token/revoke", method = "post", operation_id = "revoke_token")]
    async fn revoke_token(
        &self,
        request: Json<RevokeTokenRequest>,
    ) -> ApiResult<Json<RevokeTokenResponse>> {
        let revoked = self.auth_service.revoke_token(&request.0.token)?;
        Ok(Json(RevokeTokenResponse {
            success: true,
            revoked,
        }))
    }

    /// List registered workers
    #[oai(path = "/list", method = "get", operation_id = "list_workers")]
    async fn list_workers(
        &self,
        active_only: Query<Option<bool>>,
    ) -> ApiResult<Json<ListWorkersResponse>> {
        let workers = self.auth_service.list_workers(active_only.0.unwrap_or(false));
        Ok(Json(ListWorkersResponse {
            success: true,
            workers,
        }))
    }

    /// Get one registered worker
    #[oai(path = "/:worker_id", method = "get", operation_id = "get_worker")]
    async fn get_worker(&self, worker_id: Path<String>) -> ApiResult<Json<WorkerResponse>> {
        let worker = self
            .auth_service
            .get_worker(&worker_id.0)
            .ok_or_else(|| ApiError::not_found(format!("Worker {} not found", worker_id.0)))?;
        Ok(Json(WorkerResponse {
            success: true,
            worker,
        }))
    }

    /// Update a registered worker
    #[oai(path = "/:worker_id", method = "put", operation_id = "update_worker")]
    async fn update_worker(
        &self,
        worker_id: Path<String>,
        request: Json<UpdateWorkerRequest>,
        token: WorkerTokenScheme,
    ) -> ApiResult<Json<WorkerResponse>> {
        self.auth_service
            .validate_token_with_roles(&token.0, &[WorkerRole::Worker, WorkerRole::Admin])?;
        let worker = self
            .auth_service
            .update_worker(
                &worker_id.0,
                request.0.name,
                request.0.roles,
                request.0.capabilities,
                request.0.active,
            )?
            .ok_or_else(|| ApiError::not_found(format!("Worker {} not found", worker_id.0)))?;
        Ok(Json(WorkerResponse {
            success: true,
            worker,
        }))
    }

    /// Unregister a worker
    #[oai(path = "/:worker_id", method = "delete", operation_id = "delete_worker")]
    async fn delete_worker(
        &self,
        worker_id: Path<String>,
        token: WorkerTokenScheme,
    ) -> ApiResult<Json<DeleteWorkerResponse>> {
        self.auth_service
            .validate_token_with_roles(&token.0, &[WorkerRole::Worker, WorkerRole::Admin])?;
        if !self.auth_service.unregister_worker(&worker_id.0)? {
            return Err(ApiError::not_found(format!(
                "Worker {} not found",
                worker_id.0
            )));
        }
        Ok(Json(DeleteWorkerResponse { success: true }))
    }

    /// Verify the presented token
    #[oai(path = "/verify", method = "get", operation_id = "verify_token")]
    async fn verify(&self, token: WorkerTokenScheme) -> ApiResult<Json<VerifyResponse>> {
        let claims = self.auth_service.validate_token(&token.0)?;
        Ok(Json(VerifyResponse {
            success: true,
            worker_id: claims.sub,
            roles: claims.roles,
        }))
    }

    /// Worker heartbeat
    ///
    /// Touches the worker's `last_seen` and persists the registry.
    #[oai(path = "/heartbeat", method = "post", operation_id = "worker_heartbeat")]
    async fn heartbeat(
        &self,
        request: Json<HeartbeatRequest>,
        token: WorkerTokenScheme,
    ) -> ApiResult<Json<HeartbeatResponse>> {
        self.auth_service
            .validate_token_with_roles(&token.0, &[WorkerRole::Worker, WorkerRole::Admin])?;
        match self.auth_service.heartbeat(&request.0.worker_id) {
            Ok(_) => {
                info!(worker_id = %request.0.worker_id, status = ?request.0.status, "Heartbeat received");
                Ok(Json(HeartbeatResponse {
                    success: true,
                    message: "Heartbeat received".to_string(),
                    server_time: unix_now(),
                }))
            }
            Err(crate::auth::AuthError::NotRegistered(worker_id)) => Err(ApiError::NotFound(
                Json(ErrorResponse::new(format!("Worker {worker_id} not registered"))),
            )),
            Err(error) => Err(error.into()),
        }
    }
}
