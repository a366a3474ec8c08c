use poem::test::TestClient;
use poem::Route;
use remux_common::config::{DbSqliteConfig, QueueBackendConfig};
use remux_common::model::{TaskType, WorkerRole};
use remux_orchestrator::api::make_open_api_service;
use remux_orchestrator::bootstrap::Services;
use remux_orchestrator::config::OrchestratorConfig;
use remux_service_base::db;
use remux_service_base::repo::library::LibraryRepo;
use serde_json::json;

struct Fixture {
    services: Services,
    _dirs: (tempfile::TempDir, tempfile::TempDir),
}

async fn fixture() -> Fixture {
    let config_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();

    let config = OrchestratorConfig {
        config_path: config_dir.path().to_path_buf(),
        cache_path: cache_dir.path().to_path_buf(),
        db: DbSqliteConfig {
            database: config_dir
                .path()
                .join("remux.db")
                .to_string_lossy()
                .to_string(),
            max_connections: 1,
        },
        queue: QueueBackendConfig::Sqlite,
        ..OrchestratorConfig::default()
    };
    db::sqlite_migrate(&config.db).await.unwrap();

    let services = Services::new(&config).await.unwrap();
    Fixture {
        services,
        _dirs: (config_dir, cache_dir),
    }
}

fn client(fixture: &Fixture) -> TestClient<Route> {
    TestClient::new(Route::new().nest("/", make_open_api_service(&fixture.services)))
}

async fn register_worker(client: &TestClient<Route>, name: &str) -> (String, String) {
    let response = client
        .post("/api/v2/workers/register")
        .body_json(&json!({"name": name, "hostname": "test-host", "capabilities": ["hevc"]}))
        .send()
        .await;
    response.assert_status_is_ok();
    let body = response.json().await;
    let object = body.value().object();
    assert!(object.get("success").bool());
    (
        object.get("worker_id").string().to_string(),
        object.get("token").string().to_string(),
    )
}

#[tokio::test]
async fn token_lifecycle_register_validate_revoke_expire() {
    let fixture = fixture().await;
    let client = client(&fixture);

    let (worker_id, token0) = register_worker(&client, "W1").await;

    // The initial token verifies.
    let response = client
        .get("/api/v2/workers/verify")
        .header("Authorization", format!("Bearer {token0}"))
        .send()
        .await;
    response.assert_status_is_ok();
    let body = response.json().await;
    assert_eq!(body.value().object().get("worker_id").string(), worker_id);

    // Revoked tokens fail as invalid.
    let response = client
        .post("/api/v2/workers/token/revoke")
        .body_json(&json!({"token": token0}))
        .send()
        .await;
    response.assert_status_is_ok();
    let response = client
        .get("/api/v2/workers/verify")
        .header("Authorization", format!("Bearer {token0}"))
        .send()
        .await;
    response.assert_status(http::StatusCode::UNAUTHORIZED);
    let body = response.json().await;
    let error = body.value().object().get("error").string().to_string();
    assert!(error.contains("revoked"), "unexpected error: {error}");

    // A token issued already past its validity fails as expired.
    let response = client
        .post("/api/v2/workers/token")
        .body_json(&json!({"worker_id": worker_id, "validity_seconds": -20}))
        .send()
        .await;
    response.assert_status_is_ok();
    let body = response.json().await;
    let expired_token = body.value().object().get("token").string().to_string();

    let response = client
        .get("/api/v2/workers/verify")
        .header("Authorization", format!("Bearer {expired_token}"))
        .send()
        .await;
    response.assert_status(http::StatusCode::UNAUTHORIZED);
    let body = response.json().await;
    let error = body.value().object().get("error").string().to_string();
    assert!(error.contains("expired"), "unexpected error: {error}");
}

#[tokio::test]
async fn missing_token_yields_401_and_wrong_role_403() {
    let fixture = fixture().await;
    let client = client(&fixture);

    // No bearer token at all.
    let response = client
        .post("/api/v2/tasks/claim")
        .body_json(&json!({"worker_id": "whoever"}))
        .send()
        .await;
    response.assert_status(http::StatusCode::UNAUTHORIZED);

    // Authenticated but readonly.
    let (worker_id, _token) = register_worker(&client, "RO").await;
    fixture
        .services
        .auth_service
        .update_worker(
            &worker_id,
            None,
            Some(vec![WorkerRole::Readonly]),
            None,
            None,
        )
        .unwrap();
    let readonly_token = fixture
        .services
        .auth_service
        .generate_token(&worker_id, None)
        .unwrap();

    let response = client
        .post("/api/v2/tasks/claim")
        .header("Authorization", format!("Bearer {readonly_token}"))
        .body_json(&json!({"worker_id": worker_id}))
        .send()
        .await;
    response.assert_status(http::StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn claim_returns_null_on_empty_queue_and_a_projection_otherwise() {
    let fixture = fixture().await;
    let client = client(&fixture);
    let (worker_id, token) = register_worker(&client, "W1").await;

    let response = client
        .post("/api/v2/tasks/claim")
        .header("Authorization", format!("Bearer {token}"))
        .body_json(&json!({"worker_id": worker_id, "capabilities": [], "max_tasks": 1}))
        .send()
        .await;
    response.assert_status_is_ok();
    let body = response.json().await;
    assert_eq!(
        body.value().object().get("message").string(),
        "No tasks available"
    );

    // Seed one pending task and claim it.
    fixture
        .services
        .library_repo
        .create("Movies", "/library", 0)
        .await
        .unwrap();
    let record = fixture
        .services
        .task_manager
        .create_task("/library/A.mkv", TaskType::Local, 1, 0)
        .await
        .unwrap();

    let response = client
        .post("/api/v2/tasks/claim")
        .header("Authorization", format!("Bearer {token}"))
        .body_json(&json!({"worker_id": worker_id, "capabilities": [], "max_tasks": 1}))
        .send()
        .await;
    response.assert_status_is_ok();
    let body = response.json().await;
    let task = body.value().object().get("task").object();
    assert_eq!(task.get("task_id").i64(), record.id);
    assert_eq!(task.get("source_file").string(), "/library/A.mkv");

    let stored = fixture
        .services
        .task_manager
        .get_task(record.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, "in_progress");
    assert_eq!(stored.processed_by_worker.as_deref(), Some(worker_id.as_str()));
}

#[tokio::test]
async fn status_updates_transition_claimed_tasks() {
    let fixture = fixture().await;
    let client = client(&fixture);
    let (worker_id, token) = register_worker(&client, "W1").await;

    fixture
        .services
        .library_repo
        .create("Movies", "/library", 0)
        .await
        .unwrap();
    let record = fixture
        .services
        .task_manager
        .create_task("/library/A.mkv", TaskType::Local, 1, 0)
        .await
        .unwrap();
    client
        .post("/api/v2/tasks/claim")
        .header("Authorization", format!("Bearer {token}"))
        .body_json(&json!({"worker_id": worker_id}))
        .send()
        .await
        .assert_status_is_ok();

    // Invalid status values are rejected.
    let response = client
        .post(format!("/api/v2/tasks/{}/status", record.id))
        .header("Authorization", format!("Bearer {token}"))
        .body_json(&json!({"worker_id": worker_id, "status": "sideways"}))
        .send()
        .await;
    response.assert_status(http::StatusCode::BAD_REQUEST);

    let response = client
        .post(format!("/api/v2/tasks/{}/status", record.id))
        .header("Authorization", format!("Bearer {token}"))
        .body_json(&json!({
            "worker_id": worker_id,
            "status": "completed",
            "progress": 100.0,
            "result": {"size": 123},
        }))
        .send()
        .await;
    response.assert_status_is_ok();

    let stored = fixture
        .services
        .task_manager
        .get_task(record.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, "complete");
    assert!(stored.success);
    assert!(stored.finish_time.is_some());
}

#[tokio::test]
async fn failed_status_records_the_error() {
    let fixture = fixture().await;
    let client = client(&fixture);
    let (worker_id, token) = register_worker(&client, "W1").await;

    fixture
        .services
        .library_repo
        .create("Movies", "/library", 0)
        .await
        .unwrap();
    let record = fixture
        .services
        .task_manager
        .create_task("/library/A.mkv", TaskType::Local, 1, 0)
        .await
        .unwrap();

    let response = client
        .post(format!("/api/v2/tasks/{}/status", record.id))
        .header("Authorization", format!("Bearer {token}"))
        .body_json(&json!({
            "worker_id": worker_id,
            "status": "failed",
            "message": "encoder crashed",
        }))
        .send()
        .await;
    response.assert_status_is_ok();

    let stored = fixture
        .services
        .task_manager
        .get_task(record.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, "failed");
    assert!(!stored.success);
    assert!(stored.log.contains("encoder crashed"));
}

#[tokio::test]
async fn worker_registry_crud_over_http() {
    let fixture = fixture().await;
    let client = client(&fixture);
    let (worker_id, token) = register_worker(&client, "W1").await;

    let response = client.get("/api/v2/workers/list").send().await;
    response.assert_status_is_ok();
    let body = response.json().await;
    assert_eq!(body.value().object().get("workers").array().len(), 1);

    let response = client
        .put(format!("/api/v2/workers/{worker_id}"))
        .header("Authorization", format!("Bearer {token}"))
        .body_json(&json!({"name": "renamed", "active": false}))
        .send()
        .await;
    response.assert_status_is_ok();
    let body = response.json().await;
    let worker = body.value().object().get("worker").object();
    assert_eq!(worker.get("name").string(), "renamed");
    assert!(!worker.get("active").bool());

    // Inactive workers disappear from the active-only listing.
    let response = client
        .get("/api/v2/workers/list?active_only=true")
        .send()
        .await;
    response.assert_status_is_ok();
    let body = response.json().await;
    assert_eq!(body.value().object().get("workers").array().len(), 0);
}

#[tokio::test]
async fn heartbeat_touches_last_seen() {
    let fixture = fixture().await;
    let client = client(&fixture);
    let (worker_id, token) = register_worker(&client, "W1").await;

    let before = fixture
        .services
        .auth_service
        .get_worker(&worker_id)
        .unwrap()
        .last_seen;

    let response = client
        .post("/api/v2/workers/heartbeat")
        .header("Authorization", format!("Bearer {token}"))
        .body_json(&json!({
            "worker_id": worker_id,
            "status": "idle",
            "current_tasks": [],
            "system_info": {"cpu_usage": 12.5},
        }))
        .send()
        .await;
    response.assert_status_is_ok();

    let after = fixture
        .services
        .auth_service
        .get_worker(&worker_id)
        .unwrap()
        .last_seen;
    assert!(after >= before);
}

#[tokio::test]
async fn health_endpoints_report_component_status() {
    let fixture = fixture().await;
    let client = client(&fixture);

    let response = client.get("/health").send().await;
    response.assert_status_is_ok();
    let body = response.json().await;
    let object = body.value().object();
    assert_eq!(object.get("status").string(), "healthy");
    let components = object.get("components").object();
    assert_eq!(
        components.get("database").object().get("status").string(),
        "healthy"
    );

    let response = client.get("/health/live").send().await;
    response.assert_status_is_ok();
    let body = response.json().await;
    assert_eq!(body.value().object().get("status").string(), "alive");

    let response = client.get("/health/ready").send().await;
    response.assert_status_is_ok();
    let body = response.json().await;
    assert_eq!(body.value().object().get("status").string(), "ready");
}
