use remux_service_base::db;
use remux_service_base::queue::{create_task_queue, TaskQueue};
use remux_service_base::repo::library::{DbLibraryRepo, LibraryRepo};
use remux_service_base::repo::settings::{DbSettingsRepo, SettingsRepo};
use remux_service_base::repo::task::{DbTaskRepo, TaskRepo};
use remux_service_base::repo::worker_group::{DbWorkerGroupRepo, WorkerGroupRepo};
use sqlx::{Pool, Sqlite};
use std::sync::Arc;

use crate::auth::WorkerAuthService;
use crate::clients::history::{HistorySink, NoopHistorySink};
use crate::clients::integrity::{IntegrityChecker, NoopIntegrityChecker};
use crate::clients::links::{HttpRemoteTaskExchange, LinkDiscovery, NoopLinkDiscovery, RemoteTaskExchange};
use crate::clients::plugins::{NoopPluginRuntime, PluginRuntime};
use crate::config::OrchestratorConfig;
use crate::foreman::ForemanDeps;
use crate::gpu::GpuManager;
use crate::messages::FrontendPushMessages;
use crate::monitor::DistributedWorkerMonitor;
use crate::postprocessor::PostProcessor;
use crate::scratch::TaskDataStore;
use crate::task::TaskManager;
use crate::worker_group::WorkerGroupService;

/// Everything the orchestrator shares between the scheduler loops and the
/// HTTP API, constructed once at startup. The collaborator slots (plugin
/// runtime, link discovery, integrity checker, history sink) default to
/// no-op implementations and are replaced by the embedding application.
#[derive(Clone)]
pub struct Services {
    pub config: OrchestratorConfig,
    pub db_pool: Arc<Pool<Sqlite>>,
    pub task_repo: Arc<dyn TaskRepo>,
    pub library_repo: Arc<dyn LibraryRepo>,
    pub worker_group_repo: Arc<dyn WorkerGroupRepo>,
    pub settings_repo: Arc<dyn SettingsRepo>,
    pub queue: Arc<dyn TaskQueue>,
    pub scratch: Arc<TaskDataStore>,
    pub task_manager: Arc<TaskManager>,
    pub worker_groups: Arc<WorkerGroupService>,
    pub gpu_manager: Arc<GpuManager>,
    pub messages: Arc<FrontendPushMessages>,
    pub auth_service: Arc<WorkerAuthService>,
    pub plugin_runtime: Arc<dyn PluginRuntime>,
    pub links: Arc<dyn LinkDiscovery>,
    pub exchange: Arc<dyn RemoteTaskExchange>,
    pub integrity_checker: Arc<dyn IntegrityChecker>,
    pub history: Arc<dyn HistorySink>,
}

impl Services {
    pub async fn new(config: &OrchestratorConfig) -> Result<Services, String> {
        let db_pool = Arc::new(
            db::create_sqlite_pool(&config.db)
                .await
                .map_err(|e| format!("Failed to create sqlite pool: {e}"))?,
        );

        let task_repo: Arc<dyn TaskRepo> = Arc::new(DbTaskRepo::new(db_pool.clone()));
        let library_repo: Arc<dyn LibraryRepo> = Arc::new(DbLibraryRepo::new(db_pool.clone()));
        let worker_group_repo: Arc<dyn WorkerGroupRepo> =
            Arc::new(DbWorkerGroupRepo::new(db_pool.clone()));
        let settings_repo: Arc<dyn SettingsRepo> = Arc::new(DbSettingsRepo::new(db_pool.clone()));

        let queue = create_task_queue(&config.queue, task_repo.clone(), library_repo.clone())
            .await
            .map_err(|e| format!("Failed to initialize task queue: {e}"))?;

        let scratch = Arc::new(TaskDataStore::new());
        let task_manager = Arc::new(TaskManager::new(
            task_repo.clone(),
            library_repo.clone(),
            queue.clone(),
            scratch.clone(),
            config.cache_path.clone(),
        ));
        let worker_groups = Arc::new(WorkerGroupService::new(
            worker_group_repo.clone(),
            settings_repo.clone(),
        ));
        let gpu_manager = Arc::new(GpuManager::from_config(&config.gpu));
        let messages = Arc::new(FrontendPushMessages::new());
        let auth_service = Arc::new(
            WorkerAuthService::new(&config.config_path)
                .map_err(|e| format!("Failed to initialize worker auth: {e}"))?,
        );

        Ok(Services {
            config: config.clone(),
            db_pool,
            task_repo,
            library_repo,
            worker_group_repo,
            settings_repo,
            queue,
            scratch,
            task_manager,
            worker_groups,
            gpu_manager,
            messages,
            auth_service,
            plugin_runtime: Arc::new(NoopPluginRuntime),
            links: Arc::new(NoopLinkDiscovery),
            exchange: Arc::new(HttpRemoteTaskExchange::new()),
            integrity_checker: Arc::new(NoopIntegrityChecker),
            history: Arc::new(NoopHistorySink),
        })
    }

    pub fn foreman_deps(&self) -> ForemanDeps {
        ForemanDeps {
            queue: self.queue.clone(),
            task_manager: self.task_manager.clone(),
            worker_groups: self.worker_groups.clone(),
            plugin_runtime: self.plugin_runtime.clone(),
            links: self.links.clone(),
            exchange: self.exchange.clone(),
            messages: self.messages.clone(),
            integrity_checker: self.integrity_checker.clone(),
            gpu_manager: self.gpu_manager.clone(),
            health_check: self.config.health_check.clone(),
        }
    }

    pub fn post_processor(&self) -> PostProcessor {
        PostProcessor::new(
            self.queue.clone(),
            self.task_manager.clone(),
            self.plugin_runtime.clone(),
            self.history.clone(),
        )
    }

    pub fn monitor(&self) -> DistributedWorkerMonitor {
        DistributedWorkerMonitor::new(
            self.auth_service.clone(),
            self.queue.clone(),
            self.task_repo.clone(),
        )
    }
}
