use async_trait::async_trait;
use serde_json::Value;

/// Everything a worker needs to run the plugin-driven transcode pipeline
/// against one task.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub task_id: i64,
    pub library_id: i64,
    pub source_abspath: String,
    pub cache_path: String,
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub success: bool,
    /// Command output appended to the task log.
    pub log: Vec<String>,
}

/// Callback surface the pipeline uses to publish subprocess progress and
/// per-runner state into the owning worker's status.
pub trait PipelineProgress: Send + Sync {
    fn set_subprocess_pid(&self, pid: Option<u32>);
    fn set_subprocess_percent(&self, percent: f64);
    /// Record the state of one plugin runner ("pending", "in_progress",
    /// "complete", ...), keyed by runner name.
    fn set_runner_status(&self, runner: &str, status: &str);
    fn append_log(&self, line: &str);
}

/// The plugin runtime boundary. The orchestrator never inspects plugins
/// itself; it only schedules around this contract.
#[async_trait]
pub trait PluginRuntime: Send + Sync {
    /// Plugins that are enabled but incompatible with the runtime version.
    /// A non-empty result pauses all workers.
    async fn get_incompatible_enabled_plugins(&self) -> Vec<String>;

    /// The full per-library plugin settings and flow, used for
    /// configuration-drift detection. Must serialize deterministically.
    async fn get_library_plugin_configuration(&self) -> Value;

    /// Run the transcode pipeline for one task. The artifact is written to
    /// `request.cache_path`.
    async fn run_worker_pipeline(
        &self,
        request: &PipelineRequest,
        progress: &dyn PipelineProgress,
    ) -> PipelineOutcome;

    /// Fire event hooks such as `events.task_scheduled` and
    /// `events.post_process`.
    async fn run_event_plugins_for_plugin_type(&self, event_type: &str, data: Value);
}

/// A runtime with no plugins installed: every pipeline run succeeds without
/// touching the artifact. Used for wiring defaults and tests.
pub struct NoopPluginRuntime;

#[async_trait]
impl PluginRuntime for NoopPluginRuntime {
    async fn get_incompatible_enabled_plugins(&self) -> Vec<String> {
        vec![]
    }

    async fn get_library_plugin_configuration(&self) -> Value {
        Value::Object(serde_json::Map::new())
    }

    async fn run_worker_pipeline(
        &self,
        _request: &PipelineRequest,
        _progress: &dyn PipelineProgress,
    ) -> PipelineOutcome {
        PipelineOutcome {
            success: true,
            log: vec![],
        }
    }

    async fn run_event_plugins_for_plugin_type(&self, _event_type: &str, _data: Value) {}
}
