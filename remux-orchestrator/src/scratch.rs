use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum ScratchError {
    #[error("Runner context not bound")]
    ContextNotBound,
    #[error("Invalid scratch state JSON: {0}")]
    InvalidJson(String),
}

/// Identifies which plugin runner is executing on the current thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerContext {
    pub task_id: i64,
    pub plugin_id: String,
    pub runner: String,
}

thread_local! {
    static BOUND_CONTEXT: RefCell<Option<RunnerContext>> = const { RefCell::new(None) };
}

/// Clears the thread's runner context when dropped, so a context cannot
/// outlive the plugin call it was bound for.
pub struct RunnerContextGuard {
    _private: (),
}

impl Drop for RunnerContextGuard {
    fn drop(&mut self) {
        BOUND_CONTEXT.with(|ctx| *ctx.borrow_mut() = None);
    }
}

#[derive(Default)]
struct StoreInner {
    // task_id -> plugin_id -> runner -> key -> value
    runner_state: HashMap<i64, HashMap<String, HashMap<String, HashMap<String, Value>>>>,
    // task_id -> key -> value
    task_state: HashMap<i64, HashMap<String, Value>>,
}

/// Process-wide scratch storage for per-task plugin data.
///
/// Two tiers share one lock: the write-once runner state keyed by the bound
/// runner context, and the freely mutable task state. Both tiers are purged
/// when a task is deleted or reaches `complete`.
#[derive(Default)]
pub struct TaskDataStore {
    inner: Mutex<StoreInner>,
}

impl TaskDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the current thread's runner context for the duration of a
    /// plugin callback. The returned guard clears it again on drop.
    pub fn bind_runner_context(
        &self,
        task_id: i64,
        plugin_id: &str,
        runner: &str,
    ) -> RunnerContextGuard {
        BOUND_CONTEXT.with(|ctx| {
            *ctx.borrow_mut() = Some(RunnerContext {
                task_id,
                plugin_id: plugin_id.to_string(),
                runner: runner.to_string(),
            })
        });
        RunnerContextGuard { _private: () }
    }

    fn bound_context(&self) -> Result<RunnerContext, ScratchError> {
        BOUND_CONTEXT
            .with(|ctx| ctx.borrow().clone())
            .ok_or(ScratchError::ContextNotBound)
    }

    /// Store an immutable value under the bound context. Returns `false`
    /// without mutating when the key already exists.
    pub fn set_runner_value(&self, key: &str, value: Value) -> Result<bool, ScratchError> {
        let context = self.bound_context()?;
        let mut inner = self.inner.lock().expect("scratch store lock poisoned");
        let runner_map = inner
            .runner_state
            .entry(context.task_id)
            .or_default()
            .entry(context.plugin_id)
            .or_default()
            .entry(context.runner)
            .or_default();
        if runner_map.contains_key(key) {
            return Ok(false);
        }
        runner_map.insert(key.to_string(), value);
        Ok(true)
    }

    /// Read a runner value through the bound context, optionally overriding
    /// the plugin id or runner name.
    pub fn get_runner_value(
        &self,
        key: &str,
        plugin_id: Option<&str>,
        runner: Option<&str>,
    ) -> Result<Option<Value>, ScratchError> {
        let context = self.bound_context()?;
        let plugin_id = plugin_id.unwrap_or(&context.plugin_id);
        let runner = runner.unwrap_or(&context.runner);
        let inner = self.inner.lock().expect("scratch store lock poisoned");
        Ok(inner
            .runner_state
            .get(&context.task_id)
            .and_then(|plugins| plugins.get(plugin_id))
            .and_then(|runners| runners.get(runner))
            .and_then(|values| values.get(key))
            .cloned())
    }

    /// Store or overwrite a mutable task value. `task_id = None` uses the
    /// bound runner context.
    pub fn set_task_state(
        &self,
        task_id: Option<i64>,
        key: &str,
        value: Value,
    ) -> Result<(), ScratchError> {
        let task_id = self.resolve_task_id(task_id)?;
        let mut inner = self.inner.lock().expect("scratch store lock poisoned");
        inner
            .task_state
            .entry(task_id)
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    pub fn get_task_state(
        &self,
        task_id: Option<i64>,
        key: &str,
    ) -> Result<Option<Value>, ScratchError> {
        let task_id = self.resolve_task_id(task_id)?;
        let inner = self.inner.lock().expect("scratch store lock poisoned");
        Ok(inner
            .task_state
            .get(&task_id)
            .and_then(|values| values.get(key))
            .cloned())
    }

    pub fn delete_task_state(&self, task_id: Option<i64>, key: &str) -> Result<(), ScratchError> {
        let task_id = self.resolve_task_id(task_id)?;
        let mut inner = self.inner.lock().expect("scratch store lock poisoned");
        if let Some(values) = inner.task_state.get_mut(&task_id) {
            values.remove(key);
            if values.is_empty() {
                inner.task_state.remove(&task_id);
            }
        }
        Ok(())
    }

    fn resolve_task_id(&self, task_id: Option<i64>) -> Result<i64, ScratchError> {
        match task_id {
            Some(task_id) => Ok(task_id),
            None => Ok(self.bound_context()?.task_id),
        }
    }

    pub fn export_task_state(&self, task_id: i64) -> HashMap<String, Value> {
        let inner = self.inner.lock().expect("scratch store lock poisoned");
        inner.task_state.get(&task_id).cloned().unwrap_or_default()
    }

    /// The task tier as JSON, for carrying scratch state to a peer
    /// installation alongside the source file.
    pub fn export_task_state_json(&self, task_id: i64) -> String {
        serde_json::to_string(&self.export_task_state(task_id))
            .expect("scratch state is always serializable")
    }

    /// Merge keys into the task tier; existing keys not present in
    /// `new_state` are left untouched.
    pub fn import_task_state(&self, task_id: i64, new_state: HashMap<String, Value>) {
        let mut inner = self.inner.lock().expect("scratch store lock poisoned");
        inner
            .task_state
            .entry(task_id)
            .or_default()
            .extend(new_state);
    }

    pub fn import_task_state_json(&self, task_id: i64, json: &str) -> Result<(), ScratchError> {
        let parsed: HashMap<String, Value> =
            serde_json::from_str(json).map_err(|e| ScratchError::InvalidJson(e.to_string()))?;
        self.import_task_state(task_id, parsed);
        Ok(())
    }

    /// Purge both tiers for a task. Called on deletion and on transition to
    /// `complete`.
    pub fn clear_task(&self, task_id: i64) {
        let mut inner = self.inner.lock().expect("scratch store lock poisoned");
        inner.runner_state.remove(&task_id);
        inner.task_state.remove(&task_id);
    }

    pub fn has_entries_for(&self, task_id: i64) -> bool {
        let inner = self.inner.lock().expect("scratch store lock poisoned");
        inner.runner_state.contains_key(&task_id) || inner.task_state.contains_key(&task_id)
    }
}
