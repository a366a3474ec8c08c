use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// The completed-task record handed to the history subsystem. Written
/// exactly once per task, on success or terminal failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHistoryRecord {
    pub task_label: String,
    pub abspath: String,
    pub task_success: bool,
    pub start_time: Option<f64>,
    pub finish_time: Option<f64>,
    pub processed_by_worker: Option<String>,
    pub errors: Vec<String>,
    pub log: String,
}

#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn save_task_history(&self, record: TaskHistoryRecord) -> Result<(), String>;
}

pub struct NoopHistorySink;

#[async_trait]
impl HistorySink for NoopHistorySink {
    async fn save_task_history(&self, _record: TaskHistoryRecord) -> Result<(), String> {
        Ok(())
    }
}

/// Collects records in memory; test scaffolding.
#[derive(Default)]
pub struct RecordingHistorySink {
    records: Mutex<Vec<TaskHistoryRecord>>,
}

impl RecordingHistorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TaskHistoryRecord> {
        self.records.lock().expect("history lock poisoned").clone()
    }
}

#[async_trait]
impl HistorySink for RecordingHistorySink {
    async fn save_task_history(&self, record: TaskHistoryRecord) -> Result<(), String> {
        self.records
            .lock()
            .expect("history lock poisoned")
            .push(record);
        Ok(())
    }
}
