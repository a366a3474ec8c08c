use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityStatus {
    Healthy,
    Warning,
    Corrupted,
    Error,
}

#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub status: IntegrityStatus,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl IntegrityReport {
    pub fn healthy() -> Self {
        Self {
            status: IntegrityStatus::Healthy,
            errors: vec![],
            warnings: vec![],
        }
    }
}

/// Media integrity probing. Backed by the external transcoder toolchain in
/// production; the orchestrator only depends on this contract.
#[async_trait]
pub trait IntegrityChecker: Send + Sync {
    async fn run_integrity_check(&self, path: &Path, timeout: Duration) -> IntegrityReport;
}

/// Reports every file as healthy. Used when health checks are disabled and
/// in tests.
pub struct NoopIntegrityChecker;

#[async_trait]
impl IntegrityChecker for NoopIntegrityChecker {
    async fn run_integrity_check(&self, _path: &Path, _timeout: Duration) -> IntegrityReport {
        IntegrityReport::healthy()
    }
}
