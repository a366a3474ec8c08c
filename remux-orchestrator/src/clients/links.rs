use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// How outbound requests to a linked installation authenticate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "auth", rename_all = "lowercase")]
pub enum LinkAuth {
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
}

/// A peer installation currently advertising free worker slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteInstallation {
    pub uuid: String,
    pub address: String,
    #[serde(flatten)]
    pub auth: LinkAuth,
    pub library_names: Vec<String>,
    pub available_slots: u32,
}

/// Discovery of linked peer installations and their capacity.
#[async_trait]
pub trait LinkDiscovery: Send + Sync {
    /// Peers with free slots right now, keyed by installation uuid.
    async fn check_remote_installation_for_available_workers(
        &self,
    ) -> HashMap<String, RemoteInstallation>;

    /// Installations currently configured as links, as (uuid, address).
    async fn configured_links(&self) -> HashMap<String, String>;

    /// License gate on the number of enabled links.
    fn within_enabled_link_limits(&self) -> bool {
        true
    }
}

/// No links configured.
pub struct NoopLinkDiscovery;

#[async_trait]
impl LinkDiscovery for NoopLinkDiscovery {
    async fn check_remote_installation_for_available_workers(
        &self,
    ) -> HashMap<String, RemoteInstallation> {
        HashMap::new()
    }

    async fn configured_links(&self) -> HashMap<String, String> {
        HashMap::new()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteTaskStatus {
    pub status: String,
    pub success: Option<bool>,
}

/// Wire protocol for handing one task to a peer installation and getting
/// the transcoded artifact back.
#[async_trait]
pub trait RemoteTaskExchange: Send + Sync {
    /// Upload the source file plus its exported scratch state; returns the
    /// peer-side task id.
    async fn submit_task(
        &self,
        installation: &RemoteInstallation,
        source_abspath: &Path,
        task_state_json: &str,
    ) -> Result<String, String>;

    async fn poll_status(
        &self,
        installation: &RemoteInstallation,
        remote_task_id: &str,
    ) -> Result<RemoteTaskStatus, String>;

    /// Download the finished artifact into the local cache path.
    async fn fetch_artifact(
        &self,
        installation: &RemoteInstallation,
        remote_task_id: &str,
        cache_path: &Path,
    ) -> Result<(), String>;
}

/// HTTP implementation of the peer exchange protocol.
pub struct HttpRemoteTaskExchange {
    client: reqwest::Client,
}

impl HttpRemoteTaskExchange {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn apply_auth(
        &self,
        builder: reqwest::RequestBuilder,
        installation: &RemoteInstallation,
    ) -> reqwest::RequestBuilder {
        match &installation.auth {
            LinkAuth::None => builder,
            LinkAuth::Basic { username, password } => {
                builder.basic_auth(username, Some(password))
            }
            LinkAuth::Bearer { token } => builder.bearer_auth(token),
        }
    }
}

impl Default for HttpRemoteTaskExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    success: bool,
    task_id: Option<String>,
    error: Option<String>,
}

#[async_trait]
impl RemoteTaskExchange for HttpRemoteTaskExchange {
    async fn submit_task(
        &self,
        installation: &RemoteInstallation,
        source_abspath: &Path,
        task_state_json: &str,
    ) -> Result<String, String> {
        let file_name = source_abspath
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let bytes = tokio::fs::read(source_abspath)
            .await
            .map_err(|e| format!("Failed to read source file: {e}"))?;

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            )
            .text("task_state", task_state_json.to_string());

        let url = format!("{}/api/v2/remote/tasks/upload", installation.address);
        let response = self
            .apply_auth(self.client.post(&url), installation)
            .multipart(form)
            .send()
            .await
            .map_err(|e| format!("Upload request failed: {e}"))?;

        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| format!("Invalid upload response: {e}"))?;
        if !body.success {
            return Err(body
                .error
                .unwrap_or_else(|| "Remote task upload rejected".to_string()));
        }
        body.task_id
            .ok_or_else(|| "Remote task upload returned no task id".to_string())
    }

    async fn poll_status(
        &self,
        installation: &RemoteInstallation,
        remote_task_id: &str,
    ) -> Result<RemoteTaskStatus, String> {
        let url = format!(
            "{}/api/v2/remote/tasks/{}/status",
            installation.address, remote_task_id
        );
        let response = self
            .apply_auth(self.client.get(&url), installation)
            .send()
            .await
            .map_err(|e| format!("Status request failed: {e}"))?;
        response
            .json()
            .await
            .map_err(|e| format!("Invalid status response: {e}"))
    }

    async fn fetch_artifact(
        &self,
        installation: &RemoteInstallation,
        remote_task_id: &str,
        cache_path: &Path,
    ) -> Result<(), String> {
        let url = format!(
            "{}/api/v2/remote/tasks/{}/download",
            installation.address, remote_task_id
        );
        let response = self
            .apply_auth(self.client.get(&url), installation)
            .send()
            .await
            .map_err(|e| format!("Download request failed: {e}"))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| format!("Download stream failed: {e}"))?;

        if let Some(parent) = cache_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Failed to create cache directory: {e}"))?;
        }
        tokio::fs::write(cache_path, bytes)
            .await
            .map_err(|e| format!("Failed to write artifact: {e}"))
    }
}
