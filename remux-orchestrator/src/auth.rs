use hmac::{Hmac, Mac};
use rand::Rng;
use remux_common::encoding::{base64url_decode, base64url_encode};
use remux_common::model::{TokenClaims, WorkerInfo, WorkerRole};
use remux_common::time::unix_now;
use remux_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_TOKEN_VALIDITY_SECONDS: i64 = 86_400;
pub const MAX_TOKEN_VALIDITY_SECONDS: i64 = 2_592_000;
/// Revoked token ids kept before the oldest entries are dropped.
const MAX_REVOCATION_LIST_SIZE: usize = 10_000;

const SECRET_FILE_NAME: &str = ".worker_auth_secret";
const REGISTRY_FILE_NAME: &str = "registered_workers.json";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid token: {0}")]
    Invalid(String),
    #[error("Token has expired")]
    Expired,
    #[error("Worker not registered: {0}")]
    NotRegistered(String),
    #[error("Worker is inactive: {0}")]
    Inactive(String),
    #[error("Insufficient permissions")]
    InsufficientRole,
    #[error("Auth storage error: {0}")]
    Internal(String),
}

impl SafeDisplay for AuthError {
    fn to_safe_string(&self) -> String {
        match self {
            AuthError::Internal(_) => "Internal authentication error".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    workers: Vec<WorkerInfo>,
    revoked_tokens: Vec<String>,
}

struct AuthInner {
    workers: HashMap<String, WorkerInfo>,
    revoked_order: VecDeque<String>,
    revoked_set: HashSet<String>,
}

/// Registration, token issuance and validation for distributed workers.
///
/// Tokens are compact three-segment strings `header.payload.signature`
/// (url-safe base64, no padding) signed with HMAC-SHA256 over a
/// per-installation secret. Revocation tracks token ids (`jti`) server
/// side. The worker registry persists as pretty-printed JSON with an
/// atomic replace.
pub struct WorkerAuthService {
    config_dir: PathBuf,
    secret: Vec<u8>,
    inner: Mutex<AuthInner>,
}

fn random_url_safe_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    base64url_encode(&bytes)
}

impl WorkerAuthService {
    pub fn new(config_dir: &Path) -> Result<Self, AuthError> {
        std::fs::create_dir_all(config_dir)
            .map_err(|e| AuthError::Internal(format!("Failed to create config dir: {e}")))?;
        let secret = Self::load_or_create_secret(config_dir)?;
        let (workers, revoked) = Self::load_registry(config_dir)?;

        let mut revoked_set = HashSet::new();
        let mut revoked_order = VecDeque::new();
        for jti in revoked {
            if revoked_set.insert(jti.clone()) {
                revoked_order.push_back(jti);
            }
        }

        info!(workers = workers.len(), "Worker auth service initialized");
        Ok(Self {
            config_dir: config_dir.to_path_buf(),
            secret,
            inner: Mutex::new(AuthInner {
                workers,
                revoked_order,
                revoked_set,
            }),
        })
    }

    fn load_or_create_secret(config_dir: &Path) -> Result<Vec<u8>, AuthError> {
        let secret_path = config_dir.join(SECRET_FILE_NAME);
        match std::fs::read(&secret_path) {
            Ok(secret) if secret.len() == 32 => {
                debug!("Loaded existing worker auth secret");
                return Ok(secret);
            }
            Ok(_) => warn!("Worker auth secret has unexpected size, regenerating"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(AuthError::Internal(format!("Failed to read secret: {e}")));
            }
        }

        let mut secret = vec![0u8; 32];
        rand::rng().fill(secret.as_mut_slice());
        std::fs::write(&secret_path, &secret)
            .map_err(|e| AuthError::Internal(format!("Failed to write secret: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&secret_path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| {
                    AuthError::Internal(format!("Failed to set secret permissions: {e}"))
                })?;
        }
        info!("Generated new worker auth secret");
        Ok(secret)
    }

    fn load_registry(
        config_dir: &Path,
    ) -> Result<(HashMap<String, WorkerInfo>, Vec<String>), AuthError> {
        let registry_path = config_dir.join(REGISTRY_FILE_NAME);
        let content = match std::fs::read_to_string(&registry_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((HashMap::new(), vec![]))
            }
            Err(e) => {
                return Err(AuthError::Internal(format!("Failed to read registry: {e}")));
            }
        };
        let file: RegistryFile = serde_json::from_str(&content)
            .map_err(|e| AuthError::Internal(format!("Corrupt worker registry: {e}")))?;
        let workers = file
            .workers
            .into_iter()
            .map(|worker| (worker.worker_id.clone(), worker))
            .collect();
        Ok((workers, file.revoked_tokens))
    }

    fn save_registry(&self, inner: &AuthInner) -> Result<(), AuthError> {
        let file = RegistryFile {
            workers: inner.workers.values().cloned().collect(),
            revoked_tokens: inner.revoked_order.iter().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| AuthError::Internal(format!("Failed to serialize registry: {e}")))?;

        let registry_path = self.config_dir.join(REGISTRY_FILE_NAME);
        let tmp_path = self.config_dir.join(format!("{REGISTRY_FILE_NAME}.tmp"));
        std::fs::write(&tmp_path, json)
            .map_err(|e| AuthError::Internal(format!("Failed to write registry: {e}")))?;
        std::fs::rename(&tmp_path, &registry_path)
            .map_err(|e| AuthError::Internal(format!("Failed to replace registry: {e}")))?;
        Ok(())
    }

    fn sign(&self, message: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key size");
        mac.update(message.as_bytes());
        base64url_encode(&mac.finalize().into_bytes())
    }

    fn verify_signature(&self, message: &str, signature: &str) -> bool {
        let Ok(signature) = base64url_decode(signature) else {
            return false;
        };
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key size");
        mac.update(message.as_bytes());
        mac.verify_slice(&signature).is_ok()
    }

    pub fn register_worker(
        &self,
        name: &str,
        hostname: &str,
        capabilities: Vec<String>,
    ) -> Result<WorkerInfo, AuthError> {
        let worker = WorkerInfo {
            worker_id: random_url_safe_id(),
            name: name.to_string(),
            hostname: hostname.to_string(),
            roles: vec![WorkerRole::Worker],
            capabilities,
            registered_at: unix_now(),
            last_seen: unix_now(),
            active: true,
        };

        let mut inner = self.inner.lock().expect("auth lock poisoned");
        inner.workers.insert(worker.worker_id.clone(), worker.clone());
        self.save_registry(&inner)?;
        info!(worker = %worker.name, worker_id = %worker.worker_id, "Registered worker");
        Ok(worker)
    }

    pub fn unregister_worker(&self, worker_id: &str) -> Result<bool, AuthError> {
        let mut inner = self.inner.lock().expect("auth lock poisoned");
        match inner.workers.remove(worker_id) {
            Some(worker) => {
                self.save_registry(&inner)?;
                info!(worker = %worker.name, worker_id, "Unregistered worker");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Fetch a worker and touch its `last_seen`.
    pub fn get_worker(&self, worker_id: &str) -> Option<WorkerInfo> {
        let mut inner = self.inner.lock().expect("auth lock poisoned");
        let worker = inner.workers.get_mut(worker_id)?;
        worker.last_seen = unix_now();
        Some(worker.clone())
    }

    pub fn list_workers(&self, active_only: bool) -> Vec<WorkerInfo> {
        let inner = self.inner.lock().expect("auth lock poisoned");
        let mut workers: Vec<WorkerInfo> = inner
            .workers
            .values()
            .filter(|worker| !active_only || worker.active)
            .cloned()
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }

    pub fn update_worker(
        &self,
        worker_id: &str,
        name: Option<String>,
        roles: Option<Vec<WorkerRole>>,
        capabilities: Option<Vec<String>>,
        active: Option<bool>,
    ) -> Result<Option<WorkerInfo>, AuthError> {
        let mut inner = self.inner.lock().expect("auth lock poisoned");
        let Some(worker) = inner.workers.get_mut(worker_id) else {
            return Ok(None);
        };
        if let Some(name) = name {
            worker.name = name;
        }
        if let Some(roles) = roles {
            worker.roles = roles;
        }
        if let Some(capabilities) = capabilities {
            worker.capabilities = capabilities;
        }
        if let Some(active) = active {
            worker.active = active;
        }
        let updated = worker.clone();
        self.save_registry(&inner)?;
        Ok(Some(updated))
    }

    /// Record a heartbeat: touch `last_seen`, reactivate and persist.
    pub fn heartbeat(&self, worker_id: &str) -> Result<WorkerInfo, AuthError> {
        let mut inner = self.inner.lock().expect("auth lock poisoned");
        let Some(worker) = inner.workers.get_mut(worker_id) else {
            return Err(AuthError::NotRegistered(worker_id.to_string()));
        };
        worker.last_seen = unix_now();
        let updated = worker.clone();
        self.save_registry(&inner)?;
        Ok(updated)
    }

    /// Deactivate workers whose `last_seen` predates `cutoff`. Returns the
    /// affected worker ids.
    pub fn deactivate_stale_workers(&self, cutoff: f64) -> Result<Vec<String>, AuthError> {
        let mut inner = self.inner.lock().expect("auth lock poisoned");
        let mut timed_out = vec![];
        for worker in inner.workers.values_mut() {
            if worker.active && worker.last_seen < cutoff {
                worker.active = false;
                timed_out.push(worker.worker_id.clone());
                warn!(
                    worker = %worker.name,
                    worker_id = %worker.worker_id,
                    last_seen = worker.last_seen,
                    "Worker timed out"
                );
            }
        }
        if !timed_out.is_empty() {
            self.save_registry(&inner)?;
        }
        Ok(timed_out)
    }

    /// Issue a signed token. Validity defaults to 24 hours and is capped at
    /// 30 days.
    pub fn generate_token(
        &self,
        worker_id: &str,
        validity_seconds: Option<i64>,
    ) -> Result<String, AuthError> {
        let worker = {
            let inner = self.inner.lock().expect("auth lock poisoned");
            inner
                .workers
                .get(worker_id)
                .cloned()
                .ok_or_else(|| AuthError::NotRegistered(worker_id.to_string()))?
        };
        if !worker.active {
            return Err(AuthError::Inactive(worker_id.to_string()));
        }

        let validity = validity_seconds
            .unwrap_or(DEFAULT_TOKEN_VALIDITY_SECONDS)
            .min(MAX_TOKEN_VALIDITY_SECONDS);
        let now = unix_now();
        let claims = TokenClaims {
            sub: worker_id.to_string(),
            roles: worker.roles.clone(),
            capabilities: worker.capabilities.clone(),
            iat: now,
            exp: now + validity as f64,
            jti: random_url_safe_id(),
        };

        let header = base64url_encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = base64url_encode(
            serde_json::to_string(&claims)
                .expect("token claims are always serializable")
                .as_bytes(),
        );
        let message = format!("{header}.{payload}");
        let signature = self.sign(&message);
        debug!(worker_id, "Issued worker token");
        Ok(format!("{message}.{signature}"))
    }

    /// Validate a token end to end: structure, signature (constant-time),
    /// payload, revocation, expiry, then worker registration and activity.
    /// A passing validation touches the worker's `last_seen`.
    pub fn validate_token(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return Err(AuthError::Invalid("Invalid token format".to_string()));
        }
        let message = format!("{}.{}", parts[0], parts[1]);
        if !self.verify_signature(&message, parts[2]) {
            return Err(AuthError::Invalid("Invalid token signature".to_string()));
        }

        let payload = base64url_decode(parts[1])
            .map_err(|e| AuthError::Invalid(format!("Invalid token payload: {e}")))?;
        let claims: TokenClaims = serde_json::from_slice(&payload)
            .map_err(|e| AuthError::Invalid(format!("Invalid token payload: {e}")))?;

        let mut inner = self.inner.lock().expect("auth lock poisoned");
        if inner.revoked_set.contains(&claims.jti) {
            return Err(AuthError::Invalid("Token has been revoked".to_string()));
        }
        if unix_now() > claims.exp {
            return Err(AuthError::Expired);
        }
        let Some(worker) = inner.workers.get_mut(&claims.sub) else {
            return Err(AuthError::NotRegistered(claims.sub.clone()));
        };
        if !worker.active {
            return Err(AuthError::Inactive(claims.sub.clone()));
        }
        worker.last_seen = unix_now();

        Ok(claims)
    }

    /// Validate and additionally require one of the given roles.
    pub fn validate_token_with_roles(
        &self,
        token: &str,
        required_roles: &[WorkerRole],
    ) -> Result<TokenClaims, AuthError> {
        let claims = self.validate_token(token)?;
        if !claims.roles.iter().any(|role| required_roles.contains(role)) {
            return Err(AuthError::InsufficientRole);
        }
        Ok(claims)
    }

    /// Revoke a token by its id. Returns false when the token does not
    /// validate (already revoked, expired, malformed).
    pub fn revoke_token(&self, token: &str) -> Result<bool, AuthError> {
        let claims = match self.validate_token(token) {
            Ok(claims) => claims,
            Err(AuthError::Internal(e)) => return Err(AuthError::Internal(e)),
            Err(_) => return Ok(false),
        };

        let mut inner = self.inner.lock().expect("auth lock poisoned");
        if inner.revoked_set.insert(claims.jti.clone()) {
            inner.revoked_order.push_back(claims.jti.clone());
            while inner.revoked_order.len() > MAX_REVOCATION_LIST_SIZE {
                if let Some(dropped) = inner.revoked_order.pop_front() {
                    inner.revoked_set.remove(&dropped);
                }
            }
            self.save_registry(&inner)?;
        }
        info!(jti = %claims.jti, "Revoked worker token");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn service() -> (WorkerAuthService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let service = WorkerAuthService::new(dir.path()).unwrap();
        (service, dir)
    }

    #[test]
    fn secret_is_persisted_with_restrictive_permissions() {
        let (_service, dir) = service();
        let secret_path = dir.path().join(SECRET_FILE_NAME);
        let secret = std::fs::read(&secret_path).unwrap();
        assert_eq!(secret.len(), 32);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&secret_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        // The same secret is reused across restarts.
        let again = WorkerAuthService::new(dir.path()).unwrap();
        assert_eq!(again.secret, secret);
    }

    #[test]
    fn register_issue_and_validate() {
        let (service, _dir) = service();
        let worker = service
            .register_worker("W1", "h", vec!["hevc".to_string()])
            .unwrap();

        let token = service.generate_token(&worker.worker_id, None).unwrap();
        assert_eq!(token.split('.').count(), 3);

        let claims = service.validate_token(&token).unwrap();
        assert_eq!(claims.sub, worker.worker_id);
        assert_eq!(claims.roles, vec![WorkerRole::Worker]);
        assert_eq!(claims.capabilities, vec!["hevc".to_string()]);
    }

    #[test]
    fn revoked_tokens_fail_as_invalid_not_expired() {
        let (service, _dir) = service();
        let worker = service.register_worker("W1", "h", vec![]).unwrap();
        let token = service.generate_token(&worker.worker_id, None).unwrap();

        assert!(service.revoke_token(&token).unwrap());
        let err = service.validate_token(&token).unwrap_err();
        assert!(matches!(err, AuthError::Invalid(_)));

        // Revoking an already revoked token reports failure.
        assert!(!service.revoke_token(&token).unwrap());
    }

    #[test]
    fn expired_tokens_are_reported_as_expired() {
        let (service, _dir) = service();
        let worker = service.register_worker("W1", "h", vec![]).unwrap();
        let token = service
            .generate_token(&worker.worker_id, Some(-10))
            .unwrap();

        let err = service.validate_token(&token).unwrap_err();
        assert!(matches!(err, AuthError::Expired));
    }

    #[test]
    fn tampered_tokens_fail_signature_verification() {
        let (service, _dir) = service();
        let worker = service.register_worker("W1", "h", vec![]).unwrap();
        let token = service.generate_token(&worker.worker_id, None).unwrap();

        let mut parts: Vec<String> = token.split('.').map(String::from).collect();
        let mut claims: TokenClaims =
            serde_json::from_slice(&base64url_decode(&parts[1]).unwrap()).unwrap();
        claims.roles = vec![WorkerRole::Admin];
        parts[1] = base64url_encode(serde_json::to_string(&claims).unwrap().as_bytes());
        let forged = parts.join(".");

        let err = service.validate_token(&forged).unwrap_err();
        assert!(matches!(err, AuthError::Invalid(_)));
    }

    #[test]
    fn inactive_workers_cannot_authenticate() {
        let (service, _dir) = service();
        let worker = service.register_worker("W1", "h", vec![]).unwrap();
        let token = service.generate_token(&worker.worker_id, None).unwrap();

        service
            .update_worker(&worker.worker_id, None, None, None, Some(false))
            .unwrap();
        let err = service.validate_token(&token).unwrap_err();
        assert!(matches!(err, AuthError::Inactive(_)));
    }

    #[test]
    fn role_requirements_are_enforced() {
        let (service, _dir) = service();
        let worker = service.register_worker("W1", "h", vec![]).unwrap();
        service
            .update_worker(
                &worker.worker_id,
                None,
                Some(vec![WorkerRole::Readonly]),
                None,
                None,
            )
            .unwrap();
        let token = service.generate_token(&worker.worker_id, None).unwrap();

        let err = service
            .validate_token_with_roles(&token, &[WorkerRole::Worker, WorkerRole::Admin])
            .unwrap_err();
        assert!(matches!(err, AuthError::InsufficientRole));
    }

    #[test]
    fn validity_is_capped_at_thirty_days() {
        let (service, _dir) = service();
        let worker = service.register_worker("W1", "h", vec![]).unwrap();
        let token = service
            .generate_token(&worker.worker_id, Some(MAX_TOKEN_VALIDITY_SECONDS * 10))
            .unwrap();
        let claims = service.validate_token(&token).unwrap();
        assert!(claims.exp - claims.iat <= MAX_TOKEN_VALIDITY_SECONDS as f64 + 1.0);
    }

    #[test]
    fn registry_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let worker_id = {
            let service = WorkerAuthService::new(dir.path()).unwrap();
            service
                .register_worker("W1", "host-1", vec!["gpu".to_string()])
                .unwrap()
                .worker_id
        };

        let reloaded = WorkerAuthService::new(dir.path()).unwrap();
        let worker = reloaded.get_worker(&worker_id).unwrap();
        assert_eq!(worker.name, "W1");
        assert_eq!(worker.hostname, "host-1");
        assert_eq!(worker.capabilities, vec!["gpu".to_string()]);
    }

    #[test]
    fn stale_workers_are_deactivated() {
        let (service, _dir) = service();
        let worker = service.register_worker("W1", "h", vec![]).unwrap();

        let timed_out = service.deactivate_stale_workers(unix_now() + 10.0).unwrap();
        assert_eq!(timed_out, vec![worker.worker_id.clone()]);
        assert!(!service.get_worker(&worker.worker_id).unwrap().active);

        // Already inactive workers are not reported again.
        let timed_out = service.deactivate_stale_workers(unix_now() + 10.0).unwrap();
        assert!(timed_out.is_empty());
    }
}
