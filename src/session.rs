//! Session lifecycle: connect, health check, disconnect.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::backend::{Backend, BackendKind, DynamoBackend, MemoryBackend};
use crate::config::ClientConfig;
use crate::error::Result;

/// Outcome of a health check
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// The backend answered
    Healthy,
    /// The session could not be established or the probe failed
    Unhealthy,
}

/// Health check report
#[derive(Clone, Debug, Serialize)]
pub struct HealthStatus {
    /// Overall status
    pub status: HealthState,
    /// Failure description when unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the probe ran
    pub timestamp: DateTime<Utc>,
}

impl HealthStatus {
    /// Whether the backend answered
    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }
}

/// Owns the backend session.
///
/// The session is established on the first [`connect`](Self::connect) and
/// shared by every operation until [`disconnect`](Self::disconnect).
/// Connecting is a single attempt; retrying is left to the caller.
pub struct SessionManager {
    config: ClientConfig,
    active: Mutex<Option<Arc<dyn Backend>>>,
    memory: MemoryBackend,
    injected: Option<Arc<dyn Backend>>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("backend", &self.config.backend)
            .field("endpoint", &self.config.endpoint)
            .field("keyspace", &self.config.keyspace)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Session for `config`, not yet connected
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            active: Mutex::new(None),
            memory: MemoryBackend::new(),
            injected: None,
        }
    }

    /// Session over an already constructed backend
    pub fn with_backend(config: ClientConfig, backend: Arc<dyn Backend>) -> Self {
        Self {
            injected: Some(backend),
            ..Self::new(config)
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Return the live session, establishing it if needed.
    pub async fn connect(&self) -> Result<Arc<dyn Backend>> {
        let mut active = self.active.lock().await;
        if let Some(backend) = active.as_ref() {
            return Ok(Arc::clone(backend));
        }

        let backend: Arc<dyn Backend> = match (&self.injected, self.config.backend) {
            (Some(backend), _) => Arc::clone(backend),
            // the emulator keeps its data across reconnects of this session
            (None, BackendKind::Memory) => Arc::new(self.memory.clone()),
            (None, BackendKind::DynamoDb) => Arc::new(DynamoBackend::connect(&self.config).await?),
        };

        info!(backend = %backend.kind(), keyspace = ?self.config.keyspace, "session established");
        *active = Some(Arc::clone(&backend));
        Ok(backend)
    }

    /// Whether a session is currently established
    pub async fn is_connected(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Probe the backend with a trivial round trip. Never fails.
    pub async fn health_check(&self) -> HealthStatus {
        let probe = match self.connect().await {
            Ok(backend) => backend.ping().await,
            Err(e) => Err(e),
        };

        match probe {
            Ok(()) => HealthStatus {
                status: HealthState::Healthy,
                error: None,
                timestamp: Utc::now(),
            },
            Err(e) => {
                warn!(error = %e, "health check failed");
                HealthStatus {
                    status: HealthState::Unhealthy,
                    error: Some(e.to_string()),
                    timestamp: Utc::now(),
                }
            }
        }
    }

    /// Release the session; a later `connect` starts a fresh one.
    pub async fn disconnect(&self) {
        let backend = self.active.lock().await.take();
        if let Some(backend) = backend {
            backend.shutdown().await;
            info!(backend = %backend.kind(), "session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_item;
    use crate::schema::TableSchema;
    use serde_json::json;

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let session = SessionManager::new(ClientConfig::memory());
        assert!(!session.is_connected().await);

        let first = session.connect().await.unwrap();
        let second = session.connect().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.kind(), BackendKind::Memory);
    }

    #[tokio::test]
    async fn test_disconnect_resets_state() {
        let session = SessionManager::new(ClientConfig::memory());
        let schema = TableSchema::new("tokens", "id");
        let item = encode_item(json!({ "id": "t1" }).as_object().unwrap()).unwrap();

        let backend = session.connect().await.unwrap();
        backend.put_item(&schema, &item, None).await.unwrap();

        session.disconnect().await;
        assert!(!session.is_connected().await);

        let backend = session.connect().await.unwrap();
        assert!(backend.get_item(&schema, &item).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_health_check_reports_status() {
        let session = SessionManager::new(ClientConfig::memory());
        let status = session.health_check().await;
        assert!(status.is_healthy());
        assert!(status.error.is_none());

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "healthy");
    }
}
