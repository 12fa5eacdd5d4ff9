/// Test helpers and fixtures for integration tests
///
/// This module provides client construction, unique key generation and
/// tracing setup shared by every integration test.
pub mod fixtures;

pub use fixtures::{PaymentToken, registry};
pub use serde_json::json;
pub use wide_table::{
    ClientConfig, Condition, Error, QueryOptions, TableClient, TransactGetOp, TransactWriteOp,
    WriteCondition, WriteDirective, values,
};

use std::sync::Arc;
use wide_table::{MemoryBackend, SessionManager};

/// Install a test subscriber honouring `RUST_LOG` (idempotent)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Client over a fresh in-memory emulator
#[allow(dead_code)]
pub fn memory_client() -> TableClient {
    init_tracing();
    TableClient::from_config(ClientConfig::memory(), registry())
}

/// Client plus a handle on its emulator, for inspecting stored state
#[allow(dead_code)]
pub fn memory_client_with_backend() -> (TableClient, MemoryBackend) {
    init_tracing();
    let backend = MemoryBackend::new();
    let session = SessionManager::with_backend(ClientConfig::memory(), Arc::new(backend.clone()));
    (
        TableClient::new(Arc::new(registry()), Arc::new(session)),
        backend,
    )
}

/// Generate a unique key for test isolation
#[allow(dead_code)]
pub fn unique_id(prefix: &str) -> String {
    format!("{prefix}#{}", rusty_ulid::generate_ulid_string())
}
