//! Operation executor.
//!
//! [`TableClient`] resolves every request against the [`SchemaRegistry`]
//! before touching the network, prepares payloads with the codec and the
//! expression builder, and runs them over the session's backend.

mod batch;
mod helpers;
mod operations;
mod transaction;
mod types;

pub use batch::{BatchGetOutput, BatchWriteOutput, WriteDirective};
pub use transaction::{
    TransactGetOp, TransactGetOutput, TransactGetResult, TransactWriteOp, TransactWriteOutput,
    TransactionState,
};
pub use types::{MAX_PAGE_SIZE, Page, QueryOptions, RetryConfig, ScanOptions};

use std::sync::Arc;
use tracing::debug;

use crate::backend::Backend;
use crate::cache::ItemCache;
use crate::codec::Item;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::schema::{PrimaryKey, SchemaRegistry};
use crate::session::SessionManager;

/// Entry point for table operations.
///
/// Cloning is cheap: clones share the registry, the session and the cache.
#[derive(Clone, Debug)]
pub struct TableClient {
    registry: Arc<SchemaRegistry>,
    session: Arc<SessionManager>,
    cache: Option<Arc<ItemCache>>,
    retry: RetryConfig,
}

impl TableClient {
    /// Client over an existing registry and session.
    ///
    /// The item cache is enabled when the session configuration asks for it.
    pub fn new(registry: Arc<SchemaRegistry>, session: Arc<SessionManager>) -> Self {
        let config = session.config();
        let cache = config
            .enable_cache
            .then(|| Arc::new(ItemCache::new(config.cache_capacity)));

        Self {
            registry,
            session,
            cache,
            retry: RetryConfig::default(),
        }
    }

    /// Client with its own session built from `config`
    pub fn from_config(config: ClientConfig, registry: SchemaRegistry) -> Self {
        Self::new(Arc::new(registry), Arc::new(SessionManager::new(config)))
    }

    /// Override the backoff used to complete batches
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Schemas this client resolves against
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Underlying session
    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Item cache, when enabled
    pub fn cache(&self) -> Option<&ItemCache> {
        self.cache.as_deref()
    }

    async fn backend(&self) -> Result<Arc<dyn Backend>> {
        self.session.connect().await
    }

    fn cached(&self, table: &str, key: &PrimaryKey) -> Option<Item> {
        self.cache.as_ref().and_then(|cache| cache.get(table, key))
    }

    /// Cache generation to take before a backend read
    fn cache_generation(&self) -> Option<u64> {
        self.cache.as_ref().map(|cache| cache.generation())
    }

    fn remember(&self, table: &str, key: PrimaryKey, item: &Item, generation: Option<u64>) {
        if let (Some(cache), Some(generation)) = (&self.cache, generation) {
            if !cache.insert_if_current(table, key, item.clone(), generation) {
                debug!("item changed during read, not cached");
            }
        }
    }

    fn forget(&self, table: &str, key: &PrimaryKey) {
        if let Some(cache) = &self.cache {
            cache.invalidate(table, key);
        }
    }
}
