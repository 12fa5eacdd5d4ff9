//! Storage backends.
//!
//! The executor talks to storage only through [`Backend`]. Two
//! implementations exist and are chosen by configuration: [`DynamoBackend`]
//! for DynamoDB-compatible endpoints and [`MemoryBackend`], an in-process
//! emulator used for local development and tests.
//!
//! There is no CQL driver. A Cassandra-family cluster is reached through
//! its DynamoDB-compatible API, for example ScyllaDB Alternator, so the CQL
//! connection settings map onto [`ClientConfig`](crate::ClientConfig) like
//! this:
//!
//! | CQL setting             | Here                                        |
//! |-------------------------|---------------------------------------------|
//! | contact points          | `endpoint`, the Alternator URL              |
//! | keyspace                | `keyspace`, prefixed to physical table names |
//! | local datacenter        | `region`                                    |
//! | plaintext username/password | `access_key_id` / `secret_access_key`   |

mod dynamodb;
mod memory;

pub use dynamodb::DynamoBackend;
pub use memory::MemoryBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::codec::Item;
use crate::error::Result;
use crate::expression::{BoundCondition, KeyCondition};
use crate::schema::{IndexDef, TableSchema};

/// Which backend implementation is in use
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// DynamoDB or a compatible endpoint
    #[default]
    DynamoDb,
    /// In-process emulator
    Memory,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::DynamoDb => f.write_str("dynamodb"),
            BackendKind::Memory => f.write_str("memory"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dynamodb" | "dynamo" => Ok(BackendKind::DynamoDb),
            "memory" | "inmemory" | "in-memory" => Ok(BackendKind::Memory),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

/// Query against a table or one of its indexes
#[derive(Clone, Debug)]
pub struct QueryRequest {
    /// Index to query, `None` for the table itself
    pub index: Option<IndexDef>,
    /// Key condition against the table or index key
    pub key: KeyCondition,
    /// Post-read filter, residual key conjuncts included
    pub filter: Option<BoundCondition>,
    /// Maximum number of items read
    pub limit: usize,
    /// Ascending sort key order when `true`
    pub scan_forward: bool,
    /// Resume after this key
    pub exclusive_start_key: Option<Item>,
}

/// Full table read
#[derive(Clone, Debug)]
pub struct ScanRequest {
    /// Post-read filter
    pub filter: Option<BoundCondition>,
    /// Maximum number of items read
    pub limit: usize,
    /// Resume after this key
    pub exclusive_start_key: Option<Item>,
}

/// One page as returned by a backend
#[derive(Clone, Debug, Default)]
pub struct RawPage {
    /// Items that passed the filter
    pub items: Vec<Item>,
    /// Items read before filtering
    pub scanned_count: usize,
    /// Key to resume from when more items remain
    pub last_evaluated_key: Option<Item>,
}

/// Entry of a batch write request
#[derive(Clone, Debug, PartialEq)]
pub enum WriteRequest {
    /// Store an item
    Put(Item),
    /// Remove the item with this key
    Delete(Item),
}

/// Result of one batch read round
#[derive(Clone, Debug, Default)]
pub struct BatchGetResponse {
    /// Items found, in no particular order
    pub items: Vec<Item>,
    /// Keys the backend deferred
    pub unprocessed_keys: Vec<Item>,
}

/// Storage operations used by the executor.
///
/// Keys passed in are already validated against the schema. Conditions
/// are evaluated against the current item, or an empty item when none
/// exists.
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    /// Backend implementation
    fn kind(&self) -> BackendKind;

    /// Read one item
    async fn get_item(&self, schema: &TableSchema, key: &Item) -> Result<Option<Item>>;

    /// Store an item, replacing any existing one
    async fn put_item(
        &self,
        schema: &TableSchema,
        item: &Item,
        condition: Option<&BoundCondition>,
    ) -> Result<()>;

    /// Merge `patch` into an existing item and return the merged item.
    ///
    /// Fails with `ItemNotFound` when no item has this key.
    async fn update_item(
        &self,
        schema: &TableSchema,
        key: &Item,
        patch: &Item,
        condition: Option<&BoundCondition>,
    ) -> Result<Item>;

    /// Remove an item, returning the removed item if there was one
    async fn delete_item(
        &self,
        schema: &TableSchema,
        key: &Item,
        condition: Option<&BoundCondition>,
    ) -> Result<Option<Item>>;

    /// Read items sharing a partition key
    async fn query(&self, schema: &TableSchema, request: QueryRequest) -> Result<RawPage>;

    /// Read the whole table
    async fn scan(&self, schema: &TableSchema, request: ScanRequest) -> Result<RawPage>;

    /// Read up to one backend batch of keys
    async fn batch_get(&self, schema: &TableSchema, keys: Vec<Item>) -> Result<BatchGetResponse>;

    /// Write up to one backend batch, returning the deferred requests
    async fn batch_write(
        &self,
        schema: &TableSchema,
        requests: Vec<WriteRequest>,
    ) -> Result<Vec<WriteRequest>>;

    /// Create the physical table; `false` when it already existed
    async fn create_table(&self, schema: &TableSchema) -> Result<bool>;

    /// Drop the physical table; `false` when it did not exist
    async fn delete_table(&self, table: &str) -> Result<bool>;

    /// Logical names of existing tables
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Trivial round trip
    async fn ping(&self) -> Result<()>;

    /// Release resources held by the backend
    async fn shutdown(&self) {}
}
