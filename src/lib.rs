//! # Wide Table
//!
//! DynamoDB-style table access over a DynamoDB-compatible endpoint or an
//! in-process emulator:
//! - Schema registry with global secondary indexes
//! - Lossless marshalling between JSON values and the typed wire format
//! - Condition and filter expressions built as a small AST
//! - Get, put, update, delete, query and scan with explicit pagination
//! - Batch reads and writes with validation up front
//! - Multi-item transactional writes with rollback
//!
//! ## Features
//!
//! - **No hidden globals**: the registry and the session are values you
//!   construct and pass to a [`TableClient`]
//! - **Two backends, one contract**: [`BackendKind::DynamoDb`] and
//!   [`BackendKind::Memory`] behave the same for every operation
//! - **Async-first**: built on `tokio` and `aws-sdk-dynamodb`
//! - **Typed records**: any `serde` type can be stored through [`Record`]
//!
//! ## Quick Start
//!
//! ```rust
//! use serde_json::json;
//! use wide_table::{ClientConfig, Condition, QueryOptions, SchemaRegistry, TableClient, TableSchema, values};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> wide_table::Result<()> {
//! let registry = SchemaRegistry::new();
//! registry.register(TableSchema::new("orders", "pk").with_sort_key("sk"))?;
//!
//! let client = TableClient::from_config(ClientConfig::memory(), registry);
//! client
//!     .put("orders", json!({ "pk": "user#1", "sk": "order#1", "amount": 10 }))
//!     .await?;
//!
//! let page = client
//!     .query(
//!         "orders",
//!         &Condition::eq("pk", ":pk"),
//!         &values([(":pk", json!("user#1"))]),
//!         QueryOptions::new(),
//!     )
//!     .await?;
//! assert_eq!(page.items[0]["amount"], 10);
//!
//! assert!(client.delete("orders", json!({ "pk": "user#1", "sk": "order#1" })).await?);
//! # Ok(())
//! # }
//! ```
#![deny(
    warnings,
    bad_style,
    dead_code,
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    unconditional_recursion,
    unused,
    unused_allocation,
    unused_comparisons,
    unused_parens,
    while_true,
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    deprecated,
    unknown_lints,
    unreachable_code,
    unused_mut
)]

mod error;
pub use error::{Error, OperationKind, Result};

/// Storage backends
pub mod backend;

/// Read-through item cache
pub mod cache;

/// Value codec
pub mod codec;

/// Client configuration
pub mod config;

/// Condition and filter expressions
pub mod expression;

/// Typed records
pub mod record;

/// Table schemas and the schema registry
pub mod schema;

/// Session lifecycle
pub mod session;

/// Table setup utilities for development and testing
pub mod setup;

/// Operation executor
pub mod table;

// Re-export main types for convenience
pub use backend::{Backend, BackendKind, DynamoBackend, MemoryBackend};
pub use codec::{Item, NativeItem, TypedValue, decode, decode_item, encode, encode_item, is_encoded};
pub use config::ClientConfig;
pub use expression::{AttributeNames, Comparator, Condition, ExpressionValues, WriteCondition, values};
pub use record::Record;
pub use schema::{IndexDef, Projection, SchemaRegistry, TableDefinition, TableSchema};
pub use session::{HealthState, HealthStatus, SessionManager};
pub use table::{
    BatchGetOutput, BatchWriteOutput, MAX_PAGE_SIZE, Page, QueryOptions, RetryConfig, ScanOptions,
    TableClient, TransactGetOp, TransactGetOutput, TransactGetResult, TransactWriteOp,
    TransactWriteOutput, TransactionState, WriteDirective,
};

// Re-export the SDK client for building a DynamoBackend by hand
pub use aws_sdk_dynamodb::Client as DynamoDbClient;
