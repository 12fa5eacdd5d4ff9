use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::{self as stream};
use tracing::{debug, error, instrument, warn};

use crate::backend::Backend;
use crate::codec::{Item, NativeItem, decode_item, normalize_item};
use crate::error::{Error, Result};
use crate::expression::{BoundCondition, WriteCondition};
use crate::schema::{PrimaryKey, TableSchema};
use crate::table::TableClient;
use crate::table::helpers::{batch_processor, prepare_key, prepare_patch};
use crate::table::operations::bind_write_condition;

/// Lifecycle of a transactional write
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    /// Not started
    Pending,
    /// Checking tables, keys and conditions
    Validating,
    /// Writing operations one by one
    Applying,
    /// Every operation applied
    Committed,
    /// An operation failed and the applied ones were reverted
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Pending => "pending",
            TransactionState::Validating => "validating",
            TransactionState::Applying => "applying",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled back",
        };
        f.write_str(name)
    }
}

/// One operation of a transactional write
#[derive(Clone, Debug, PartialEq)]
pub enum TransactWriteOp {
    /// Store an item
    Put {
        /// Target table
        table: String,
        /// Item to store
        item: Value,
        /// Precondition on the current item
        condition: Option<WriteCondition>,
    },
    /// Merge a patch into an existing item
    Update {
        /// Target table
        table: String,
        /// Key of the item
        key: Value,
        /// Attributes to replace
        patch: Value,
        /// Precondition on the current item
        condition: Option<WriteCondition>,
    },
    /// Remove an item
    Delete {
        /// Target table
        table: String,
        /// Key of the item
        key: Value,
        /// Precondition on the current item
        condition: Option<WriteCondition>,
    },
}

impl TransactWriteOp {
    /// Unconditional put
    pub fn put(table: impl Into<String>, item: Value) -> Self {
        TransactWriteOp::Put {
            table: table.into(),
            item,
            condition: None,
        }
    }

    /// Unconditional strict update
    pub fn update(table: impl Into<String>, key: Value, patch: Value) -> Self {
        TransactWriteOp::Update {
            table: table.into(),
            key,
            patch,
            condition: None,
        }
    }

    /// Unconditional delete
    pub fn delete(table: impl Into<String>, key: Value) -> Self {
        TransactWriteOp::Delete {
            table: table.into(),
            key,
            condition: None,
        }
    }

    /// Guard the operation with a condition
    pub fn with_condition(mut self, new: impl Into<WriteCondition>) -> Self {
        match &mut self {
            TransactWriteOp::Put { condition, .. }
            | TransactWriteOp::Update { condition, .. }
            | TransactWriteOp::Delete { condition, .. } => *condition = Some(new.into()),
        }
        self
    }

    /// Target table
    pub fn table(&self) -> &str {
        match self {
            TransactWriteOp::Put { table, .. }
            | TransactWriteOp::Update { table, .. }
            | TransactWriteOp::Delete { table, .. } => table,
        }
    }
}

/// Result of a committed transactional write
#[must_use]
#[derive(Clone, Debug)]
pub struct TransactWriteOutput {
    /// Final state, always [`TransactionState::Committed`]
    pub state: TransactionState,
    /// Number of operations applied
    pub applied: usize,
    /// Total execution time
    pub total_duration: Duration,
}

/// One read of a transactional read
#[derive(Clone, Debug, PartialEq)]
pub struct TransactGetOp {
    /// Source table
    pub table: String,
    /// Key of the item
    pub key: Value,
}

impl TransactGetOp {
    /// Read `key` from `table`
    pub fn new(table: impl Into<String>, key: Value) -> Self {
        Self {
            table: table.into(),
            key,
        }
    }
}

/// Outcome of one read in a transactional read
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TransactGetResult {
    /// Source table
    pub table: String,
    /// Whether the read itself succeeded
    pub success: bool,
    /// The item, `None` when absent or when the read failed
    pub item: Option<NativeItem>,
    /// Failure description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a transactional read
#[must_use = "transactional reads report per-operation failures that should be checked"]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TransactGetOutput {
    /// Whether every read succeeded
    pub success: bool,
    /// One entry per operation, in request order
    pub results: Vec<TransactGetResult>,
}

enum Action {
    Put(Item),
    Update(Item),
    Delete,
}

struct PreparedWrite {
    schema: Arc<TableSchema>,
    key: Item,
    primary: PrimaryKey,
    action: Action,
    condition: Option<BoundCondition>,
}

impl PreparedWrite {
    async fn apply(&self, backend: &dyn Backend) -> Result<()> {
        let condition = self.condition.as_ref();
        match &self.action {
            Action::Put(item) => backend.put_item(&self.schema, item, condition).await,
            Action::Update(patch) => backend
                .update_item(&self.schema, &self.key, patch, condition)
                .await
                .map(|_| ()),
            Action::Delete => backend
                .delete_item(&self.schema, &self.key, condition)
                .await
                .map(|_| ()),
        }
    }

    /// Put back what was stored before this operation ran
    async fn restore(&self, backend: &dyn Backend, before: Option<&Item>) -> Result<()> {
        match before {
            Some(item) => backend.put_item(&self.schema, item, None).await,
            None => backend
                .delete_item(&self.schema, &self.key, None)
                .await
                .map(|_| ()),
        }
    }
}

impl TableClient {
    /// Apply writes across one or more tables as a single unit.
    ///
    /// Every operation is validated before any request is issued. The
    /// operations are then applied in order, each after a snapshot of the
    /// item it targets. When one fails, the operations already applied are
    /// reverted in reverse order from their snapshots and the call fails
    /// with `TransactionCanceled`. If reverting fails as well, the call
    /// fails with `RollbackIncomplete` listing the compensation errors.
    ///
    /// Isolation is not provided: concurrent writers may observe
    /// intermediate states while the transaction is applying.
    #[instrument(skip_all, fields(operations = ops.len()))]
    pub async fn transact_write(&self, ops: Vec<TransactWriteOp>) -> Result<TransactWriteOutput> {
        let start_time = Instant::now();
        let mut state = TransactionState::Pending;
        advance(&mut state, TransactionState::Validating);

        let prepared = ops
            .into_iter()
            .enumerate()
            .map(|(index, op)| {
                self.prepare_write(op).inspect_err(|e| {
                    debug!(index, error = %e, "transaction rejected during validation");
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let backend = self.backend().await?;
        advance(&mut state, TransactionState::Applying);

        let mut applied: Vec<(&PreparedWrite, Option<Item>)> = Vec::with_capacity(prepared.len());
        let mut failure = None;
        for (index, op) in prepared.iter().enumerate() {
            let step = async {
                let before = backend.get_item(&op.schema, &op.key).await?;
                op.apply(backend.as_ref()).await?;
                Ok::<_, Error>(before)
            };
            match step.await {
                Ok(before) => applied.push((op, before)),
                Err(e) => {
                    failure = Some((index, e));
                    break;
                }
            }
        }

        let outcome = match failure {
            None => {
                advance(&mut state, TransactionState::Committed);
                Ok(TransactWriteOutput {
                    state,
                    applied: applied.len(),
                    total_duration: start_time.elapsed(),
                })
            }
            Some((index, source)) => {
                warn!(index, error = %source, "transaction operation failed, rolling back");
                let failures = compensate(backend.as_ref(), &applied).await;
                advance(&mut state, TransactionState::RolledBack);

                let source = Box::new(source);
                if failures.is_empty() {
                    Err(Error::TransactionCanceled { index, source })
                } else {
                    Err(Error::RollbackIncomplete {
                        index,
                        source,
                        failures,
                    })
                }
            }
        };

        for op in &prepared {
            self.forget(op.schema.name(), &op.primary);
        }
        outcome
    }

    fn prepare_write(&self, op: TransactWriteOp) -> Result<PreparedWrite> {
        let schema = self.registry.resolve(op.table())?;
        let (key, primary, action, condition) = match op {
            TransactWriteOp::Put {
                item, condition, ..
            } => {
                let item = normalize_item(item)?;
                let primary = schema.primary_key(&item)?;
                let key = schema.extract_key(&item)?;
                (key, primary, Action::Put(item), condition)
            }
            TransactWriteOp::Update {
                key,
                patch,
                condition,
                ..
            } => {
                let (key, primary) = prepare_key(&schema, key)?;
                let patch = prepare_patch(&schema, &key, patch)?;
                (key, primary, Action::Update(patch), condition)
            }
            TransactWriteOp::Delete { key, condition, .. } => {
                let (key, primary) = prepare_key(&schema, key)?;
                (key, primary, Action::Delete, condition)
            }
        };

        Ok(PreparedWrite {
            condition: bind_write_condition(condition.as_ref())?,
            schema,
            key,
            primary,
            action,
        })
    }

    /// Read several items, possibly across tables, as one unit.
    ///
    /// Keys are validated up front; reads then run concurrently and the
    /// results come back in request order. A failed read is reported in its
    /// entry and clears the overall `success` flag. Reads bypass the item
    /// cache.
    #[instrument(skip_all, fields(operations = ops.len()))]
    pub async fn transact_get(&self, ops: Vec<TransactGetOp>) -> Result<TransactGetOutput> {
        let prepared = ops
            .into_iter()
            .map(|op| {
                let schema = self.registry.resolve(&op.table)?;
                let (key, _) = prepare_key(&schema, op.key)?;
                Ok::<_, Error>((op.table, schema, key))
            })
            .collect::<Result<Vec<_>>>()?;

        let backend = self.backend().await?;
        let concurrency = prepared.len().clamp(1, batch_processor::DEFAULT_CONCURRENCY);

        let results: Vec<TransactGetResult> = stream::iter(prepared.into_iter().map(
            |(table, schema, key)| {
                let backend = Arc::clone(&backend);
                async move {
                    let read = match backend.get_item(&schema, &key).await {
                        Ok(item) => item.as_ref().map(decode_item).transpose(),
                        Err(e) => Err(e),
                    };
                    match read {
                        Ok(item) => TransactGetResult {
                            table,
                            success: true,
                            item,
                            error: None,
                        },
                        Err(e) => {
                            warn!(table = %table, error = %e, "transactional read failed");
                            TransactGetResult {
                                table,
                                success: false,
                                item: None,
                                error: Some(e.to_string()),
                            }
                        }
                    }
                }
            },
        ))
        .buffered(concurrency)
        .collect()
        .await;

        let success = results.iter().all(|result| result.success);
        debug!(success, "transactional read finished");
        Ok(TransactGetOutput { success, results })
    }
}

fn advance(state: &mut TransactionState, next: TransactionState) {
    debug!(from = %state, to = %next, "transaction state");
    *state = next;
}

/// Revert applied operations in reverse order, collecting failures
async fn compensate(backend: &dyn Backend, applied: &[(&PreparedWrite, Option<Item>)]) -> Vec<Error> {
    let mut failures = Vec::new();
    for (op, before) in applied.iter().rev() {
        warn!(table = op.schema.name(), restore = before.is_some(), "reverting transaction operation");
        if let Err(e) = op.restore(backend, before.as_ref()).await {
            error!(table = op.schema.name(), error = %e, "compensation failed");
            failures.push(e);
        }
    }
    failures
}
