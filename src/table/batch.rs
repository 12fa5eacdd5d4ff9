use futures_util::{StreamExt, TryStreamExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_stream::{self as stream};
use tracing::{debug, instrument, warn};

use crate::backend::{Backend, BatchGetResponse, WriteRequest};
use crate::codec::{Item, NativeItem, decode_item};
use crate::error::{Error, Result};
use crate::schema::{PrimaryKey, TableSchema};
use crate::table::TableClient;
use crate::table::helpers::{
    batch_processor, prepare_item, prepare_key, prepare_patch, retry_config,
};

/// One entry of a [`TableClient::batch_write`] request
#[derive(Clone, Debug, PartialEq)]
pub enum WriteDirective {
    /// Store an item, replacing any item with the same key
    Put(Value),
    /// Merge a patch into an existing item
    Update {
        /// Key of the item to update
        key: Value,
        /// Attributes to replace
        patch: Value,
    },
    /// Remove the item with this key
    Delete(Value),
}

impl WriteDirective {
    /// Put directive
    pub fn put(item: Value) -> Self {
        WriteDirective::Put(item)
    }

    /// Update directive
    pub fn update(key: Value, patch: Value) -> Self {
        WriteDirective::Update { key, patch }
    }

    /// Delete directive
    pub fn delete(key: Value) -> Self {
        WriteDirective::Delete(key)
    }
}

/// Batch write output with per-kind counts and the work left undone
///
/// Items the backend kept deferring after every re-submission are returned
/// in `failed_puts` and `failed_deletes`.
#[must_use = "batch write results contain failed items and metrics that should be checked"]
#[derive(Clone, Debug, Default)]
pub struct BatchWriteOutput {
    /// Number of items stored
    pub processed_puts: usize,
    /// Number of items removed
    pub processed_deletes: usize,
    /// Number of items updated
    pub processed_updates: usize,
    /// Items still unwritten after all re-submissions
    pub failed_puts: Vec<NativeItem>,
    /// Keys still undeleted after all re-submissions
    pub failed_deletes: Vec<NativeItem>,
    /// Total execution time including all retries
    pub total_duration: Duration,
    /// Number of re-submission rounds (0 means none were needed)
    pub retry_count: usize,
}

impl BatchWriteOutput {
    /// Check if all operations were successful
    pub fn is_success(&self) -> bool {
        self.failed_puts.is_empty() && self.failed_deletes.is_empty()
    }

    /// Get total number of entries processed successfully
    pub fn processed_count(&self) -> usize {
        self.processed_puts + self.processed_deletes + self.processed_updates
    }

    /// Get total number of entries that failed
    pub fn failed_count(&self) -> usize {
        self.failed_puts.len() + self.failed_deletes.len()
    }

    /// Get success rate as a percentage (0.0 to 100.0)
    pub fn success_rate(&self) -> f64 {
        let total = self.processed_count() + self.failed_count();
        if total == 0 {
            return 100.0;
        }
        (self.processed_count() as f64 / total as f64) * 100.0
    }
}

/// Batch read output
#[must_use = "batch read results contain unprocessed keys and metrics that should be checked"]
#[derive(Clone, Debug, Default)]
pub struct BatchGetOutput {
    /// Items found, in request order; missing keys are skipped
    pub items: Vec<NativeItem>,
    /// Keys the backend kept deferring after every re-submission
    pub unprocessed_keys: Vec<NativeItem>,
    /// Total execution time including all retries
    pub total_duration: Duration,
    /// Number of re-submission rounds (0 means none were needed)
    pub retry_count: usize,
}

impl BatchGetOutput {
    /// Check if every key was looked up
    pub fn is_success(&self) -> bool {
        self.unprocessed_keys.is_empty()
    }
}

impl TableClient {
    /// Read many items by key.
    ///
    /// Every key is validated before any request is issued; the first bad
    /// key fails the whole call with `BatchValidationFailed`. Duplicate keys
    /// are read once. Keys are sent in chunks of 100 with bounded
    /// concurrency, and keys the backend defers are re-submitted with
    /// exponential backoff.
    #[instrument(skip_all, fields(table = %table, keys = keys.len()))]
    pub async fn batch_get(&self, table: &str, keys: Vec<Value>) -> Result<BatchGetOutput> {
        let start_time = Instant::now();
        let schema = self.registry.resolve(table)?;

        let mut order = Vec::with_capacity(keys.len());
        let mut pending = Vec::new();
        let mut found: HashMap<PrimaryKey, Item> = HashMap::new();
        let mut seen = HashSet::new();

        for (index, key) in keys.into_iter().enumerate() {
            let (key, primary) = prepare_key(&schema, key).map_err(|e| batch_error(table, index, e))?;
            if !seen.insert(primary.clone()) {
                continue;
            }
            order.push(primary.clone());
            match self.cached(table, &primary) {
                Some(item) => {
                    let _ = found.insert(primary, item);
                }
                None => pending.push(key),
            }
        }

        let mut output = BatchGetOutput::default();
        if !pending.is_empty() {
            let generation = self.cache_generation();
            let backend = self.backend().await?;
            let mut result = fetch_keys(&backend, &schema, pending).await?;

            // Retry loop for deferred keys
            while !result.unprocessed_keys.is_empty() && output.retry_count < self.retry.max_retries {
                sleep(retry_config::retry_delay(
                    output.retry_count,
                    self.retry.initial_delay,
                    self.retry.max_delay,
                ))
                .await;
                output.retry_count += 1;

                let unprocessed = std::mem::take(&mut result.unprocessed_keys);
                debug!(keys = unprocessed.len(), attempt = output.retry_count, "re-submitting deferred keys");
                let retry_result = fetch_keys(&backend, &schema, unprocessed).await?;
                result.items.extend(retry_result.items);
                result.unprocessed_keys = retry_result.unprocessed_keys;
            }

            for item in result.items {
                let primary = schema.primary_key(&item)?;
                self.remember(table, primary.clone(), &item, generation);
                let _ = found.insert(primary, item);
            }

            if !result.unprocessed_keys.is_empty() {
                warn!(keys = result.unprocessed_keys.len(), "batch get left keys unprocessed");
            }
            output.unprocessed_keys = result
                .unprocessed_keys
                .iter()
                .map(decode_item)
                .collect::<Result<_>>()?;
        }

        output.items = order
            .iter()
            .filter_map(|primary| found.get(primary))
            .map(decode_item)
            .collect::<Result<_>>()?;
        output.total_duration = start_time.elapsed();
        debug!(found = output.items.len(), "batch get finished");
        Ok(output)
    }

    /// Apply many puts, updates and deletes to one table.
    ///
    /// Every directive is validated before any request is issued: a missing
    /// key attribute anywhere fails the whole batch with
    /// `BatchValidationFailed` and nothing is written. Puts and deletes
    /// naming the same key collapse into the last of them, which is the only
    /// one sent and counted. Past that point the
    /// batch is not atomic. Puts and deletes go out in chunks of 25 with
    /// bounded concurrency and deferred requests are re-submitted with
    /// exponential backoff; updates run as individual strict updates, and
    /// the first failing update aborts the call.
    #[instrument(skip_all, fields(table = %table, directives = directives.len()))]
    pub async fn batch_write(
        &self,
        table: &str,
        directives: Vec<WriteDirective>,
    ) -> Result<BatchWriteOutput> {
        let start_time = Instant::now();
        let schema = self.registry.resolve(table)?;

        let mut requests: Vec<WriteRequest> = Vec::new();
        let mut slots: HashMap<PrimaryKey, usize> = HashMap::new();
        let mut updates = Vec::new();
        let mut touched = Vec::with_capacity(directives.len());

        for (index, directive) in directives.into_iter().enumerate() {
            let prepared = match directive {
                WriteDirective::Put(item) => prepare_item(&schema, item)
                    .map(|(item, primary)| (primary, Some(WriteRequest::Put(item)))),
                WriteDirective::Delete(key) => prepare_key(&schema, key)
                    .map(|(key, primary)| (primary, Some(WriteRequest::Delete(key)))),
                WriteDirective::Update { key, patch } => {
                    prepare_key(&schema, key).and_then(|(key, primary)| {
                        let patch = prepare_patch(&schema, &key, patch)?;
                        updates.push((key, patch));
                        Ok((primary, None))
                    })
                }
            };
            let (primary, request) = prepared.map_err(|e| batch_error(table, index, e))?;
            if let Some(request) = request {
                // one request per key, the last directive wins
                match slots.get(&primary) {
                    Some(&slot) => {
                        debug!(index, "directive replaces an earlier one on the same key");
                        requests[slot] = request;
                    }
                    None => {
                        let _ = slots.insert(primary.clone(), requests.len());
                        requests.push(request);
                    }
                }
            }
            touched.push(primary);
        }

        let outcome = self.apply_batch(&schema, requests, updates).await;
        for primary in &touched {
            self.forget(table, primary);
        }

        let mut output = outcome?;
        output.total_duration = start_time.elapsed();
        if !output.is_success() {
            warn!(
                failed = output.failed_count(),
                "batch write left requests unprocessed"
            );
        }
        debug!(processed = output.processed_count(), "batch write finished");
        Ok(output)
    }

    async fn apply_batch(
        &self,
        schema: &TableSchema,
        requests: Vec<WriteRequest>,
        updates: Vec<(Item, Item)>,
    ) -> Result<BatchWriteOutput> {
        let mut output = BatchWriteOutput::default();
        if requests.is_empty() && updates.is_empty() {
            return Ok(output);
        }

        let backend = self.backend().await?;
        let original_puts = requests
            .iter()
            .filter(|r| matches!(r, WriteRequest::Put(_)))
            .count();
        let original_deletes = requests.len() - original_puts;

        let mut unprocessed = write_requests(&backend, schema, requests).await?;

        // Retry loop for deferred requests
        while !unprocessed.is_empty() && output.retry_count < self.retry.max_retries {
            sleep(retry_config::retry_delay(
                output.retry_count,
                self.retry.initial_delay,
                self.retry.max_delay,
            ))
            .await;
            output.retry_count += 1;

            debug!(requests = unprocessed.len(), attempt = output.retry_count, "re-submitting deferred requests");
            unprocessed = write_requests(&backend, schema, unprocessed).await?;
        }

        for request in unprocessed {
            match request {
                WriteRequest::Put(item) => output.failed_puts.push(decode_item(&item)?),
                WriteRequest::Delete(key) => output.failed_deletes.push(decode_item(&key)?),
            }
        }
        output.processed_puts = original_puts - output.failed_puts.len();
        output.processed_deletes = original_deletes - output.failed_deletes.len();

        let concurrency = updates.len().clamp(1, batch_processor::DEFAULT_CONCURRENCY);
        output.processed_updates = stream::iter(updates.into_iter().map(|(key, patch)| {
            let backend = Arc::clone(&backend);
            async move { backend.update_item(schema, &key, &patch, None).await }
        }))
        .buffer_unordered(concurrency)
        .try_fold(0, |count, _| async move { Ok(count + 1) })
        .await?;

        Ok(output)
    }
}

/// Send keys in backend-sized chunks and gather the responses
async fn fetch_keys(
    backend: &Arc<dyn Backend>,
    schema: &TableSchema,
    keys: Vec<Item>,
) -> Result<BatchGetResponse> {
    let batches: Vec<Vec<Item>> = keys
        .chunks(batch_processor::BATCH_READ_SIZE)
        .map(|chunk| chunk.to_vec())
        .collect();
    let concurrency = batches.len().clamp(1, batch_processor::DEFAULT_CONCURRENCY);

    stream::iter(batches.into_iter().map(|batch| backend.batch_get(schema, batch)))
        .buffer_unordered(concurrency)
        .try_fold(BatchGetResponse::default(), |mut acc, response| async move {
            acc.items.extend(response.items);
            acc.unprocessed_keys.extend(response.unprocessed_keys);
            Ok(acc)
        })
        .await
}

/// Send write requests in backend-sized chunks, returning the deferred ones
async fn write_requests(
    backend: &Arc<dyn Backend>,
    schema: &TableSchema,
    requests: Vec<WriteRequest>,
) -> Result<Vec<WriteRequest>> {
    let batches: Vec<Vec<WriteRequest>> = requests
        .chunks(batch_processor::BATCH_WRITE_SIZE)
        .map(|chunk| chunk.to_vec())
        .collect();
    let concurrency = batches.len().clamp(1, batch_processor::DEFAULT_CONCURRENCY);

    stream::iter(batches.into_iter().map(|batch| backend.batch_write(schema, batch)))
        .buffer_unordered(concurrency)
        .try_fold(Vec::new(), |mut acc, unprocessed| async move {
            acc.extend(unprocessed);
            Ok(acc)
        })
        .await
}

fn batch_error(table: &str, index: usize, source: Error) -> Error {
    Error::BatchValidationFailed {
        table: table.to_string(),
        index,
        source: Box::new(source),
    }
}
