use serde_json::Value;

use crate::codec::{Item, normalize_item};
use crate::error::{Error, Result};
use crate::schema::{PrimaryKey, TableSchema};

/// Backoff for batch re-submissions
pub(crate) mod retry_config {
    use std::time::Duration;

    /// Delay before re-submission `attempt` (0-based): doubles each time, capped at `max`
    pub(crate) fn retry_delay(attempt: usize, initial: Duration, max: Duration) -> Duration {
        let factor = 2u32.saturating_pow(u32::try_from(attempt).unwrap_or(u32::MAX));
        initial.saturating_mul(factor).min(max)
    }
}

/// Chunking limits for batch requests
pub(crate) mod batch_processor {
    /// Keys per batch read request
    pub(crate) const BATCH_READ_SIZE: usize = 100;
    /// Requests per batch write request
    pub(crate) const BATCH_WRITE_SIZE: usize = 25;
    /// Batch requests in flight at once
    pub(crate) const DEFAULT_CONCURRENCY: usize = 10;
}

/// Encode and validate a key, returning its key attributes and canonical form.
pub(crate) fn prepare_key(schema: &TableSchema, key: Value) -> Result<(Item, PrimaryKey)> {
    let key = schema.extract_key(&normalize_item(key)?)?;
    let primary = schema.primary_key(&key)?;
    Ok((key, primary))
}

/// Encode and validate a full item.
pub(crate) fn prepare_item(schema: &TableSchema, item: Value) -> Result<(Item, PrimaryKey)> {
    let item = normalize_item(item)?;
    let primary = schema.primary_key(&item)?;
    Ok((item, primary))
}

/// Encode a patch, dropping key attributes that repeat the key.
///
/// Key attributes cannot be changed by an update; a patch that tries is
/// rejected.
pub(crate) fn prepare_patch(schema: &TableSchema, key: &Item, patch: Value) -> Result<Item> {
    let mut patch = normalize_item(patch)?;
    let key_attributes: Vec<String> = patch
        .keys()
        .filter(|name| schema.is_key_attribute(name))
        .cloned()
        .collect();

    for name in key_attributes {
        let value = patch.remove(&name);
        let unchanged = match (value.as_ref(), key.get(&name)) {
            (Some(new), Some(current)) => new.same_value(current),
            _ => false,
        };
        if !unchanged {
            return Err(Error::InvalidExpression(format!(
                "key attribute '{name}' of table '{}' cannot be updated",
                schema.name()
            )));
        }
    }

    Ok(patch)
}
