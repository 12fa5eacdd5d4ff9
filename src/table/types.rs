use std::time::Duration;

use crate::backend::RawPage;
use crate::codec::{NativeItem, decode_item};
use crate::error::Result;
use crate::expression::{AttributeNames, Condition, ExpressionValues};

/// Most items a single query or scan reads.
///
/// Results beyond this are never dropped silently: the page comes back
/// with `truncated` set and a key to continue from.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Options for [`TableClient::query`](crate::TableClient::query)
#[derive(Clone, Debug, PartialEq)]
pub struct QueryOptions {
    /// Secondary index to query instead of the table
    pub index_name: Option<String>,
    /// Post-read filter, bound against the same values as the key condition
    pub filter: Option<Condition>,
    /// `#alias` to attribute name, shared by key condition and filter
    pub attribute_names: AttributeNames,
    /// Page size, capped at [`MAX_PAGE_SIZE`]
    pub limit: Option<usize>,
    /// Ascending sort key order when `true` (the default)
    pub scan_forward: bool,
    /// Continue after this key, taken from a previous page
    pub exclusive_start_key: Option<NativeItem>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            index_name: None,
            filter: None,
            attribute_names: AttributeNames::new(),
            limit: None,
            scan_forward: true,
            exclusive_start_key: None,
        }
    }
}

impl QueryOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Query a secondary index
    pub fn index(mut self, index_name: impl Into<String>) -> Self {
        self.index_name = Some(index_name.into());
        self
    }

    /// Filter the items read
    pub fn filter(mut self, filter: Condition) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Bind an attribute name alias
    pub fn name(mut self, alias: impl Into<String>, attribute: impl Into<String>) -> Self {
        let _ = self.attribute_names.insert(alias.into(), attribute.into());
        self
    }

    /// Read at most `limit` items
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Descending sort key order
    pub fn descending(mut self) -> Self {
        self.scan_forward = false;
        self
    }

    /// Continue after `key`
    pub fn start_after(mut self, key: Option<NativeItem>) -> Self {
        self.exclusive_start_key = key;
        self
    }
}

/// Options for [`TableClient::scan_with`](crate::TableClient::scan_with)
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanOptions {
    /// Post-read filter
    pub filter: Option<Condition>,
    /// Placeholder values for the filter
    pub values: ExpressionValues,
    /// `#alias` to attribute name
    pub attribute_names: AttributeNames,
    /// Page size, capped at [`MAX_PAGE_SIZE`]
    pub limit: Option<usize>,
    /// Continue after this key, taken from a previous page
    pub exclusive_start_key: Option<NativeItem>,
}

pub(crate) fn page_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(MAX_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

/// One page of query or scan results
#[must_use = "query results should be used or you'll lose the fetched data"]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Page {
    /// Items that passed the filter
    pub items: Vec<NativeItem>,
    /// Number of items returned
    pub count: usize,
    /// Number of items read before filtering
    pub scanned_count: usize,
    /// Whether more items remain past this page
    pub truncated: bool,
    /// Key to pass as `exclusive_start_key` for the next page
    pub last_evaluated_key: Option<NativeItem>,
}

impl Page {
    pub(crate) fn from_raw(raw: RawPage) -> Result<Self> {
        let items = raw
            .items
            .iter()
            .map(decode_item)
            .collect::<Result<Vec<_>>>()?;
        let last_evaluated_key = raw.last_evaluated_key.as_ref().map(decode_item).transpose()?;

        Ok(Self {
            count: items.len(),
            items,
            scanned_count: raw.scanned_count,
            truncated: last_evaluated_key.is_some(),
            last_evaluated_key,
        })
    }

    /// Whether the page holds no items
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Backoff for re-submitting work a backend deferred in a batch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of re-submissions
    pub max_retries: usize,
    /// Delay before the first re-submission
    pub initial_delay: Duration,
    /// Upper bound for the delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(2000),
        }
    }
}
