use futures_util::stream::{self, Stream, TryStreamExt};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::backend::{QueryRequest, ScanRequest};
use crate::codec::{Item, NativeItem, decode_item, encode_item, normalize_item};
use crate::error::{Error, Result};
use crate::expression::{
    BoundCondition, Condition, ExpressionValues, KeyCondition, WriteCondition, ensure_non_key_filter,
};
use crate::table::TableClient;
use crate::table::helpers::{prepare_key, prepare_patch};
use crate::table::types::{Page, QueryOptions, ScanOptions, page_limit};

impl TableClient {
    /// Read one item by key.
    ///
    /// `key` must hold the table's key attributes; any other attribute is
    /// ignored. Absence is `Ok(None)`, never an error.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # async fn example(client: wide_table::TableClient) -> wide_table::Result<()> {
    /// use serde_json::json;
    ///
    /// let order = client
    ///     .get("orders", json!({ "pk": "user#1", "sk": "order#1" }))
    ///     .await?;
    /// if let Some(order) = order {
    ///     println!("amount: {}", order["amount"]);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all, fields(table = %table))]
    pub async fn get(&self, table: &str, key: Value) -> Result<Option<NativeItem>> {
        let schema = self.registry.resolve(table)?;
        let (key, primary) = prepare_key(&schema, key)?;

        if let Some(item) = self.cached(table, &primary) {
            debug!("cache hit");
            return decode_item(&item).map(Some);
        }

        let generation = self.cache_generation();
        let backend = self.backend().await?;
        match backend.get_item(&schema, &key).await? {
            Some(item) => {
                self.remember(table, primary, &item, generation);
                decode_item(&item).map(Some)
            }
            None => {
                debug!("item not found");
                Ok(None)
            }
        }
    }

    /// Store an item, replacing any item with the same key.
    ///
    /// Returns the stored item. Fails with `MissingKeyAttribute` before any
    /// request when a key attribute is absent or null.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # async fn example(client: wide_table::TableClient) -> wide_table::Result<()> {
    /// use serde_json::json;
    ///
    /// client
    ///     .put("orders", json!({ "pk": "user#1", "sk": "order#1", "amount": 10 }))
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all, fields(table = %table))]
    pub async fn put(&self, table: &str, item: Value) -> Result<NativeItem> {
        self.put_encoded(table, normalize_item(item)?, None).await
    }

    /// Store an item only if `condition` holds for the current item.
    ///
    /// The condition is evaluated against an empty item when nothing is
    /// stored under the key, so [`WriteCondition::not_exists`] gives
    /// insert-only semantics. Fails with `ConditionalWriteFailed` otherwise.
    #[instrument(skip_all, fields(table = %table))]
    pub async fn put_if(
        &self,
        table: &str,
        item: Value,
        condition: &WriteCondition,
    ) -> Result<NativeItem> {
        self.put_encoded(table, normalize_item(item)?, Some(condition))
            .await
    }

    pub(crate) async fn put_encoded(
        &self,
        table: &str,
        item: Item,
        condition: Option<&WriteCondition>,
    ) -> Result<NativeItem> {
        let schema = self.registry.resolve(table)?;
        let primary = schema.primary_key(&item)?;
        let condition = bind_write_condition(condition)?;
        let stored = decode_item(&item)?;

        let backend = self.backend().await?;
        let result = backend.put_item(&schema, &item, condition.as_ref()).await;
        self.forget(table, &primary);
        result?;

        debug!("item stored");
        Ok(stored)
    }

    /// Merge `patch` into an existing item and return the merged item.
    ///
    /// Only the attributes named in `patch` change. Updates are strict: a
    /// key with no stored item fails with `ItemNotFound`. Key attributes
    /// in `patch` must repeat the key; changing them is `InvalidExpression`.
    #[instrument(skip_all, fields(table = %table))]
    pub async fn update(&self, table: &str, key: Value, patch: Value) -> Result<NativeItem> {
        self.update_inner(table, key, patch, None).await
    }

    /// [`update`](Self::update) guarded by a condition on the current item
    #[instrument(skip_all, fields(table = %table))]
    pub async fn update_if(
        &self,
        table: &str,
        key: Value,
        patch: Value,
        condition: &WriteCondition,
    ) -> Result<NativeItem> {
        self.update_inner(table, key, patch, Some(condition)).await
    }

    async fn update_inner(
        &self,
        table: &str,
        key: Value,
        patch: Value,
        condition: Option<&WriteCondition>,
    ) -> Result<NativeItem> {
        let schema = self.registry.resolve(table)?;
        let (key, primary) = prepare_key(&schema, key)?;
        let patch = prepare_patch(&schema, &key, patch)?;
        let condition = bind_write_condition(condition)?;

        let backend = self.backend().await?;
        let result = backend
            .update_item(&schema, &key, &patch, condition.as_ref())
            .await;
        self.forget(table, &primary);

        let merged = result?;
        debug!(attributes = patch.len(), "item updated");
        decode_item(&merged)
    }

    /// Remove an item.
    ///
    /// Idempotent: returns `true` when an item was removed and `false` when
    /// there was nothing to remove.
    #[instrument(skip_all, fields(table = %table))]
    pub async fn delete(&self, table: &str, key: Value) -> Result<bool> {
        self.delete_inner(table, key, None).await
    }

    /// [`delete`](Self::delete) guarded by a condition on the current item
    #[instrument(skip_all, fields(table = %table))]
    pub async fn delete_if(
        &self,
        table: &str,
        key: Value,
        condition: &WriteCondition,
    ) -> Result<bool> {
        self.delete_inner(table, key, Some(condition)).await
    }

    async fn delete_inner(
        &self,
        table: &str,
        key: Value,
        condition: Option<&WriteCondition>,
    ) -> Result<bool> {
        let schema = self.registry.resolve(table)?;
        let (key, primary) = prepare_key(&schema, key)?;
        let condition = bind_write_condition(condition)?;

        let backend = self.backend().await?;
        let result = backend
            .delete_item(&schema, &key, condition.as_ref())
            .await;
        self.forget(table, &primary);

        let removed = result?.is_some();
        debug!(removed, "delete finished");
        Ok(removed)
    }

    /// Query items sharing a partition key.
    ///
    /// `condition` must contain an equality on the partition key of the
    /// table, or of the index named in `options`. A constraint on the sort
    /// key narrows the read; every other clause, and `options.filter`, is
    /// applied after the read. Placeholders in both are resolved from
    /// `values`.
    ///
    /// Items come back in sort key order (reversed with
    /// [`QueryOptions::descending`]). A page holds at most
    /// [`MAX_PAGE_SIZE`](crate::MAX_PAGE_SIZE) items read; when more remain the page is
    /// marked `truncated` and carries the key to continue from.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # async fn example(client: wide_table::TableClient) -> wide_table::Result<()> {
    /// use serde_json::json;
    /// use wide_table::{Condition, QueryOptions, values};
    ///
    /// let condition = Condition::eq("pk", ":pk").and(Condition::range("createdAt", ":from", ":to"));
    /// let values = values([(":pk", json!("user#1")), (":from", json!("2024-01-01"))]);
    ///
    /// let page = client
    ///     .query("orders", &condition, &values, QueryOptions::new().limit(50))
    ///     .await?;
    /// println!("{} orders, more: {}", page.count, page.truncated);
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all, fields(table = %table, index = ?options.index_name))]
    pub async fn query(
        &self,
        table: &str,
        condition: &Condition,
        values: &ExpressionValues,
        options: QueryOptions,
    ) -> Result<Page> {
        let schema = self.registry.resolve(table)?;
        let index = match options.index_name.as_deref() {
            Some(name) => Some(schema.index(name)?.clone()),
            None => None,
        };
        let (partition_key, sort_key) = match &index {
            Some(index) => (index.partition_key(), index.sort_key()),
            None => (schema.partition_key(), schema.sort_key()),
        };

        let names = &options.attribute_names;
        let bound = condition.bind(values, names)?.ok_or_else(|| {
            Error::InvalidExpression("query needs a key condition".to_string())
        })?;
        let mut key = KeyCondition::split(bound, partition_key, sort_key)?;

        let filter = match &options.filter {
            Some(filter) => filter.bind(values, names)?,
            None => None,
        };
        if let Some(filter) = &filter {
            ensure_non_key_filter(filter, partition_key, sort_key)?;
        }
        let filter = BoundCondition::all(key.residual.take().into_iter().chain(filter).collect());
        let exclusive_start_key = options
            .exclusive_start_key
            .as_ref()
            .map(encode_item)
            .transpose()?;

        let request = QueryRequest {
            index,
            key,
            filter,
            limit: page_limit(options.limit),
            scan_forward: options.scan_forward,
            exclusive_start_key,
        };

        let backend = self.backend().await?;
        let page = Page::from_raw(backend.query(&schema, request).await?)?;
        debug!(
            count = page.count,
            scanned = page.scanned_count,
            truncated = page.truncated,
            "query finished"
        );
        Ok(page)
    }

    /// Query every page and collect all matching items
    pub async fn query_all(
        &self,
        table: &str,
        condition: &Condition,
        values: &ExpressionValues,
        options: QueryOptions,
    ) -> Result<Vec<NativeItem>> {
        self.query_stream(table, condition, values, options)
            .try_collect()
            .await
    }

    /// First item matching a query, if any
    pub async fn query_one(
        &self,
        table: &str,
        condition: &Condition,
        values: &ExpressionValues,
        options: QueryOptions,
    ) -> Result<Option<NativeItem>> {
        let mut items = std::pin::pin!(self.query_stream(table, condition, values, options));
        items.try_next().await
    }

    /// Number of items matching a query, across all pages
    pub async fn count(
        &self,
        table: &str,
        condition: &Condition,
        values: &ExpressionValues,
        options: QueryOptions,
    ) -> Result<usize> {
        self.query_stream(table, condition, values, options)
            .try_fold(0, |count, _| async move { Ok(count + 1) })
            .await
    }

    /// Stream matching items, fetching pages as the stream is polled.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # async fn example(client: wide_table::TableClient) -> wide_table::Result<()> {
    /// use futures_util::TryStreamExt;
    /// use serde_json::json;
    /// use wide_table::{Condition, QueryOptions, values};
    ///
    /// let condition = Condition::eq("pk", ":pk");
    /// let values = values([(":pk", json!("user#1"))]);
    /// let mut orders = std::pin::pin!(client.query_stream("orders", &condition, &values, QueryOptions::new()));
    ///
    /// while let Some(order) = orders.try_next().await? {
    ///     println!("{order:?}");
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn query_stream<'a>(
        &'a self,
        table: &'a str,
        condition: &'a Condition,
        values: &'a ExpressionValues,
        options: QueryOptions,
    ) -> impl Stream<Item = Result<NativeItem>> + Send + 'a {
        stream::try_unfold(Some(options), move |next| async move {
            let Some(options) = next else {
                return Ok::<_, Error>(None);
            };

            let page = self.query(table, condition, values, options.clone()).await?;
            let next = page
                .last_evaluated_key
                .clone()
                .map(|key| options.start_after(Some(key)));

            Ok(Some((stream::iter(page.items.into_iter().map(Ok::<_, Error>)), next)))
        })
        .try_flatten()
    }

    /// Read the whole table, optionally filtered.
    ///
    /// Every item is read whether or not it passes the filter. Intended for
    /// small tables and maintenance paths.
    #[instrument(skip_all, fields(table = %table))]
    pub async fn scan(
        &self,
        table: &str,
        filter: Option<&Condition>,
        values: &ExpressionValues,
    ) -> Result<Page> {
        let options = ScanOptions {
            filter: filter.cloned(),
            values: values.clone(),
            ..ScanOptions::default()
        };
        self.scan_with(table, options).await
    }

    /// Scan with paging and attribute name aliases
    #[instrument(skip_all, fields(table = %table))]
    pub async fn scan_with(&self, table: &str, options: ScanOptions) -> Result<Page> {
        let schema = self.registry.resolve(table)?;
        let filter = match &options.filter {
            Some(filter) => filter.bind(&options.values, &options.attribute_names)?,
            None => None,
        };
        let exclusive_start_key = options
            .exclusive_start_key
            .as_ref()
            .map(encode_item)
            .transpose()?;

        let request = ScanRequest {
            filter,
            limit: page_limit(options.limit),
            exclusive_start_key,
        };

        let backend = self.backend().await?;
        let page = Page::from_raw(backend.scan(&schema, request).await?)?;
        debug!(
            count = page.count,
            scanned = page.scanned_count,
            truncated = page.truncated,
            "scan finished"
        );
        Ok(page)
    }

    /// Scan every page and collect all matching items
    pub async fn scan_all(&self, table: &str, mut options: ScanOptions) -> Result<Vec<NativeItem>> {
        let mut items = Vec::new();
        loop {
            let page = self.scan_with(table, options.clone()).await?;
            items.extend(page.items);
            match page.last_evaluated_key {
                Some(key) => options.exclusive_start_key = Some(key),
                None => return Ok(items),
            }
        }
    }
}

pub(crate) fn bind_write_condition(
    condition: Option<&WriteCondition>,
) -> Result<Option<BoundCondition>> {
    match condition {
        Some(condition) => condition.bind(),
        None => Ok(None),
    }
}
