//! In-process emulator backend.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    Backend, BackendKind, BatchGetResponse, QueryRequest, RawPage, ScanRequest, WriteRequest,
};
use crate::codec::{Item, KeyPart};
use crate::error::{Error, OperationKind, Result};
use crate::expression::BoundCondition;
use crate::schema::{IndexDef, PrimaryKey, TableSchema};

/// Sort position of an item within a query or scan result.
type Position = (Option<KeyPart>, PrimaryKey);

#[derive(Debug, Default)]
struct MemoryTable {
    items: BTreeMap<PrimaryKey, Item>,
}

/// Storage backend keeping every table in memory.
///
/// Clones share the same data. Tables spring into existence on first write
/// and are kept ordered by primary key, so queries return items in sort key
/// order just like the real service.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    tables: Arc<RwLock<HashMap<String, MemoryTable>>>,
}

impl MemoryBackend {
    /// Empty emulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items stored in `table`
    pub async fn item_count(&self, table: &str) -> usize {
        self.tables
            .read()
            .await
            .get(table)
            .map_or(0, |t| t.items.len())
    }
}

fn check_condition(
    schema: &TableSchema,
    operation: OperationKind,
    condition: Option<&BoundCondition>,
    current: Option<&Item>,
) -> Result<()> {
    let Some(condition) = condition else {
        return Ok(());
    };

    let empty = Item::new();
    if condition.evaluate(current.unwrap_or(&empty)) {
        Ok(())
    } else {
        Err(Error::ConditionalWriteFailed {
            table: schema.name().to_string(),
            operation,
        })
    }
}

fn key_attributes(schema: &TableSchema, index: Option<&IndexDef>, item: &Item) -> Item {
    item.iter()
        .filter(|(name, _)| {
            schema.is_key_attribute(name)
                || index.is_some_and(|index| {
                    index.partition_key() == name.as_str()
                        || index.sort_key() == Some(name.as_str())
                })
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn start_position(
    schema: &TableSchema,
    index: Option<&IndexDef>,
    start: Option<&Item>,
) -> Result<Option<Position>> {
    let Some(start) = start else {
        return Ok(None);
    };
    let primary = schema.primary_key(start)?;
    let index_sort = index
        .and_then(IndexDef::sort_key)
        .and_then(|attribute| start.get(attribute))
        .and_then(KeyPart::from_typed);
    Ok(Some((index_sort, primary)))
}

/// Apply the start key, limit and filter to ordered candidates.
fn paginate(
    candidates: Vec<(Position, Item)>,
    start: Option<Position>,
    forward: bool,
    limit: usize,
    filter: Option<&BoundCondition>,
    key_of: impl Fn(&Item) -> Item,
) -> RawPage {
    let mut remaining = candidates
        .into_iter()
        .filter(|(position, _)| match &start {
            None => true,
            Some(start) if forward => position > start,
            Some(start) => position < start,
        })
        .peekable();

    let mut page = RawPage::default();
    let mut last = None;
    while page.scanned_count < limit {
        let Some((_, item)) = remaining.next() else {
            break;
        };
        page.scanned_count += 1;
        if filter.is_none_or(|f| f.evaluate(&item)) {
            page.items.push(item.clone());
        }
        last = Some(item);
    }

    if remaining.peek().is_some() {
        page.last_evaluated_key = last.as_ref().map(key_of);
    }
    page
}

#[async_trait]
impl Backend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn get_item(&self, schema: &TableSchema, key: &Item) -> Result<Option<Item>> {
        let primary = schema.primary_key(key)?;
        let tables = self.tables.read().await;
        Ok(tables
            .get(schema.name())
            .and_then(|table| table.items.get(&primary))
            .cloned())
    }

    async fn put_item(
        &self,
        schema: &TableSchema,
        item: &Item,
        condition: Option<&BoundCondition>,
    ) -> Result<()> {
        let primary = schema.primary_key(item)?;
        let mut tables = self.tables.write().await;
        let table = tables.entry(schema.name().to_string()).or_default();

        check_condition(schema, OperationKind::Put, condition, table.items.get(&primary))?;
        let _ = table.items.insert(primary, item.clone());
        Ok(())
    }

    async fn update_item(
        &self,
        schema: &TableSchema,
        key: &Item,
        patch: &Item,
        condition: Option<&BoundCondition>,
    ) -> Result<Item> {
        let primary = schema.primary_key(key)?;
        let mut tables = self.tables.write().await;
        let current = tables
            .get_mut(schema.name())
            .and_then(|table| table.items.get_mut(&primary))
            .ok_or_else(|| Error::ItemNotFound(schema.name().to_string()))?;

        check_condition(schema, OperationKind::Update, condition, Some(&*current))?;
        for (name, value) in patch {
            let _ = current.insert(name.clone(), value.clone());
        }
        Ok(current.clone())
    }

    async fn delete_item(
        &self,
        schema: &TableSchema,
        key: &Item,
        condition: Option<&BoundCondition>,
    ) -> Result<Option<Item>> {
        let primary = schema.primary_key(key)?;
        let mut tables = self.tables.write().await;
        let Some(table) = tables.get_mut(schema.name()) else {
            check_condition(schema, OperationKind::Delete, condition, None)?;
            return Ok(None);
        };

        check_condition(schema, OperationKind::Delete, condition, table.items.get(&primary))?;
        Ok(table.items.remove(&primary))
    }

    async fn query(&self, schema: &TableSchema, request: QueryRequest) -> Result<RawPage> {
        let Some(partition) = KeyPart::from_typed(&request.key.partition) else {
            return Ok(RawPage::default());
        };
        let index = request.index.as_ref();
        let start = start_position(schema, index, request.exclusive_start_key.as_ref())?;
        let sort = request.key.sort.as_ref();

        let tables = self.tables.read().await;
        let Some(table) = tables.get(schema.name()) else {
            return Ok(RawPage::default());
        };

        let mut candidates: Vec<(Position, Item)> = match index {
            None => table
                .items
                .range(
                    PrimaryKey {
                        partition: partition.clone(),
                        sort: None,
                    }..,
                )
                .take_while(|(primary, _)| primary.partition == partition)
                .filter(|(_, item)| sort.is_none_or(|s| s.evaluate(item)))
                .map(|(primary, item)| ((None, primary.clone()), item.clone()))
                .collect(),
            Some(index) => {
                let mut matched: Vec<(Position, Item)> = table
                    .items
                    .iter()
                    .filter(|(_, item)| {
                        item.get(index.partition_key())
                            .and_then(KeyPart::from_typed)
                            .is_some_and(|p| p == partition)
                    })
                    .filter_map(|(primary, item)| {
                        let index_sort = match index.sort_key() {
                            Some(attribute) => {
                                Some(item.get(attribute).and_then(KeyPart::from_typed)?)
                            }
                            None => None,
                        };
                        Some(((index_sort, primary.clone()), item))
                    })
                    .filter(|(_, item)| sort.is_none_or(|s| s.evaluate(item)))
                    .map(|(position, item)| (position, index.project(schema, item)))
                    .collect();
                matched.sort_by(|a, b| a.0.cmp(&b.0));
                matched
            }
        };
        drop(tables);

        if !request.scan_forward {
            candidates.reverse();
        }

        debug!(
            table = schema.name(),
            index = index.map(IndexDef::name),
            candidates = candidates.len(),
            "memory query"
        );

        Ok(paginate(
            candidates,
            start,
            request.scan_forward,
            request.limit,
            request.filter.as_ref(),
            |item| key_attributes(schema, index, item),
        ))
    }

    async fn scan(&self, schema: &TableSchema, request: ScanRequest) -> Result<RawPage> {
        let start = start_position(schema, None, request.exclusive_start_key.as_ref())?;

        let candidates: Vec<(Position, Item)> = {
            let tables = self.tables.read().await;
            tables
                .get(schema.name())
                .map(|table| {
                    table
                        .items
                        .iter()
                        .map(|(primary, item)| ((None, primary.clone()), item.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(paginate(
            candidates,
            start,
            true,
            request.limit,
            request.filter.as_ref(),
            |item| key_attributes(schema, None, item),
        ))
    }

    async fn batch_get(&self, schema: &TableSchema, keys: Vec<Item>) -> Result<BatchGetResponse> {
        let primaries = keys
            .iter()
            .map(|key| schema.primary_key(key))
            .collect::<Result<Vec<_>>>()?;

        let tables = self.tables.read().await;
        let items = match tables.get(schema.name()) {
            Some(table) => primaries
                .iter()
                .filter_map(|primary| table.items.get(primary).cloned())
                .collect(),
            None => Vec::new(),
        };

        Ok(BatchGetResponse {
            items,
            unprocessed_keys: Vec::new(),
        })
    }

    async fn batch_write(
        &self,
        schema: &TableSchema,
        requests: Vec<WriteRequest>,
    ) -> Result<Vec<WriteRequest>> {
        let mut tables = self.tables.write().await;
        let table = tables.entry(schema.name().to_string()).or_default();

        for request in requests {
            match request {
                WriteRequest::Put(item) => {
                    let _ = table.items.insert(schema.primary_key(&item)?, item);
                }
                WriteRequest::Delete(key) => {
                    let _ = table.items.remove(&schema.primary_key(&key)?);
                }
            }
        }

        Ok(Vec::new())
    }

    async fn create_table(&self, schema: &TableSchema) -> Result<bool> {
        let mut tables = self.tables.write().await;
        if tables.contains_key(schema.name()) {
            return Ok(false);
        }
        let _ = tables.insert(schema.name().to_string(), MemoryTable::default());
        Ok(true)
    }

    async fn delete_table(&self, table: &str) -> Result<bool> {
        Ok(self.tables.write().await.remove(table).is_some())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.tables.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{TypedValue, encode_item};
    use crate::expression::{AttributeNames, Condition, KeyCondition, values};
    use serde_json::json;

    fn item(value: serde_json::Value) -> Item {
        encode_item(value.as_object().unwrap()).unwrap()
    }

    fn orders() -> TableSchema {
        TableSchema::new("orders", "pk")
            .with_sort_key("sk")
            .with_index(IndexDef::new("byStatus", "status").with_sort_key("amount"))
    }

    fn key_condition(partition_key: &str, sort_key: Option<&str>, value: &str) -> KeyCondition {
        let bound = Condition::eq(partition_key, ":p")
            .bind(&values([(":p", json!(value))]), &AttributeNames::new())
            .unwrap()
            .unwrap();
        KeyCondition::split(bound, partition_key, sort_key).unwrap()
    }

    async fn seeded() -> MemoryBackend {
        let backend = MemoryBackend::new();
        let schema = orders();
        for (sk, status, amount) in [("c", "open", 3), ("a", "open", 1), ("b", "closed", 2)] {
            backend
                .put_item(
                    &schema,
                    &item(json!({ "pk": "u", "sk": sk, "status": status, "amount": amount })),
                    None,
                )
                .await
                .unwrap();
        }
        backend
            .put_item(&schema, &item(json!({ "pk": "v", "sk": "a", "status": "open", "amount": 0 })), None)
            .await
            .unwrap();
        backend
    }

    #[tokio::test]
    async fn test_query_orders_by_sort_key_and_paginates() {
        let backend = seeded().await;
        let schema = orders();

        let request = QueryRequest {
            index: None,
            key: key_condition("pk", Some("sk"), "u"),
            filter: None,
            limit: 2,
            scan_forward: true,
            exclusive_start_key: None,
        };
        let first = backend.query(&schema, request.clone()).await.unwrap();
        let sks: Vec<_> = first.items.iter().map(|i| i["sk"].clone()).collect();
        assert_eq!(sks, vec![TypedValue::S("a".into()), TypedValue::S("b".into())]);
        assert!(first.last_evaluated_key.is_some());

        let second = backend
            .query(
                &schema,
                QueryRequest {
                    exclusive_start_key: first.last_evaluated_key,
                    ..request
                },
            )
            .await
            .unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0]["sk"], TypedValue::S("c".into()));
        assert!(second.last_evaluated_key.is_none());
    }

    #[tokio::test]
    async fn test_index_query_orders_by_index_sort_key() {
        let backend = seeded().await;
        let schema = orders();
        let index = schema.index("byStatus").unwrap().clone();

        let page = backend
            .query(
                &schema,
                QueryRequest {
                    index: Some(index),
                    key: key_condition("status", Some("amount"), "open"),
                    filter: None,
                    limit: 10,
                    scan_forward: false,
                    exclusive_start_key: None,
                },
            )
            .await
            .unwrap();

        let amounts: Vec<_> = page.items.iter().map(|i| i["amount"].clone()).collect();
        assert_eq!(
            amounts,
            vec![
                TypedValue::N("3".into()),
                TypedValue::N("1".into()),
                TypedValue::N("0".into())
            ]
        );
    }

    #[tokio::test]
    async fn test_strict_update_and_conditions() {
        let backend = MemoryBackend::new();
        let schema = orders();
        let key = item(json!({ "pk": "u", "sk": "a" }));

        let err = backend
            .update_item(&schema, &key, &item(json!({ "amount": 1 })), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ItemNotFound(_)));

        let not_exists = BoundCondition::NotExists("pk".to_string());
        backend
            .put_item(&schema, &item(json!({ "pk": "u", "sk": "a" })), Some(&not_exists))
            .await
            .unwrap();
        let err = backend
            .put_item(&schema, &item(json!({ "pk": "u", "sk": "a" })), Some(&not_exists))
            .await
            .unwrap_err();
        assert!(err.is_conditional_check_failed());

        assert!(backend.delete_item(&schema, &key, None).await.unwrap().is_some());
        assert!(backend.delete_item(&schema, &key, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scan_with_filter_counts_scanned_items() {
        let backend = seeded().await;
        let filter = BoundCondition::Compare {
            attribute: "status".to_string(),
            comparator: crate::expression::Comparator::Eq,
            value: TypedValue::S("open".into()),
        };
        let page = backend
            .scan(
                &orders(),
                ScanRequest {
                    filter: Some(filter),
                    limit: 100,
                    exclusive_start_key: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(page.scanned_count, 4);
        assert_eq!(page.items.len(), 3);
    }
}
