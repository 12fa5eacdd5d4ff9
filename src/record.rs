//! Typed records.
//!
//! A [`Record`] is a serde type bound to a table. Records are marshalled
//! with `serde_dynamo`, so their attribute layout is the one the
//! DynamoDB ecosystem expects.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;

use crate::codec::{Item, NativeItem, TypedValue, encode_item};
use crate::error::Result;
use crate::expression::{Condition, ExpressionValues, WriteCondition};
use crate::table::{QueryOptions, TableClient};

type AttributeMap = HashMap<String, serde_dynamo::AttributeValue>;

/// A serde type stored in one table
///
/// # Example
///
/// ```rust
/// use serde::{Deserialize, Serialize};
/// use wide_table::Record;
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct Token {
///     id: String,
///     customer: String,
///     last4: String,
/// }
///
/// impl Record for Token {
///     const TABLE: &'static str = "tokens";
/// }
/// ```
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    /// Name of the table records are stored in
    const TABLE: &'static str;
}

/// Encode a record into a wire item
pub fn to_item<R: Serialize>(record: &R) -> Result<Item> {
    let attributes: AttributeMap = serde_dynamo::to_item(record)?;
    attributes
        .into_iter()
        .map(|(name, value)| Ok((name, TypedValue::try_from(value)?)))
        .collect()
}

/// Decode a wire item into a record
pub fn from_item<R: DeserializeOwned>(item: Item) -> Result<R> {
    let attributes: AttributeMap = item
        .into_iter()
        .map(|(name, value)| (name, value.into()))
        .collect();
    Ok(serde_dynamo::from_item(attributes)?)
}

fn from_native<R: DeserializeOwned>(item: &NativeItem) -> Result<R> {
    from_item(encode_item(item)?)
}

impl TableClient {
    /// Store a record, replacing any record with the same key
    pub async fn put_record<R: Record>(&self, record: &R) -> Result<()> {
        let _ = self.put_encoded(R::TABLE, to_item(record)?, None).await?;
        Ok(())
    }

    /// Store a record only if `condition` holds for the current one
    pub async fn put_record_if<R: Record>(
        &self,
        record: &R,
        condition: &WriteCondition,
    ) -> Result<()> {
        let _ = self
            .put_encoded(R::TABLE, to_item(record)?, Some(condition))
            .await?;
        Ok(())
    }

    /// Read a record by key
    pub async fn get_record<R: Record>(&self, key: Value) -> Result<Option<R>> {
        self.get(R::TABLE, key)
            .await?
            .as_ref()
            .map(from_native)
            .transpose()
    }

    /// Every record matching a query, across all pages
    pub async fn query_records<R: Record>(
        &self,
        condition: &Condition,
        values: &ExpressionValues,
        options: QueryOptions,
    ) -> Result<Vec<R>> {
        self.query_all(R::TABLE, condition, values, options)
            .await?
            .iter()
            .map(from_native)
            .collect()
    }

    /// Remove a record by key; `true` when one was removed
    pub async fn delete_record<R: Record>(&self, key: Value) -> Result<bool> {
        self.delete(R::TABLE, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::expression::values;
    use crate::schema::{SchemaRegistry, TableSchema};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Schedule {
        customer_id: String,
        schedule_id: String,
        amount: u64,
        active: bool,
        note: Option<String>,
    }

    impl Record for Schedule {
        const TABLE: &'static str = "schedules";
    }

    fn client() -> TableClient {
        let registry = SchemaRegistry::new();
        registry
            .register(TableSchema::new("schedules", "customerId").with_sort_key("scheduleId"))
            .unwrap();
        TableClient::from_config(ClientConfig::memory(), registry)
    }

    fn schedule(id: &str, amount: u64) -> Schedule {
        Schedule {
            customer_id: "cus_1".to_string(),
            schedule_id: id.to_string(),
            amount,
            active: true,
            note: None,
        }
    }

    #[test]
    fn test_record_item_conversion() {
        let item = to_item(&schedule("s1", 500)).unwrap();
        assert_eq!(item["amount"], TypedValue::N("500".into()));
        assert_eq!(item["active"], TypedValue::Bool(true));

        let back: Schedule = from_item(item).unwrap();
        assert_eq!(back, schedule("s1", 500));
    }

    #[tokio::test]
    async fn test_record_crud() {
        let client = client();
        client.put_record(&schedule("s1", 500)).await.unwrap();
        client.put_record(&schedule("s2", 900)).await.unwrap();

        let key = json!({ "customerId": "cus_1", "scheduleId": "s1" });
        let fetched: Schedule = client.get_record(key.clone()).await.unwrap().unwrap();
        assert_eq!(fetched, schedule("s1", 500));

        let all: Vec<Schedule> = client
            .query_records(
                &Condition::eq("customerId", ":c"),
                &values([(":c", json!("cus_1"))]),
                QueryOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        assert!(client.delete_record::<Schedule>(key.clone()).await.unwrap());
        assert!(client.get_record::<Schedule>(key).await.unwrap().is_none());
    }
}
