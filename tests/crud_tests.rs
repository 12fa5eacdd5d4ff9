/// CRUD Operations Tests
///
/// Single item get, put, update and delete against the in-memory backend.
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use wide_table::backend::{
    Backend, BackendKind, BatchGetResponse, QueryRequest, RawPage, ScanRequest, WriteRequest,
};
use wide_table::expression::BoundCondition;
use wide_table::{Item, MemoryBackend, SessionManager, TableSchema};

mod helpers;
use helpers::*;

/// Test basic item creation and retrieval
#[tokio::test]
async fn test_put_then_get_returns_same_item() {
    let client = memory_client();
    let pk = unique_id("user");
    let item = json!({
        "pk": pk,
        "sk": "order#1",
        "amount": 10,
        "ratio": 0.25,
        "paid": true,
        "note": null,
        "lines": [{ "sku": "A-1", "qty": 2 }, { "sku": "B-7", "qty": 1 }],
        "meta": { "source": "web", "retries": 0 }
    });

    let stored = client.put("orders", item.clone()).await.unwrap();
    assert_eq!(serde_json::Value::Object(stored), item);

    let got = client
        .get("orders", json!({ "pk": pk, "sk": "order#1" }))
        .await
        .unwrap()
        .expect("item should exist");
    assert_eq!(serde_json::Value::Object(got), item, "retrieved item should match");
}

/// Test that an already encoded item is accepted as is
#[tokio::test]
async fn test_put_accepts_encoded_item() {
    let client = memory_client();
    let pk = unique_id("user");

    client
        .put(
            "orders",
            json!({ "pk": { "S": pk }, "sk": { "S": "order#1" }, "amount": { "N": "12.5" } }),
        )
        .await
        .unwrap();

    let got = client
        .get("orders", json!({ "pk": pk, "sk": "order#1" }))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got["amount"], 12.5);
}

/// Test that absence is not an error
#[tokio::test]
async fn test_get_missing_item_returns_none() {
    let client = memory_client();
    let got = client
        .get("orders", json!({ "pk": unique_id("nobody"), "sk": "order#1" }))
        .await
        .unwrap();
    assert!(got.is_none());
}

/// Test key validation happens before the backend is touched
#[tokio::test]
async fn test_put_missing_key_attribute() {
    let client = memory_client();

    let err = client
        .put("orders", json!({ "pk": "user#1", "amount": 10 }))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingKeyAttribute { ref attribute, .. } if attribute == "sk"));
    assert!(err.is_validation_error());

    let err = client
        .put("orders", json!({ "pk": null, "sk": "order#1" }))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingKeyAttribute { ref attribute, .. } if attribute == "pk"));

    let err = client
        .put("orders", json!({ "pk": ["a"], "sk": "order#1" }))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidKeyAttribute { .. }));
}

/// Test unknown tables are rejected
#[tokio::test]
async fn test_unknown_table() {
    let client = memory_client();
    let err = client.put("nope", json!({ "id": "1" })).await.unwrap_err();
    assert!(matches!(err, Error::UnknownTable(_)));
}

/// Test updating only the named attributes
#[tokio::test]
async fn test_update_changes_only_named_attributes() {
    let client = memory_client();
    let id = unique_id("tok");
    client
        .put(
            "paymentTokens",
            json!({ "id": id, "customerId": "cus_1", "last4": "4242", "expires": 2712 }),
        )
        .await
        .unwrap();

    let merged = client
        .update("paymentTokens", json!({ "id": id }), json!({ "expires": 2901, "default": true }))
        .await
        .unwrap();

    assert_eq!(merged["expires"], 2901);
    assert_eq!(merged["default"], true);
    assert_eq!(merged["last4"], "4242");
    assert_eq!(merged["customerId"], "cus_1");

    let got = client.get("paymentTokens", json!({ "id": id })).await.unwrap().unwrap();
    assert_eq!(got, merged);
}

/// Test strict update semantics
#[tokio::test]
async fn test_update_missing_item_fails() {
    let client = memory_client();
    let err = client
        .update("paymentTokens", json!({ "id": unique_id("tok") }), json!({ "last4": "0000" }))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ItemNotFound(ref table) if table == "paymentTokens"));
}

/// Test that key attributes cannot be rewritten
#[tokio::test]
async fn test_update_rejects_key_change() {
    let client = memory_client();
    let id = unique_id("tok");
    client.put("paymentTokens", json!({ "id": id })).await.unwrap();

    let err = client
        .update("paymentTokens", json!({ "id": id }), json!({ "id": "other" }))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidExpression(_)));
}

/// Test delete is idempotent
#[tokio::test]
async fn test_delete_is_idempotent() {
    let client = memory_client();
    let id = unique_id("tok");
    client.put("paymentTokens", json!({ "id": id })).await.unwrap();

    assert!(client.delete("paymentTokens", json!({ "id": id })).await.unwrap());
    assert!(!client.delete("paymentTokens", json!({ "id": id })).await.unwrap());
    assert!(client.get("paymentTokens", json!({ "id": id })).await.unwrap().is_none());
}

/// Test insert-only puts
#[tokio::test]
async fn test_conditional_put_not_exists() {
    let client = memory_client();
    let id = unique_id("tok");
    let guard = WriteCondition::not_exists("id");

    client
        .put_if("paymentTokens", json!({ "id": id, "last4": "1111" }), &guard)
        .await
        .unwrap();

    let err = client
        .put_if("paymentTokens", json!({ "id": id, "last4": "2222" }), &guard)
        .await
        .unwrap_err();
    assert!(err.is_conditional_check_failed());

    let got = client.get("paymentTokens", json!({ "id": id })).await.unwrap().unwrap();
    assert_eq!(got["last4"], "1111");
}

/// Test optimistic locking with a version attribute
#[tokio::test]
async fn test_conditional_update_version_check() {
    let client = memory_client();
    let id = unique_id("acct");
    client
        .put("accounts", json!({ "id": id, "balance": 100, "version": 1 }))
        .await
        .unwrap();

    let expect_version = |version: i64| {
        WriteCondition::new(Condition::eq("version", ":v")).with_value(":v", json!(version))
    };

    client
        .update_if(
            "accounts",
            json!({ "id": id }),
            json!({ "balance": 80, "version": 2 }),
            &expect_version(1),
        )
        .await
        .unwrap();

    let err = client
        .update_if(
            "accounts",
            json!({ "id": id }),
            json!({ "balance": 0, "version": 2 }),
            &expect_version(1),
        )
        .await
        .unwrap_err();
    assert!(err.is_conditional_check_failed());

    let got = client.get("accounts", json!({ "id": id })).await.unwrap().unwrap();
    assert_eq!(got["balance"], 80);
}

/// Test conditional delete with an unbound placeholder fails before any write
#[tokio::test]
async fn test_conditional_delete_missing_binding() {
    let client = memory_client();
    let id = unique_id("acct");
    client.put("accounts", json!({ "id": id, "balance": 0 })).await.unwrap();

    let guard = WriteCondition::new(Condition::eq("balance", ":zero"));
    let err = client
        .delete_if("accounts", json!({ "id": id }), &guard)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingBinding(ref name) if name == ":zero"));
    assert!(client.get("accounts", json!({ "id": id })).await.unwrap().is_some());

    let guard = guard.with_value(":zero", json!(0));
    assert!(client.delete_if("accounts", json!({ "id": id }), &guard).await.unwrap());
}

/// Test typed records
#[tokio::test]
async fn test_record_roundtrip() {
    let client = memory_client();
    let token = PaymentToken {
        id: unique_id("tok"),
        customer_id: "cus_9".into(),
        last4: "4242".into(),
        expires: 2712,
        default: false,
    };

    client.put_record(&token).await.unwrap();
    let got: PaymentToken = client
        .get_record(json!({ "id": token.id }))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, token);

    assert!(client.delete_record::<PaymentToken>(json!({ "id": token.id })).await.unwrap());
}

type Gate = (oneshot::Sender<()>, oneshot::Receiver<()>);

/// Memory backend whose next read, once armed, pauses after reading
#[derive(Debug, Default)]
struct GatedRead {
    inner: MemoryBackend,
    gate: Mutex<Option<Gate>>,
}

#[async_trait]
impl Backend for GatedRead {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    async fn get_item(&self, schema: &TableSchema, key: &Item) -> wide_table::Result<Option<Item>> {
        let item = self.inner.get_item(schema, key).await;
        let gate = self.gate.lock().unwrap().take();
        if let Some((read, release)) = gate {
            let _ = read.send(());
            let _ = release.await;
        }
        item
    }

    async fn put_item(
        &self,
        schema: &TableSchema,
        item: &Item,
        condition: Option<&BoundCondition>,
    ) -> wide_table::Result<()> {
        self.inner.put_item(schema, item, condition).await
    }

    async fn update_item(
        &self,
        schema: &TableSchema,
        key: &Item,
        patch: &Item,
        condition: Option<&BoundCondition>,
    ) -> wide_table::Result<Item> {
        self.inner.update_item(schema, key, patch, condition).await
    }

    async fn delete_item(
        &self,
        schema: &TableSchema,
        key: &Item,
        condition: Option<&BoundCondition>,
    ) -> wide_table::Result<Option<Item>> {
        self.inner.delete_item(schema, key, condition).await
    }

    async fn query(&self, schema: &TableSchema, request: QueryRequest) -> wide_table::Result<RawPage> {
        self.inner.query(schema, request).await
    }

    async fn scan(&self, schema: &TableSchema, request: ScanRequest) -> wide_table::Result<RawPage> {
        self.inner.scan(schema, request).await
    }

    async fn batch_get(
        &self,
        schema: &TableSchema,
        keys: Vec<Item>,
    ) -> wide_table::Result<BatchGetResponse> {
        self.inner.batch_get(schema, keys).await
    }

    async fn batch_write(
        &self,
        schema: &TableSchema,
        requests: Vec<WriteRequest>,
    ) -> wide_table::Result<Vec<WriteRequest>> {
        self.inner.batch_write(schema, requests).await
    }

    async fn create_table(&self, schema: &TableSchema) -> wide_table::Result<bool> {
        self.inner.create_table(schema).await
    }

    async fn delete_table(&self, table: &str) -> wide_table::Result<bool> {
        self.inner.delete_table(table).await
    }

    async fn list_tables(&self) -> wide_table::Result<Vec<String>> {
        self.inner.list_tables().await
    }

    async fn ping(&self) -> wide_table::Result<()> {
        self.inner.ping().await
    }
}

/// Test a read racing a write never leaves the older item cached
#[tokio::test]
async fn test_cache_not_filled_by_read_racing_write() {
    init_tracing();
    let backend = Arc::new(GatedRead::default());
    let session = SessionManager::with_backend(ClientConfig::memory().with_cache(16), backend.clone());
    let client = TableClient::new(Arc::new(registry()), Arc::new(session));

    let id = unique_id("acct");
    client.put("accounts", json!({ "id": id, "v": 1 })).await.unwrap();

    let (read_tx, read_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel();
    *backend.gate.lock().unwrap() = Some((read_tx, release_rx));

    let reader = {
        let client = client.clone();
        let id = id.clone();
        tokio::spawn(async move { client.get("accounts", json!({ "id": id })).await })
    };

    // the reader holds v=1 while the write lands
    read_rx.await.unwrap();
    client.put("accounts", json!({ "id": id, "v": 2 })).await.unwrap();
    release_tx.send(()).unwrap();

    let raced = reader.await.unwrap().unwrap().unwrap();
    assert_eq!(raced["v"], 1);

    let got = client.get("accounts", json!({ "id": id })).await.unwrap().unwrap();
    assert_eq!(got["v"], 2, "a read that started before the write must not be cached");
}
