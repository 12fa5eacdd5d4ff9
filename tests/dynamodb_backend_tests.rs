/// DynamoDB Backend Tests
///
/// Runs the same operations against a DynamoDB-compatible endpoint.
/// Requires DynamoDB Local on `http://127.0.0.1:8000` (override with
/// `WIDE_TABLE_ENDPOINT`), so every test is ignored by default:
///
/// ```text
/// docker run -p 8000:8000 amazon/dynamodb-local
/// cargo test --test dynamodb_backend_tests -- --ignored
/// ```
use serial_test::serial;
use tokio::sync::OnceCell;
use wide_table::{BackendKind, TransactionState};

mod helpers;
use helpers::*;

static TABLES_READY: OnceCell<()> = OnceCell::const_new();

async fn dynamo_client() -> TableClient {
    init_tracing();
    let endpoint =
        std::env::var("WIDE_TABLE_ENDPOINT").unwrap_or_else(|_| "http://127.0.0.1:8000".into());
    let config = ClientConfig::default()
        .with_endpoint(endpoint)
        .with_credentials("local", "local")
        .with_keyspace("wide_table_tests");
    let client = TableClient::from_config(config, registry());

    TABLES_READY
        .get_or_init(|| async {
            let _ = client.create_tables().await.unwrap();
        })
        .await;
    client
}

/// Test the session reaches the endpoint
#[tokio::test]
#[ignore]
#[serial]
async fn test_dynamodb_health() {
    let client = dynamo_client().await;
    let status = client.session().health_check().await;
    assert!(status.is_healthy(), "{:?}", status.error);

    let backend = client.session().connect().await.unwrap();
    assert_eq!(backend.kind(), BackendKind::DynamoDb);
}

/// Test single item operations
#[tokio::test]
#[ignore]
#[serial]
async fn test_dynamodb_crud() {
    let client = dynamo_client().await;
    let pk = unique_id("user");
    let item = json!({
        "pk": pk,
        "sk": "order#1",
        "amount": 10.5,
        "tags": ["a", "b"],
        "meta": { "channel": "pos", "void": null }
    });

    client.put("orders", item.clone()).await.unwrap();
    let got = client
        .get("orders", json!({ "pk": pk, "sk": "order#1" }))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(serde_json::Value::Object(got), item);

    let merged = client
        .update("orders", json!({ "pk": pk, "sk": "order#1" }), json!({ "amount": 11 }))
        .await
        .unwrap();
    assert_eq!(merged["amount"], 11);
    assert_eq!(merged["tags"], json!(["a", "b"]));

    let err = client
        .update("orders", json!({ "pk": pk, "sk": "order#404" }), json!({ "amount": 1 }))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ItemNotFound(_)));

    let err = client
        .put_if(
            "orders",
            json!({ "pk": pk, "sk": "order#1" }),
            &WriteCondition::not_exists("pk"),
        )
        .await
        .unwrap_err();
    assert!(err.is_conditional_check_failed());

    assert!(client.delete("orders", json!({ "pk": pk, "sk": "order#1" })).await.unwrap());
    assert!(!client.delete("orders", json!({ "pk": pk, "sk": "order#1" })).await.unwrap());
}

/// Test key conditions, filters, indexes and pagination
#[tokio::test]
#[ignore]
#[serial]
async fn test_dynamodb_query() {
    let client = dynamo_client().await;
    let merchant = unique_id("merchant");
    let order = unique_id("ord");

    for (day, status) in [("01", "settled"), ("02", "failed"), ("03", "settled")] {
        client
            .put(
                "paymentTransactions",
                json!({
                    "pk": merchant,
                    "createdAt": format!("2024-06-{day}"),
                    "orderId": format!("{order}-{day}"),
                    "status": status,
                    "amount": 100
                }),
            )
            .await
            .unwrap();
    }

    let bindings = values([
        (":pk", json!(merchant)),
        (":from", json!("2024-06-02")),
        (":settled", json!("settled")),
    ]);
    let page = client
        .query(
            "paymentTransactions",
            &Condition::eq("pk", ":pk").and(Condition::range("createdAt", ":from", ":to")),
            &bindings,
            QueryOptions::new()
                .filter(Condition::eq("#s", ":settled"))
                .name("#s", "status"),
        )
        .await
        .unwrap();
    assert_eq!(page.count, 1);
    assert_eq!(page.scanned_count, 2);

    let first = client
        .query(
            "paymentTransactions",
            &Condition::eq("pk", ":pk"),
            &bindings,
            QueryOptions::new().limit(2),
        )
        .await
        .unwrap();
    assert_eq!(first.count, 2);
    let key = first.last_evaluated_key.clone().unwrap();
    let rest = client
        .query(
            "paymentTransactions",
            &Condition::eq("pk", ":pk"),
            &bindings,
            QueryOptions::new().limit(2).start_after(Some(key)),
        )
        .await
        .unwrap();
    assert_eq!(rest.items[0]["createdAt"], "2024-06-03");

    let by_order = client
        .query_all(
            "paymentTransactions",
            &Condition::eq("orderId", ":o"),
            &values([(":o", json!(format!("{order}-02")))]),
            QueryOptions::new().index("GSI_OrderId"),
        )
        .await
        .unwrap();
    assert_eq!(by_order.len(), 1);
    assert_eq!(by_order[0]["status"], "failed");
}

/// Test batch writes and reads
#[tokio::test]
#[ignore]
#[serial]
async fn test_dynamodb_batch() {
    let client = dynamo_client().await;
    let prefix = unique_id("tok");
    let directives: Vec<_> = (0..40)
        .map(|n| WriteDirective::put(json!({ "id": format!("{prefix}-{n}"), "n": n })))
        .collect();

    let output = client.batch_write("paymentTokens", directives).await.unwrap();
    assert!(output.is_success());
    assert_eq!(output.processed_puts, 40);

    let keys: Vec<_> = (0..40).map(|n| json!({ "id": format!("{prefix}-{n}") })).collect();
    let read = client.batch_get("paymentTokens", keys).await.unwrap();
    assert_eq!(read.items.len(), 40);
    assert_eq!(read.items[39]["n"], 39);

    let deletes: Vec<_> = (0..40)
        .map(|n| WriteDirective::delete(json!({ "id": format!("{prefix}-{n}") })))
        .collect();
    let output = client.batch_write("paymentTokens", deletes).await.unwrap();
    assert_eq!(output.processed_deletes, 40);
}

/// Test transactional writes roll back on the endpoint too
#[tokio::test]
#[ignore]
#[serial]
async fn test_dynamodb_transaction_rollback() {
    let client = dynamo_client().await;
    let account = unique_id("acct");
    client
        .put("accounts", json!({ "id": account, "balance": 10 }))
        .await
        .unwrap();

    let output = client
        .transact_write(vec![TransactWriteOp::update(
            "accounts",
            json!({ "id": account }),
            json!({ "balance": 5 }),
        )])
        .await
        .unwrap();
    assert_eq!(output.state, TransactionState::Committed);

    let err = client
        .transact_write(vec![
            TransactWriteOp::update("accounts", json!({ "id": account }), json!({ "balance": 0 })),
            TransactWriteOp::put("accounts", json!({ "id": account, "balance": 99 }))
                .with_condition(WriteCondition::not_exists("id")),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TransactionCanceled { index: 1, .. }));

    let read = client
        .transact_get(vec![TransactGetOp::new("accounts", json!({ "id": account }))])
        .await
        .unwrap();
    assert_eq!(read.results[0].item.as_ref().unwrap()["balance"], 5);
}
