/// Transaction Tests
///
/// All-or-nothing writes across tables and structured transactional reads.
use wide_table::TransactionState;

mod helpers;
use helpers::*;

async fn seed(client: &TableClient, payer: &str, payee: &str) {
    client
        .put("accounts", json!({ "id": payer, "balance": 100 }))
        .await
        .unwrap();
    client
        .put("accounts", json!({ "id": payee, "balance": 0 }))
        .await
        .unwrap();
}

fn transfer(payer: &str, payee: &str, amount: i64, order: &str) -> Vec<TransactWriteOp> {
    let funded = WriteCondition::new(Condition::ge("balance", ":amount")).with_value(":amount", json!(amount));
    vec![
        TransactWriteOp::update("accounts", json!({ "id": payer }), json!({ "balance": 100 - amount }))
            .with_condition(funded),
        TransactWriteOp::update("accounts", json!({ "id": payee }), json!({ "balance": amount })),
        TransactWriteOp::put("orders", json!({ "pk": payer, "sk": order, "amount": amount }))
            .with_condition(WriteCondition::not_exists("pk")),
    ]
}

/// Test every operation is applied on commit
#[tokio::test]
async fn test_transact_write_commits() {
    let client = memory_client();
    let (payer, payee) = (unique_id("acct"), unique_id("acct"));
    seed(&client, &payer, &payee).await;

    let output = client
        .transact_write(transfer(&payer, &payee, 30, "order#1"))
        .await
        .unwrap();
    assert_eq!(output.state, TransactionState::Committed);
    assert_eq!(output.applied, 3);

    let read = client
        .transact_get(vec![
            TransactGetOp::new("accounts", json!({ "id": payer })),
            TransactGetOp::new("accounts", json!({ "id": payee })),
            TransactGetOp::new("orders", json!({ "pk": payer, "sk": "order#1" })),
        ])
        .await
        .unwrap();
    assert!(read.success);
    let balances: Vec<_> = read
        .results
        .iter()
        .map(|result| result.item.as_ref().unwrap().get("balance").cloned())
        .collect();
    assert_eq!(balances, vec![Some(json!(70)), Some(json!(30)), None]);
}

/// Test a failing last operation leaves nothing applied
#[tokio::test]
async fn test_transact_write_failure_leaves_nothing_applied() {
    let client = memory_client();
    let (payer, payee) = (unique_id("acct"), unique_id("acct"));
    seed(&client, &payer, &payee).await;
    client
        .put("orders", json!({ "pk": payer, "sk": "order#1", "amount": 1 }))
        .await
        .unwrap();

    let err = client
        .transact_write(transfer(&payer, &payee, 30, "order#1"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::TransactionCanceled { index: 2, .. }));
    assert!(err.is_conditional_check_failed());

    let payer_item = client.get("accounts", json!({ "id": payer })).await.unwrap().unwrap();
    let payee_item = client.get("accounts", json!({ "id": payee })).await.unwrap().unwrap();
    let order = client
        .get("orders", json!({ "pk": payer, "sk": "order#1" }))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payer_item["balance"], 100);
    assert_eq!(payee_item["balance"], 0);
    assert_eq!(order["amount"], 1);
}

/// Test a strict update of a missing item cancels the transaction
#[tokio::test]
async fn test_transact_write_missing_item_cancels() {
    let client = memory_client();
    let pk = unique_id("user");

    let err = client
        .transact_write(vec![
            TransactWriteOp::put("orders", json!({ "pk": pk, "sk": "order#1" })),
            TransactWriteOp::delete("orders", json!({ "pk": pk, "sk": "order#0" })),
            TransactWriteOp::update("accounts", json!({ "id": unique_id("ghost") }), json!({ "balance": 1 })),
        ])
        .await
        .unwrap_err();

    match &err {
        Error::TransactionCanceled { index, source } => {
            assert_eq!(*index, 2);
            assert!(matches!(**source, Error::ItemNotFound(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(client
        .get("orders", json!({ "pk": pk, "sk": "order#1" }))
        .await
        .unwrap()
        .is_none());
}

/// Test deletes are restored on rollback
#[tokio::test]
async fn test_transact_write_restores_deleted_items() {
    let client = memory_client();
    let id = unique_id("tok");
    client
        .put("paymentTokens", json!({ "id": id, "last4": "4242", "expires": 2712 }))
        .await
        .unwrap();

    let err = client
        .transact_write(vec![
            TransactWriteOp::delete("paymentTokens", json!({ "id": id })),
            TransactWriteOp::put("paymentTokens", json!({ "id": id, "last4": "0000" })),
            TransactWriteOp::delete("paymentTokens", json!({ "id": id }))
                .with_condition(WriteCondition::new(Condition::eq("last4", ":l")).with_value(":l", json!("9999"))),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TransactionCanceled { index: 2, .. }));

    let token = client.get("paymentTokens", json!({ "id": id })).await.unwrap().unwrap();
    assert_eq!(token["last4"], "4242");
    assert_eq!(token["expires"], 2712);
}

/// Test validation errors are raised before any write
#[tokio::test]
async fn test_transact_write_validation() {
    let client = memory_client();
    let pk = unique_id("user");

    let err = client
        .transact_write(vec![
            TransactWriteOp::put("orders", json!({ "pk": pk, "sk": "order#1" })),
            TransactWriteOp::put("unknownTable", json!({ "id": "x" })),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownTable(_)));
    assert!(client
        .get("orders", json!({ "pk": pk, "sk": "order#1" }))
        .await
        .unwrap()
        .is_none());
}

/// Test an empty transaction commits trivially
#[tokio::test]
async fn test_transact_write_empty() {
    let client = memory_client();
    let output = client.transact_write(Vec::new()).await.unwrap();
    assert_eq!(output.applied, 0);
}

/// Test transactional reads report absence per entry
#[tokio::test]
async fn test_transact_get_absent_entries() {
    let client = memory_client();
    let id = unique_id("acct");
    client.put("accounts", json!({ "id": id, "balance": 5 })).await.unwrap();

    let output = client
        .transact_get(vec![
            TransactGetOp::new("accounts", json!({ "id": unique_id("ghost") })),
            TransactGetOp::new("accounts", json!({ "id": id })),
        ])
        .await
        .unwrap();

    assert!(output.success);
    assert!(output.results.iter().all(|result| result.success && result.error.is_none()));
    assert!(output.results[0].item.is_none());
    assert_eq!(output.results[1].item.as_ref().unwrap()["balance"], 5);
    assert_eq!(output.results[1].table, "accounts");

    let err = client
        .transact_get(vec![TransactGetOp::new("accounts", json!({ "balance": 5 }))])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingKeyAttribute { .. }));
}
