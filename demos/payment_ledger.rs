/// Example: a small payment ledger
///
/// Registers the ledger tables, records a few payments, moves money between
/// accounts in a transaction and reads the results back through indexes.
///
/// Runs against the in-memory emulator unless `WIDE_TABLE_BACKEND=dynamodb`
/// is set, in which case the other `WIDE_TABLE_*` variables configure the
/// endpoint:
///
/// ```text
/// cargo run --example payment_ledger
/// WIDE_TABLE_BACKEND=dynamodb WIDE_TABLE_ENDPOINT=http://127.0.0.1:8000 \
///   WIDE_TABLE_ACCESS_KEY_ID=local WIDE_TABLE_SECRET_ACCESS_KEY=local \
///   cargo run --example payment_ledger
/// ```
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use wide_table::{
    ClientConfig, Condition, Error, IndexDef, QueryOptions, Record, SchemaRegistry, TableClient,
    TableSchema, TransactWriteOp, WriteCondition, WriteDirective, values,
};

fn ledger_schemas() -> Result<SchemaRegistry, Error> {
    let registry = SchemaRegistry::new();
    registry.register(
        TableSchema::new("paymentTransactions", "merchantId")
            .with_sort_key("createdAt")
            .with_index(IndexDef::new("GSI_Status", "status").with_sort_key("createdAt")),
    )?;
    registry.register(TableSchema::new("accounts", "id"))?;
    Ok(registry)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Account {
    id: String,
    owner: String,
    balance: i64,
}

impl Record for Account {
    const TABLE: &'static str = "accounts";
}

/// Move `amount` between two accounts, refusing to overdraw the payer
async fn transfer(
    client: &TableClient,
    payer: &Account,
    payee: &Account,
    amount: i64,
) -> Result<(), Error> {
    let funded =
        WriteCondition::new(Condition::ge("balance", ":amount")).with_value(":amount", json!(amount));

    let output = client
        .transact_write(vec![
            TransactWriteOp::update(
                "accounts",
                json!({ "id": payer.id }),
                json!({ "balance": payer.balance - amount }),
            )
            .with_condition(funded),
            TransactWriteOp::update(
                "accounts",
                json!({ "id": payee.id }),
                json!({ "balance": payee.balance + amount }),
            ),
        ])
        .await?;

    info!(state = %output.state, applied = output.applied, "transfer finished");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,wide_table=debug".into()),
        )
        .init();

    let mut config = ClientConfig::from_env();
    if std::env::var("WIDE_TABLE_BACKEND").is_err() {
        config = ClientConfig {
            backend: wide_table::BackendKind::Memory,
            ..config
        };
    }

    let client = TableClient::from_config(config, ledger_schemas()?);
    let created = client.create_tables().await?;
    info!(created, "tables ready");

    // Accounts
    let alice = Account {
        id: "acct_alice".into(),
        owner: "Alice".into(),
        balance: 5_000,
    };
    let shop = Account {
        id: "acct_shop".into(),
        owner: "Corner Shop".into(),
        balance: 0,
    };
    client.put_record(&alice).await?;
    client.put_record(&shop).await?;

    // Payments, written in one batch
    let payments = [
        ("2024-06-01T09:00:00Z", "settled", 1_250),
        ("2024-06-01T12:30:00Z", "failed", 300),
        ("2024-06-02T08:15:00Z", "settled", 2_000),
        ("2024-06-03T17:45:00Z", "pending", 800),
    ];
    let directives = payments
        .iter()
        .map(|(created_at, status, amount)| {
            WriteDirective::put(json!({
                "merchantId": shop.id,
                "createdAt": created_at,
                "status": status,
                "amount": amount
            }))
        })
        .collect();
    let written = client.batch_write("paymentTransactions", directives).await?;
    info!(
        processed = written.processed_count(),
        success_rate = written.success_rate(),
        "payments recorded"
    );

    // Payments of one day, settled only
    let page = client
        .query(
            "paymentTransactions",
            &Condition::eq("merchantId", ":m").and(Condition::range("createdAt", ":from", ":to")),
            &values([
                (":m", json!(shop.id)),
                (":from", json!("2024-06-01")),
                (":to", json!("2024-06-01T23:59:59Z")),
                (":settled", json!("settled")),
            ]),
            QueryOptions::new()
                .filter(Condition::eq("#s", ":settled"))
                .name("#s", "status"),
        )
        .await?;
    info!(count = page.count, scanned = page.scanned_count, "settled on june 1st");

    // Everything still pending, across merchants
    let pending = client
        .query_all(
            "paymentTransactions",
            &Condition::eq("status", ":s"),
            &values([(":s", json!("pending"))]),
            QueryOptions::new().index("GSI_Status"),
        )
        .await?;
    for payment in &pending {
        info!(merchant = %payment["merchantId"], amount = %payment["amount"], "pending payment");
    }

    // Settle a transfer, then try one that would overdraw
    transfer(&client, &alice, &shop, 1_250).await?;
    let alice: Account = client
        .get_record(json!({ "id": "acct_alice" }))
        .await?
        .ok_or_else(|| Error::ItemNotFound(Account::TABLE.into()))?;
    let shop: Account = client
        .get_record(json!({ "id": "acct_shop" }))
        .await?
        .ok_or_else(|| Error::ItemNotFound(Account::TABLE.into()))?;

    match transfer(&client, &alice, &shop, 1_000_000).await {
        Err(e) if e.is_conditional_check_failed() => {
            warn!(error = %e, "overdraft refused, balances unchanged")
        }
        other => other?,
    }

    for account in [&alice, &shop] {
        info!(owner = %account.owner, balance = account.balance, "final balance");
    }

    client.session().disconnect().await;
    Ok(())
}
