/// Common test fixtures
///
/// Table declarations shared by the integration tests, in the same
/// `CreateTable` shape production tooling consumes.
use serde::{Deserialize, Serialize};
use wide_table::{Record, SchemaRegistry};

/// Declarations of every table used by the integration tests
pub const TABLES: &str = r#"[
    {
        "TableName": "orders",
        "KeySchema": [
            { "AttributeName": "pk", "KeyType": "HASH" },
            { "AttributeName": "sk", "KeyType": "RANGE" }
        ],
        "AttributeDefinitions": [
            { "AttributeName": "pk", "AttributeType": "S" },
            { "AttributeName": "sk", "AttributeType": "S" }
        ]
    },
    {
        "TableName": "paymentTransactions",
        "KeySchema": [
            { "AttributeName": "pk", "KeyType": "HASH" },
            { "AttributeName": "createdAt", "KeyType": "RANGE" }
        ],
        "AttributeDefinitions": [
            { "AttributeName": "pk", "AttributeType": "S" },
            { "AttributeName": "createdAt", "AttributeType": "S" },
            { "AttributeName": "orderId", "AttributeType": "S" },
            { "AttributeName": "status", "AttributeType": "S" }
        ],
        "GlobalSecondaryIndexes": [
            {
                "IndexName": "GSI_OrderId",
                "KeySchema": [{ "AttributeName": "orderId", "KeyType": "HASH" }],
                "Projection": { "ProjectionType": "ALL" }
            },
            {
                "IndexName": "GSI_Status",
                "KeySchema": [
                    { "AttributeName": "status", "KeyType": "HASH" },
                    { "AttributeName": "createdAt", "KeyType": "RANGE" }
                ],
                "Projection": { "ProjectionType": "KEYS_ONLY" }
            }
        ],
        "BillingMode": "PAY_PER_REQUEST"
    },
    {
        "TableName": "paymentTokens",
        "KeySchema": [{ "AttributeName": "id", "KeyType": "HASH" }],
        "AttributeDefinitions": [{ "AttributeName": "id", "AttributeType": "S" }]
    },
    {
        "TableName": "accounts",
        "KeySchema": [{ "AttributeName": "id", "KeyType": "HASH" }],
        "AttributeDefinitions": [{ "AttributeName": "id", "AttributeType": "S" }]
    }
]"#;

/// Registry holding every fixture table
pub fn registry() -> SchemaRegistry {
    SchemaRegistry::from_json(TABLES).unwrap()
}

/// Stored card token
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PaymentToken {
    pub id: String,
    pub customer_id: String,
    pub last4: String,
    pub expires: u32,
    pub default: bool,
}

impl Record for PaymentToken {
    const TABLE: &'static str = "paymentTokens";
}
