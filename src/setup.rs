//! Table provisioning for development and tests.
//!
//! Production tables are expected to be created by infrastructure tooling
//! from the same declarations; these helpers let a local emulator or
//! DynamoDB Local mirror them.

use tracing::{debug, info};

use crate::error::Result;
use crate::expression::reserved::is_reserved;
use crate::schema::{SchemaRegistry, TableSchema};
use crate::session::SessionManager;
use crate::table::TableClient;

/// Create the physical table for `schema`.
///
/// Idempotent: returns `false` when the table already existed.
pub async fn create_table(session: &SessionManager, schema: &TableSchema) -> Result<bool> {
    let key_attributes = schema
        .indexes()
        .iter()
        .flat_map(|index| [Some(index.partition_key()), index.sort_key()])
        .chain([Some(schema.partition_key()), schema.sort_key()])
        .flatten();
    for attribute in key_attributes {
        if is_reserved(attribute) {
            debug!(table = schema.name(), attribute, "key attribute is a reserved word and will be aliased");
        }
    }

    let backend = session.connect().await?;
    let created = backend.create_table(schema).await?;
    if created {
        info!(table = schema.name(), "table created");
    } else {
        debug!(table = schema.name(), "table already exists");
    }
    Ok(created)
}

/// Create a table for every registered schema, returning how many were new
pub async fn create_all(session: &SessionManager, registry: &SchemaRegistry) -> Result<usize> {
    let mut created = 0;
    for schema in registry.schemas() {
        if create_table(session, &schema).await? {
            created += 1;
        }
    }
    Ok(created)
}

/// Drop a table; `false` when it did not exist
pub async fn delete_table(session: &SessionManager, table: &str) -> Result<bool> {
    let backend = session.connect().await?;
    let deleted = backend.delete_table(table).await?;
    if deleted {
        info!(table, "table deleted");
    }
    Ok(deleted)
}

/// Names of the existing tables
pub async fn list_tables(session: &SessionManager) -> Result<Vec<String>> {
    session.connect().await?.list_tables().await
}

impl TableClient {
    /// Create a table for every schema in the client's registry
    pub async fn create_tables(&self) -> Result<usize> {
        create_all(self.session(), self.registry()).await
    }
}
