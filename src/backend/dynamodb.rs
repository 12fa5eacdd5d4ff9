//! Backend for DynamoDB and DynamoDB-compatible endpoints.

use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::error::BuildError;
use aws_sdk_dynamodb::operation::create_table::CreateTableError;
use aws_sdk_dynamodb::operation::delete_table::DeleteTableError;
use aws_sdk_dynamodb::operation::update_item::UpdateItemError;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, DeleteRequest, GlobalSecondaryIndex,
    KeySchemaElement, KeyType, KeysAndAttributes, Projection as SdkProjection, ProjectionType,
    PutRequest, ReturnValue, ReturnValuesOnConditionCheckFailure, ScalarAttributeType,
    WriteRequest as SdkWriteRequest,
};
use std::collections::HashMap;
use tracing::{debug, info};

use super::{
    Backend, BackendKind, BatchGetResponse, QueryRequest, RawPage, ScanRequest, WriteRequest,
};
use crate::codec::{Item, TypedValue};
use crate::config::ClientConfig;
use crate::error::{Error, OperationKind, Result};
use crate::expression::{BoundCondition, ExpressionRenderer};
use crate::schema::{self, Projection, TableSchema};

type Attributes = HashMap<String, AttributeValue>;

/// Backend issuing requests through `aws-sdk-dynamodb`.
///
/// Logical table names are prefixed with the configured keyspace, so
/// several deployments can share one account or one local endpoint.
#[derive(Debug, Clone)]
pub struct DynamoBackend {
    client: Client,
    keyspace: Option<String>,
}

impl DynamoBackend {
    /// Wrap an existing client
    pub fn new(client: Client, keyspace: Option<String>) -> Self {
        Self {
            client,
            keyspace: keyspace.filter(|k| !k.is_empty()),
        }
    }

    /// Build a client from `config` and verify the endpoint answers.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let sdk_config = config.load_sdk_config().await;
        let backend = Self::new(Client::new(&sdk_config), config.keyspace.clone());

        backend
            .ping()
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;

        info!(
            endpoint = config.endpoint.as_deref().unwrap_or("default"),
            region = %config.region,
            "connected to dynamodb"
        );
        Ok(backend)
    }

    /// Underlying SDK client
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn physical_name(&self, table: &str) -> String {
        match &self.keyspace {
            Some(keyspace) => format!("{keyspace}.{table}"),
            None => table.to_string(),
        }
    }

    fn logical_name(&self, physical: String) -> Option<String> {
        match &self.keyspace {
            Some(keyspace) => physical
                .strip_prefix(keyspace.as_str())
                .and_then(|rest| rest.strip_prefix('.'))
                .map(str::to_string),
            None => Some(physical),
        }
    }
}

fn to_attribute_value(value: &TypedValue) -> AttributeValue {
    match value {
        TypedValue::S(s) => AttributeValue::S(s.clone()),
        TypedValue::N(n) => AttributeValue::N(n.clone()),
        TypedValue::Bool(b) => AttributeValue::Bool(*b),
        TypedValue::Null(b) => AttributeValue::Null(*b),
        TypedValue::L(values) => AttributeValue::L(values.iter().map(to_attribute_value).collect()),
        TypedValue::M(map) => AttributeValue::M(
            map.iter()
                .map(|(k, v)| (k.clone(), to_attribute_value(v)))
                .collect(),
        ),
    }
}

fn from_attribute_value(value: AttributeValue) -> Result<TypedValue> {
    Ok(match value {
        AttributeValue::S(s) => TypedValue::S(s),
        AttributeValue::N(n) => TypedValue::N(n),
        AttributeValue::Bool(b) => TypedValue::Bool(b),
        AttributeValue::Null(_) => TypedValue::null(),
        AttributeValue::L(values) => TypedValue::L(
            values
                .into_iter()
                .map(from_attribute_value)
                .collect::<Result<_>>()?,
        ),
        AttributeValue::M(map) => TypedValue::M(from_attributes(map)?),
        AttributeValue::Ss(values) => TypedValue::L(values.into_iter().map(TypedValue::S).collect()),
        AttributeValue::Ns(values) => TypedValue::L(values.into_iter().map(TypedValue::N).collect()),
        other => {
            return Err(Error::UnencodableType(format!(
                "unsupported attribute value {other:?}"
            )));
        }
    })
}

fn to_attributes(item: &Item) -> Attributes {
    item.iter()
        .map(|(k, v)| (k.clone(), to_attribute_value(v)))
        .collect()
}

fn from_attributes(attributes: Attributes) -> Result<Item> {
    attributes
        .into_iter()
        .map(|(k, v)| Ok((k, from_attribute_value(v)?)))
        .collect()
}

fn to_values(values: Option<HashMap<String, TypedValue>>) -> Option<Attributes> {
    values.map(|values| {
        values
            .iter()
            .map(|(k, v)| (k.clone(), to_attribute_value(v)))
            .collect()
    })
}

fn count(value: i32) -> usize {
    usize::try_from(value).unwrap_or_default()
}

fn page_limit(limit: usize) -> i32 {
    i32::try_from(limit).unwrap_or(i32::MAX)
}

fn scalar_type(schema: &TableSchema, attribute: &str) -> ScalarAttributeType {
    match schema.attribute_type(attribute) {
        Some(schema::ScalarType::N) => ScalarAttributeType::N,
        Some(schema::ScalarType::B) => ScalarAttributeType::B,
        _ => ScalarAttributeType::S,
    }
}

fn key_element(
    attribute: &str,
    key_type: KeyType,
) -> std::result::Result<KeySchemaElement, BuildError> {
    KeySchemaElement::builder()
        .attribute_name(attribute)
        .key_type(key_type)
        .build()
}

fn key_schema(
    partition_key: &str,
    sort_key: Option<&str>,
) -> std::result::Result<Vec<KeySchemaElement>, BuildError> {
    let mut elements = vec![key_element(partition_key, KeyType::Hash)?];
    if let Some(sort_key) = sort_key {
        elements.push(key_element(sort_key, KeyType::Range)?);
    }
    Ok(elements)
}

fn create_table_input(
    schema: &TableSchema,
) -> std::result::Result<
    (
        Vec<KeySchemaElement>,
        Vec<AttributeDefinition>,
        Vec<GlobalSecondaryIndex>,
    ),
    BuildError,
> {
    let mut key_attributes = vec![schema.partition_key()];
    key_attributes.extend(schema.sort_key());

    let mut indexes = Vec::with_capacity(schema.indexes().len());
    for index in schema.indexes() {
        key_attributes.push(index.partition_key());
        key_attributes.extend(index.sort_key());

        let projection = match index.projection() {
            Projection::All => SdkProjection::builder()
                .projection_type(ProjectionType::All)
                .build(),
            Projection::KeysOnly => SdkProjection::builder()
                .projection_type(ProjectionType::KeysOnly)
                .build(),
            Projection::Include(attributes) => SdkProjection::builder()
                .projection_type(ProjectionType::Include)
                .set_non_key_attributes(Some(attributes.clone()))
                .build(),
        };

        indexes.push(
            GlobalSecondaryIndex::builder()
                .index_name(index.name())
                .set_key_schema(Some(key_schema(index.partition_key(), index.sort_key())?))
                .projection(projection)
                .build()?,
        );
    }

    let mut definitions = Vec::new();
    for attribute in key_attributes {
        if definitions
            .iter()
            .any(|d: &AttributeDefinition| d.attribute_name() == attribute)
        {
            continue;
        }
        definitions.push(
            AttributeDefinition::builder()
                .attribute_name(attribute)
                .attribute_type(scalar_type(schema, attribute))
                .build()?,
        );
    }

    Ok((
        key_schema(schema.partition_key(), schema.sort_key())?,
        definitions,
        indexes,
    ))
}

#[async_trait]
impl Backend for DynamoBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::DynamoDb
    }

    async fn get_item(&self, schema: &TableSchema, key: &Item) -> Result<Option<Item>> {
        let output = self
            .client
            .get_item()
            .table_name(self.physical_name(schema.name()))
            .set_key(Some(to_attributes(key)))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| Error::from_sdk(schema.name(), OperationKind::Get, e))?;

        output.item.map(from_attributes).transpose()
    }

    async fn put_item(
        &self,
        schema: &TableSchema,
        item: &Item,
        condition: Option<&BoundCondition>,
    ) -> Result<()> {
        let mut renderer = ExpressionRenderer::new();
        let condition_expression = condition.map(|c| renderer.render(c));
        let (names, values) = renderer.finish();

        let _ = self
            .client
            .put_item()
            .table_name(self.physical_name(schema.name()))
            .set_item(Some(to_attributes(item)))
            .set_condition_expression(condition_expression)
            .set_expression_attribute_names(names)
            .set_expression_attribute_values(to_values(values))
            .send()
            .await
            .map_err(|e| Error::from_sdk(schema.name(), OperationKind::Put, e))?;

        Ok(())
    }

    async fn update_item(
        &self,
        schema: &TableSchema,
        key: &Item,
        patch: &Item,
        condition: Option<&BoundCondition>,
    ) -> Result<Item> {
        let mut renderer = ExpressionRenderer::new();

        let assignments: Vec<String> = patch
            .iter()
            .map(|(name, value)| {
                let name = renderer.name(name);
                let value = renderer.value(value);
                format!("{name} = {value}")
            })
            .collect();
        let update_expression =
            (!assignments.is_empty()).then(|| format!("SET {}", assignments.join(", ")));

        let mut guard = vec![BoundCondition::Exists(schema.partition_key().to_string())];
        guard.extend(condition.cloned());
        let condition_expression = BoundCondition::all(guard).map(|c| renderer.render(&c));
        let (names, values) = renderer.finish();

        let result = self
            .client
            .update_item()
            .table_name(self.physical_name(schema.name()))
            .set_key(Some(to_attributes(key)))
            .set_update_expression(update_expression)
            .set_condition_expression(condition_expression)
            .set_expression_attribute_names(names)
            .set_expression_attribute_values(to_values(values))
            .return_values(ReturnValue::AllNew)
            .return_values_on_condition_check_failure(ReturnValuesOnConditionCheckFailure::AllOld)
            .send()
            .await;

        match result {
            Ok(output) => from_attributes(output.attributes.unwrap_or_default()),
            Err(err) => {
                if let Some(UpdateItemError::ConditionalCheckFailedException(failure)) =
                    err.as_service_error()
                {
                    return Err(if failure.item().is_some() {
                        Error::ConditionalWriteFailed {
                            table: schema.name().to_string(),
                            operation: OperationKind::Update,
                        }
                    } else {
                        Error::ItemNotFound(schema.name().to_string())
                    });
                }
                Err(Error::from_sdk(schema.name(), OperationKind::Update, err))
            }
        }
    }

    async fn delete_item(
        &self,
        schema: &TableSchema,
        key: &Item,
        condition: Option<&BoundCondition>,
    ) -> Result<Option<Item>> {
        let mut renderer = ExpressionRenderer::new();
        let condition_expression = condition.map(|c| renderer.render(c));
        let (names, values) = renderer.finish();

        let output = self
            .client
            .delete_item()
            .table_name(self.physical_name(schema.name()))
            .set_key(Some(to_attributes(key)))
            .set_condition_expression(condition_expression)
            .set_expression_attribute_names(names)
            .set_expression_attribute_values(to_values(values))
            .return_values(ReturnValue::AllOld)
            .send()
            .await
            .map_err(|e| Error::from_sdk(schema.name(), OperationKind::Delete, e))?;

        output
            .attributes
            .filter(|attributes| !attributes.is_empty())
            .map(from_attributes)
            .transpose()
    }

    async fn query(&self, schema: &TableSchema, request: QueryRequest) -> Result<RawPage> {
        let mut renderer = ExpressionRenderer::new();
        let key_expression = renderer.render(&request.key.key_only());
        let filter_expression = request.filter.as_ref().map(|f| renderer.render(f));
        let (names, values) = renderer.finish();

        debug!(
            table = schema.name(),
            key_condition = %key_expression,
            filter = filter_expression.as_deref(),
            "dynamodb query"
        );

        let output = self
            .client
            .query()
            .table_name(self.physical_name(schema.name()))
            .set_index_name(request.index.as_ref().map(|i| i.name().to_string()))
            .key_condition_expression(key_expression)
            .set_filter_expression(filter_expression)
            .set_expression_attribute_names(names)
            .set_expression_attribute_values(to_values(values))
            .limit(page_limit(request.limit))
            .scan_index_forward(request.scan_forward)
            .set_exclusive_start_key(request.exclusive_start_key.as_ref().map(to_attributes))
            .send()
            .await
            .map_err(|e| Error::from_sdk(schema.name(), OperationKind::Query, e))?;

        Ok(RawPage {
            items: output
                .items
                .unwrap_or_default()
                .into_iter()
                .map(from_attributes)
                .collect::<Result<_>>()?,
            scanned_count: count(output.scanned_count),
            last_evaluated_key: output
                .last_evaluated_key
                .filter(|key| !key.is_empty())
                .map(from_attributes)
                .transpose()?,
        })
    }

    async fn scan(&self, schema: &TableSchema, request: ScanRequest) -> Result<RawPage> {
        let mut renderer = ExpressionRenderer::new();
        let filter_expression = request.filter.as_ref().map(|f| renderer.render(f));
        let (names, values) = renderer.finish();

        let output = self
            .client
            .scan()
            .table_name(self.physical_name(schema.name()))
            .set_filter_expression(filter_expression)
            .set_expression_attribute_names(names)
            .set_expression_attribute_values(to_values(values))
            .limit(page_limit(request.limit))
            .set_exclusive_start_key(request.exclusive_start_key.as_ref().map(to_attributes))
            .send()
            .await
            .map_err(|e| Error::from_sdk(schema.name(), OperationKind::Scan, e))?;

        Ok(RawPage {
            items: output
                .items
                .unwrap_or_default()
                .into_iter()
                .map(from_attributes)
                .collect::<Result<_>>()?,
            scanned_count: count(output.scanned_count),
            last_evaluated_key: output
                .last_evaluated_key
                .filter(|key| !key.is_empty())
                .map(from_attributes)
                .transpose()?,
        })
    }

    async fn batch_get(&self, schema: &TableSchema, keys: Vec<Item>) -> Result<BatchGetResponse> {
        if keys.is_empty() {
            return Ok(BatchGetResponse::default());
        }

        let physical = self.physical_name(schema.name());
        let request = KeysAndAttributes::builder()
            .set_keys(Some(keys.iter().map(to_attributes).collect()))
            .consistent_read(true)
            .build()
            .map_err(|e| Error::from_build(schema.name(), OperationKind::BatchGet, e))?;

        let output = self
            .client
            .batch_get_item()
            .request_items(&physical, request)
            .send()
            .await
            .map_err(|e| Error::from_sdk(schema.name(), OperationKind::BatchGet, e))?;

        let items = output
            .responses
            .and_then(|mut responses| responses.remove(&physical))
            .unwrap_or_default()
            .into_iter()
            .map(from_attributes)
            .collect::<Result<_>>()?;

        let unprocessed_keys = output
            .unprocessed_keys
            .and_then(|mut unprocessed| unprocessed.remove(&physical))
            .map(|keys_and_attributes| keys_and_attributes.keys)
            .unwrap_or_default()
            .into_iter()
            .map(from_attributes)
            .collect::<Result<_>>()?;

        Ok(BatchGetResponse {
            items,
            unprocessed_keys,
        })
    }

    async fn batch_write(
        &self,
        schema: &TableSchema,
        requests: Vec<WriteRequest>,
    ) -> Result<Vec<WriteRequest>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let physical = self.physical_name(schema.name());
        let build_error = |e| Error::from_build(schema.name(), OperationKind::BatchWrite, e);

        let mut write_ops = Vec::with_capacity(requests.len());
        for request in &requests {
            let write_op = match request {
                WriteRequest::Put(item) => SdkWriteRequest::builder()
                    .put_request(
                        PutRequest::builder()
                            .set_item(Some(to_attributes(item)))
                            .build()
                            .map_err(build_error)?,
                    )
                    .build(),
                WriteRequest::Delete(key) => SdkWriteRequest::builder()
                    .delete_request(
                        DeleteRequest::builder()
                            .set_key(Some(to_attributes(key)))
                            .build()
                            .map_err(build_error)?,
                    )
                    .build(),
            };
            write_ops.push(write_op);
        }

        let output = self
            .client
            .batch_write_item()
            .request_items(&physical, write_ops)
            .send()
            .await
            .map_err(|e| Error::from_sdk(schema.name(), OperationKind::BatchWrite, e))?;

        let mut unprocessed = Vec::new();
        for write_op in output
            .unprocessed_items
            .and_then(|mut items| items.remove(&physical))
            .unwrap_or_default()
        {
            if let Some(put) = write_op.put_request {
                unprocessed.push(WriteRequest::Put(from_attributes(put.item)?));
            }
            if let Some(delete) = write_op.delete_request {
                unprocessed.push(WriteRequest::Delete(from_attributes(delete.key)?));
            }
        }

        Ok(unprocessed)
    }

    async fn create_table(&self, schema: &TableSchema) -> Result<bool> {
        let (key_schema, attribute_definitions, indexes) = create_table_input(schema)
            .map_err(|e| Error::from_build(schema.name(), OperationKind::Admin, e))?;

        let result = self
            .client
            .create_table()
            .table_name(self.physical_name(schema.name()))
            .set_key_schema(Some(key_schema))
            .set_attribute_definitions(Some(attribute_definitions))
            .set_global_secondary_indexes((!indexes.is_empty()).then_some(indexes))
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await;

        match result {
            Ok(_) => {
                info!(table = schema.name(), "created table");
                Ok(true)
            }
            Err(err) => {
                // ResourceInUseException: the table already exists
                if let Some(CreateTableError::ResourceInUseException(_)) = err.as_service_error() {
                    return Ok(false);
                }
                Err(Error::from_sdk(schema.name(), OperationKind::Admin, err))
            }
        }
    }

    async fn delete_table(&self, table: &str) -> Result<bool> {
        match self
            .client
            .delete_table()
            .table_name(self.physical_name(table))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                if let Some(DeleteTableError::ResourceNotFoundException(_)) = err.as_service_error()
                {
                    return Ok(false);
                }
                Err(Error::from_sdk(table, OperationKind::Admin, err))
            }
        }
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut start = None;

        loop {
            let output = self
                .client
                .list_tables()
                .set_exclusive_start_table_name(start)
                .send()
                .await
                .map_err(|e| Error::from_sdk("", OperationKind::Admin, e))?;

            names.extend(
                output
                    .table_names
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|name| self.logical_name(name)),
            );

            match output.last_evaluated_table_name {
                Some(last) => start = Some(last),
                None => break,
            }
        }

        names.sort();
        Ok(names)
    }

    async fn ping(&self) -> Result<()> {
        let _ = self
            .client
            .list_tables()
            .limit(1)
            .send()
            .await
            .map_err(|e| Error::from_sdk("", OperationKind::Connect, e))?;
        Ok(())
    }
}
