//! Table schemas and the registry that resolves them by name.
//!
//! Schemas are declared either in code through [`TableSchema::new`] and its
//! builder methods, or in the DynamoDB `CreateTable` JSON shape through
//! [`TableDefinition`] and [`SchemaRegistry::from_json`].

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use crate::codec::{Item, KeyPart, TypedValue};
use crate::error::{Error, Result};

/// Role of an attribute in a key schema
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyType {
    /// Partition key
    Hash,
    /// Sort key
    Range,
}

/// Declared scalar type of a key attribute
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarType {
    /// String
    S,
    /// Number
    N,
    /// Binary
    B,
}

/// One entry of a `KeySchema` list
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeySchemaElement {
    /// Attribute name
    pub attribute_name: String,
    /// HASH or RANGE
    pub key_type: KeyType,
}

/// One entry of an `AttributeDefinitions` list
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AttributeDefinition {
    /// Attribute name
    pub attribute_name: String,
    /// Declared scalar type
    pub attribute_type: ScalarType,
}

/// Which attributes a secondary index carries
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectionType {
    /// Every attribute
    #[default]
    All,
    /// Table and index keys only
    KeysOnly,
    /// Keys plus the listed non-key attributes
    Include,
}

/// `Projection` block of an index declaration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProjectionDefinition {
    /// Projection type, `ALL` when omitted
    #[serde(default)]
    pub projection_type: ProjectionType,
    /// Extra attributes for `INCLUDE` projections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub non_key_attributes: Option<Vec<String>>,
}

/// One entry of a `GlobalSecondaryIndexes` list
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GlobalSecondaryIndexDefinition {
    /// Index name
    pub index_name: String,
    /// Index key schema
    pub key_schema: Vec<KeySchemaElement>,
    /// Projected attributes
    #[serde(default)]
    pub projection: ProjectionDefinition,
}

/// A table declaration in the `CreateTable` shape
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TableDefinition {
    /// Table name
    pub table_name: String,
    /// Primary key schema
    pub key_schema: Vec<KeySchemaElement>,
    /// Types of the key attributes
    #[serde(default)]
    pub attribute_definitions: Vec<AttributeDefinition>,
    /// Secondary indexes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_secondary_indexes: Option<Vec<GlobalSecondaryIndexDefinition>>,
    /// Billing mode, informational
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_mode: Option<String>,
}

/// Attributes projected into a secondary index
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Projection {
    /// Every attribute
    #[default]
    All,
    /// Keys only
    KeysOnly,
    /// Keys plus these attributes
    Include(Vec<String>),
}

/// A global secondary index
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexDef {
    name: String,
    partition_key: String,
    sort_key: Option<String>,
    projection: Projection,
}

impl IndexDef {
    /// Index keyed on `partition_key`, projecting every attribute
    pub fn new(name: impl Into<String>, partition_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partition_key: partition_key.into(),
            sort_key: None,
            projection: Projection::All,
        }
    }

    /// Set the index sort key
    pub fn with_sort_key(mut self, sort_key: impl Into<String>) -> Self {
        self.sort_key = Some(sort_key.into());
        self
    }

    /// Set the projection
    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    /// Index name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index partition key attribute
    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    /// Index sort key attribute, if any
    pub fn sort_key(&self) -> Option<&str> {
        self.sort_key.as_deref()
    }

    /// Projection
    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    /// Copy of `item` restricted to what this index stores.
    pub fn project(&self, table: &TableSchema, item: &Item) -> Item {
        let include: &[String] = match &self.projection {
            Projection::All => return item.clone(),
            Projection::KeysOnly => &[],
            Projection::Include(attributes) => attributes,
        };

        item.iter()
            .filter(|(name, _)| {
                table.is_key_attribute(name)
                    || name.as_str() == self.partition_key
                    || self.sort_key.as_deref() == Some(name.as_str())
                    || include.contains(name)
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

/// Canonical, ordered form of an item's primary key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrimaryKey {
    /// Partition key value
    pub partition: KeyPart,
    /// Sort key value, for tables with a sort key
    pub sort: Option<KeyPart>,
}

/// Key schema of one table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSchema {
    name: String,
    partition_key: String,
    sort_key: Option<String>,
    attribute_types: HashMap<String, ScalarType>,
    indexes: Vec<IndexDef>,
}

impl TableSchema {
    /// Table keyed on `partition_key` only
    pub fn new(name: impl Into<String>, partition_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partition_key: partition_key.into(),
            sort_key: None,
            attribute_types: HashMap::new(),
            indexes: Vec::new(),
        }
    }

    /// Set the sort key
    pub fn with_sort_key(mut self, sort_key: impl Into<String>) -> Self {
        self.sort_key = Some(sort_key.into());
        self
    }

    /// Add a secondary index
    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    /// Declare the scalar type of a key attribute
    pub fn with_attribute_type(mut self, attribute: impl Into<String>, ty: ScalarType) -> Self {
        let _ = self.attribute_types.insert(attribute.into(), ty);
        self
    }

    /// Table name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Partition key attribute
    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    /// Sort key attribute, if any
    pub fn sort_key(&self) -> Option<&str> {
        self.sort_key.as_deref()
    }

    /// Secondary indexes
    pub fn indexes(&self) -> &[IndexDef] {
        &self.indexes
    }

    /// Declared type of an attribute, if any
    pub fn attribute_type(&self, attribute: &str) -> Option<ScalarType> {
        self.attribute_types.get(attribute).copied()
    }

    /// Look up a secondary index by name
    pub fn index(&self, name: &str) -> Result<&IndexDef> {
        self.indexes
            .iter()
            .find(|index| index.name == name)
            .ok_or_else(|| Error::UnknownIndex {
                table: self.name.clone(),
                index: name.to_string(),
            })
    }

    /// Whether `attribute` is part of the table's primary key
    pub fn is_key_attribute(&self, attribute: &str) -> bool {
        attribute == self.partition_key || self.sort_key.as_deref() == Some(attribute)
    }

    fn key_attributes(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.partition_key.as_str()).chain(self.sort_key.as_deref())
    }

    /// Read one key attribute from `item` as a key part
    pub fn key_part(&self, item: &Item, attribute: &str) -> Result<KeyPart> {
        let value = match item.get(attribute) {
            None | Some(TypedValue::Null(_)) => {
                return Err(Error::MissingKeyAttribute {
                    table: self.name.clone(),
                    attribute: attribute.to_string(),
                });
            }
            Some(value) => value,
        };

        let type_matches = match (self.attribute_type(attribute), value) {
            (None, _) => true,
            (Some(ScalarType::S), TypedValue::S(_)) => true,
            (Some(ScalarType::N), TypedValue::N(_)) => true,
            _ => false,
        };

        KeyPart::from_typed(value)
            .filter(|_| type_matches)
            .ok_or_else(|| Error::InvalidKeyAttribute {
                table: self.name.clone(),
                attribute: attribute.to_string(),
            })
    }

    /// Check that `item` carries valid values for every key attribute.
    pub fn validate_item(&self, item: &Item) -> Result<()> {
        for attribute in self.key_attributes() {
            let _ = self.key_part(item, attribute)?;
        }
        Ok(())
    }

    /// Canonical key of an item or key map
    pub fn primary_key(&self, item: &Item) -> Result<PrimaryKey> {
        let partition = self.key_part(item, &self.partition_key)?;
        let sort = match &self.sort_key {
            Some(sort_key) => Some(self.key_part(item, sort_key)?),
            None => None,
        };
        Ok(PrimaryKey { partition, sort })
    }

    /// Copy of the key attributes of `item`, validated
    pub fn extract_key(&self, item: &Item) -> Result<Item> {
        self.validate_item(item)?;
        Ok(self
            .key_attributes()
            .filter_map(|attribute| {
                item.get(attribute)
                    .map(|value| (attribute.to_string(), value.clone()))
            })
            .collect())
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::InvalidSchema {
            table: self.name.clone(),
            reason,
        };

        if self.name.is_empty() {
            return Err(invalid("table name is empty".to_string()));
        }
        if self.partition_key.is_empty() {
            return Err(invalid("partition key attribute is empty".to_string()));
        }
        if self.sort_key.as_deref() == Some(self.partition_key.as_str()) {
            return Err(invalid(format!(
                "'{}' is both partition and sort key",
                self.partition_key
            )));
        }

        let mut seen = HashSet::new();
        for index in &self.indexes {
            if index.name.is_empty() || index.partition_key.is_empty() {
                return Err(invalid(
                    "index name and partition key must not be empty".to_string(),
                ));
            }
            if !seen.insert(index.name.as_str()) {
                return Err(invalid(format!("duplicate index name '{}'", index.name)));
            }
        }

        Ok(())
    }

    /// Build a schema from a `CreateTable`-shaped declaration
    pub fn from_definition(definition: &TableDefinition) -> Result<Self> {
        let table = definition.table_name.clone();
        let invalid = |reason: String| Error::InvalidSchema {
            table: table.clone(),
            reason,
        };

        let attribute_types: HashMap<String, ScalarType> = definition
            .attribute_definitions
            .iter()
            .map(|def| (def.attribute_name.clone(), def.attribute_type))
            .collect();

        let declared = |attribute: &str| -> Result<()> {
            if attribute_types.contains_key(attribute) {
                Ok(())
            } else {
                Err(invalid(format!(
                    "key attribute '{attribute}' is missing from AttributeDefinitions"
                )))
            }
        };

        let (partition_key, sort_key) =
            split_key_schema(&definition.key_schema).map_err(|reason| invalid(reason))?;
        declared(&partition_key)?;
        if let Some(sort_key) = &sort_key {
            declared(sort_key)?;
        }

        let mut schema = TableSchema {
            name: definition.table_name.clone(),
            partition_key,
            sort_key,
            attribute_types: attribute_types.clone(),
            indexes: Vec::new(),
        };

        for gsi in definition.global_secondary_indexes.iter().flatten() {
            let (index_pk, index_sk) = split_key_schema(&gsi.key_schema)
                .map_err(|reason| invalid(format!("index '{}': {reason}", gsi.index_name)))?;
            declared(&index_pk)?;
            if let Some(index_sk) = &index_sk {
                declared(index_sk)?;
            }

            let projection = match gsi.projection.projection_type {
                ProjectionType::All => Projection::All,
                ProjectionType::KeysOnly => Projection::KeysOnly,
                ProjectionType::Include => Projection::Include(
                    gsi.projection.non_key_attributes.clone().unwrap_or_default(),
                ),
            };

            schema.indexes.push(IndexDef {
                name: gsi.index_name.clone(),
                partition_key: index_pk,
                sort_key: index_sk,
                projection,
            });
        }

        schema.validate()?;
        Ok(schema)
    }

    /// Render the schema back into its declaration shape.
    ///
    /// Key attributes without a declared type are reported as strings.
    pub fn to_definition(&self) -> TableDefinition {
        let mut key_attributes: Vec<&str> = self.key_attributes().collect();
        for index in &self.indexes {
            key_attributes.push(&index.partition_key);
            key_attributes.extend(index.sort_key.as_deref());
        }
        let mut seen = HashSet::new();
        key_attributes.retain(|attribute| seen.insert(*attribute));

        let attribute_definitions = key_attributes
            .into_iter()
            .map(|attribute| AttributeDefinition {
                attribute_name: attribute.to_string(),
                attribute_type: self.attribute_type(attribute).unwrap_or(ScalarType::S),
            })
            .collect();

        let global_secondary_indexes = (!self.indexes.is_empty()).then(|| {
            self.indexes
                .iter()
                .map(|index| GlobalSecondaryIndexDefinition {
                    index_name: index.name.clone(),
                    key_schema: key_schema(&index.partition_key, index.sort_key.as_deref()),
                    projection: match &index.projection {
                        Projection::All => ProjectionDefinition::default(),
                        Projection::KeysOnly => ProjectionDefinition {
                            projection_type: ProjectionType::KeysOnly,
                            non_key_attributes: None,
                        },
                        Projection::Include(attributes) => ProjectionDefinition {
                            projection_type: ProjectionType::Include,
                            non_key_attributes: Some(attributes.clone()),
                        },
                    },
                })
                .collect()
        });

        TableDefinition {
            table_name: self.name.clone(),
            key_schema: key_schema(&self.partition_key, self.sort_key.as_deref()),
            attribute_definitions,
            global_secondary_indexes,
            billing_mode: Some("PAY_PER_REQUEST".to_string()),
        }
    }
}

fn key_schema(partition_key: &str, sort_key: Option<&str>) -> Vec<KeySchemaElement> {
    let mut elements = vec![KeySchemaElement {
        attribute_name: partition_key.to_string(),
        key_type: KeyType::Hash,
    }];
    if let Some(sort_key) = sort_key {
        elements.push(KeySchemaElement {
            attribute_name: sort_key.to_string(),
            key_type: KeyType::Range,
        });
    }
    elements
}

fn split_key_schema(
    elements: &[KeySchemaElement],
) -> std::result::Result<(String, Option<String>), String> {
    let hash: Vec<&str> = elements
        .iter()
        .filter(|e| e.key_type == KeyType::Hash)
        .map(|e| e.attribute_name.as_str())
        .collect();
    let range: Vec<&str> = elements
        .iter()
        .filter(|e| e.key_type == KeyType::Range)
        .map(|e| e.attribute_name.as_str())
        .collect();

    match (hash.as_slice(), range.as_slice()) {
        ([pk], []) => Ok((pk.to_string(), None)),
        ([pk], [sk]) => Ok((pk.to_string(), Some(sk.to_string()))),
        ([_], _) => Err("at most one RANGE key is allowed".to_string()),
        _ => Err("exactly one HASH key is required".to_string()),
    }
}

/// Registry of table schemas, keyed by table name.
///
/// Registration is expected during startup; lookups are safe from any
/// number of tasks afterwards.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, Arc<TableSchema>>>,
}

impl SchemaRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema; a second schema for the same table is rejected.
    pub fn register(&self, schema: TableSchema) -> Result<Arc<TableSchema>> {
        schema.validate()?;

        let mut schemas = self.schemas.write().unwrap_or_else(PoisonError::into_inner);
        if schemas.contains_key(&schema.name) {
            return Err(Error::DuplicateSchema(schema.name));
        }

        let schema = Arc::new(schema);
        let _ = schemas.insert(schema.name.clone(), Arc::clone(&schema));
        Ok(schema)
    }

    /// Schema registered for `table`
    pub fn resolve(&self, table: &str) -> Result<Arc<TableSchema>> {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .cloned()
            .ok_or_else(|| Error::UnknownTable(table.to_string()))
    }

    /// Schema of `table` together with its index `index`
    pub fn resolve_index(&self, table: &str, index: &str) -> Result<(Arc<TableSchema>, IndexDef)> {
        let schema = self.resolve(table)?;
        let index = schema.index(index)?.clone();
        Ok((schema, index))
    }

    /// Registered table names, sorted
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Every registered schema, sorted by table name
    pub fn schemas(&self) -> Vec<Arc<TableSchema>> {
        let mut schemas: Vec<Arc<TableSchema>> = self
            .schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Registry populated from table declarations
    pub fn from_definitions<'a>(
        definitions: impl IntoIterator<Item = &'a TableDefinition>,
    ) -> Result<Self> {
        let registry = Self::new();
        for definition in definitions {
            let _ = registry.register(TableSchema::from_definition(definition)?)?;
        }
        Ok(registry)
    }

    /// Registry populated from a JSON array of table declarations
    pub fn from_json(json: &str) -> Result<Self> {
        let definitions: Vec<TableDefinition> = serde_json::from_str(json)?;
        Self::from_definitions(&definitions)
    }
}
