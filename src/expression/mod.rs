//! Condition and filter expressions.
//!
//! Callers build a [`Condition`] tree that references attributes by name
//! (or by `#alias`) and values by `:placeholder`. Binding it against the
//! value and alias maps yields a [`BoundCondition`], which the in-memory
//! backend evaluates directly and the DynamoDB backend renders into an
//! expression string through [`ExpressionRenderer`].

pub(crate) mod reserved;

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::codec::{self, Item, TypedValue};
use crate::error::{Error, Result};

/// Placeholder (`:name`) to native value
pub type ExpressionValues = HashMap<String, Value>;

/// Alias (`#name`) to real attribute name
pub type AttributeNames = HashMap<String, String>;

/// Build an [`ExpressionValues`] map from pairs.
///
/// ```
/// use serde_json::json;
/// let values = wide_table::expression::values([(":pk", json!("user#1"))]);
/// assert_eq!(values[":pk"], json!("user#1"));
/// ```
pub fn values<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Value)>) -> ExpressionValues {
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Comparison operator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparator {
    /// `=`
    Eq,
    /// `<>`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl Comparator {
    /// Operator as written in an expression
    pub fn symbol(self) -> &'static str {
        match self {
            Comparator::Eq => "=",
            Comparator::Ne => "<>",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Unbound condition tree
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    /// `attribute <op> :value`
    Compare {
        /// Attribute name or `#alias`
        attribute: String,
        /// Operator
        comparator: Comparator,
        /// Value placeholder
        value: String,
    },
    /// `attribute BETWEEN :low AND :high`, both bounds required
    Between {
        /// Attribute name or `#alias`
        attribute: String,
        /// Lower bound placeholder
        low: String,
        /// Upper bound placeholder
        high: String,
    },
    /// Inclusive range whose bounds are both optional.
    ///
    /// A bound counts as supplied when its placeholder is bound to a
    /// non-null value. Both bounds give `BETWEEN`, one gives `>=` or `<=`,
    /// none drops the clause entirely.
    Range {
        /// Attribute name or `#alias`
        attribute: String,
        /// Start placeholder
        start: String,
        /// End placeholder
        end: String,
    },
    /// `begins_with(attribute, :prefix)`
    BeginsWith {
        /// Attribute name or `#alias`
        attribute: String,
        /// Prefix placeholder
        prefix: String,
    },
    /// `attribute_exists(attribute)`
    AttributeExists(String),
    /// `attribute_not_exists(attribute)`
    AttributeNotExists(String),
    /// Conjunction
    And(Vec<Condition>),
}

impl Condition {
    /// `attribute <op> :value`
    pub fn compare(
        attribute: impl Into<String>,
        comparator: Comparator,
        value: impl Into<String>,
    ) -> Self {
        Condition::Compare {
            attribute: attribute.into(),
            comparator,
            value: value.into(),
        }
    }

    /// `attribute = :value`
    pub fn eq(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self::compare(attribute, Comparator::Eq, value)
    }

    /// `attribute <> :value`
    pub fn ne(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self::compare(attribute, Comparator::Ne, value)
    }

    /// `attribute < :value`
    pub fn lt(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self::compare(attribute, Comparator::Lt, value)
    }

    /// `attribute <= :value`
    pub fn le(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self::compare(attribute, Comparator::Le, value)
    }

    /// `attribute > :value`
    pub fn gt(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self::compare(attribute, Comparator::Gt, value)
    }

    /// `attribute >= :value`
    pub fn ge(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self::compare(attribute, Comparator::Ge, value)
    }

    /// `attribute BETWEEN :low AND :high`
    pub fn between(
        attribute: impl Into<String>,
        low: impl Into<String>,
        high: impl Into<String>,
    ) -> Self {
        Condition::Between {
            attribute: attribute.into(),
            low: low.into(),
            high: high.into(),
        }
    }

    /// Range with optional bounds, see [`Condition::Range`]
    pub fn range(
        attribute: impl Into<String>,
        start: impl Into<String>,
        end: impl Into<String>,
    ) -> Self {
        Condition::Range {
            attribute: attribute.into(),
            start: start.into(),
            end: end.into(),
        }
    }

    /// `begins_with(attribute, :prefix)`
    pub fn begins_with(attribute: impl Into<String>, prefix: impl Into<String>) -> Self {
        Condition::BeginsWith {
            attribute: attribute.into(),
            prefix: prefix.into(),
        }
    }

    /// `attribute_exists(attribute)`
    pub fn exists(attribute: impl Into<String>) -> Self {
        Condition::AttributeExists(attribute.into())
    }

    /// `attribute_not_exists(attribute)`
    pub fn not_exists(attribute: impl Into<String>) -> Self {
        Condition::AttributeNotExists(attribute.into())
    }

    /// Conjunction of `self` and `other`, flattened
    pub fn and(self, other: Condition) -> Self {
        let mut clauses = match self {
            Condition::And(clauses) => clauses,
            single => vec![single],
        };
        match other {
            Condition::And(more) => clauses.extend(more),
            single => clauses.push(single),
        }
        Condition::And(clauses)
    }

    /// Resolve aliases and placeholders.
    ///
    /// Returns `None` when nothing is left to check, which happens only for
    /// ranges without bounds (alone or in a conjunction of such ranges).
    pub fn bind(
        &self,
        values: &ExpressionValues,
        names: &AttributeNames,
    ) -> Result<Option<BoundCondition>> {
        let bound = match self {
            Condition::Compare {
                attribute,
                comparator,
                value,
            } => BoundCondition::Compare {
                attribute: resolve_name(attribute, names)?,
                comparator: *comparator,
                value: required_value(value, values)?,
            },
            Condition::Between {
                attribute,
                low,
                high,
            } => BoundCondition::Between {
                attribute: resolve_name(attribute, names)?,
                low: required_value(low, values)?,
                high: required_value(high, values)?,
            },
            Condition::Range {
                attribute,
                start,
                end,
            } => {
                let attribute = resolve_name(attribute, names)?;
                match (optional_value(start, values)?, optional_value(end, values)?) {
                    (Some(low), Some(high)) => BoundCondition::Between {
                        attribute,
                        low,
                        high,
                    },
                    (Some(low), None) => BoundCondition::Compare {
                        attribute,
                        comparator: Comparator::Ge,
                        value: low,
                    },
                    (None, Some(high)) => BoundCondition::Compare {
                        attribute,
                        comparator: Comparator::Le,
                        value: high,
                    },
                    (None, None) => return Ok(None),
                }
            }
            Condition::BeginsWith { attribute, prefix } => BoundCondition::BeginsWith {
                attribute: resolve_name(attribute, names)?,
                prefix: required_value(prefix, values)?,
            },
            Condition::AttributeExists(attribute) => {
                BoundCondition::Exists(resolve_name(attribute, names)?)
            }
            Condition::AttributeNotExists(attribute) => {
                BoundCondition::NotExists(resolve_name(attribute, names)?)
            }
            Condition::And(clauses) => {
                let mut bound = Vec::with_capacity(clauses.len());
                for clause in clauses {
                    if let Some(clause) = clause.bind(values, names)? {
                        bound.push(clause);
                    }
                }
                return Ok(BoundCondition::all(bound));
            }
        };

        Ok(Some(bound))
    }
}

fn lookup<'a>(placeholder: &str, values: &'a ExpressionValues) -> Option<&'a Value> {
    values.get(placeholder).or_else(|| match placeholder.strip_prefix(':') {
        Some(bare) => values.get(bare),
        None => values.get(&format!(":{placeholder}")),
    })
}

fn required_value(placeholder: &str, values: &ExpressionValues) -> Result<TypedValue> {
    let value = lookup(placeholder, values)
        .ok_or_else(|| Error::MissingBinding(placeholder.to_string()))?;
    codec::encode(value)
}

fn optional_value(placeholder: &str, values: &ExpressionValues) -> Result<Option<TypedValue>> {
    match lookup(placeholder, values) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => codec::encode(value).map(Some),
    }
}

fn resolve_name(attribute: &str, names: &AttributeNames) -> Result<String> {
    if !attribute.starts_with('#') {
        return Ok(attribute.to_string());
    }
    names
        .get(attribute)
        .or_else(|| names.get(&attribute[1..]))
        .cloned()
        .ok_or_else(|| Error::MissingBinding(attribute.to_string()))
}

/// Condition with real attribute names and encoded values
#[derive(Clone, Debug, PartialEq)]
pub enum BoundCondition {
    /// Comparison
    Compare {
        /// Attribute name
        attribute: String,
        /// Operator
        comparator: Comparator,
        /// Operand
        value: TypedValue,
    },
    /// Inclusive range
    Between {
        /// Attribute name
        attribute: String,
        /// Lower bound
        low: TypedValue,
        /// Upper bound
        high: TypedValue,
    },
    /// String prefix match
    BeginsWith {
        /// Attribute name
        attribute: String,
        /// Prefix
        prefix: TypedValue,
    },
    /// Attribute is present
    Exists(String),
    /// Attribute is absent
    NotExists(String),
    /// Conjunction
    And(Vec<BoundCondition>),
}

impl BoundCondition {
    /// Conjunction of `clauses`; a single clause is returned as is.
    pub fn all(mut clauses: Vec<BoundCondition>) -> Option<BoundCondition> {
        match clauses.len() {
            0 => None,
            1 => clauses.pop(),
            _ => Some(BoundCondition::And(clauses)),
        }
    }

    /// Top level clauses of a conjunction
    pub fn conjuncts(self) -> Vec<BoundCondition> {
        match self {
            BoundCondition::And(clauses) => clauses.into_iter().flat_map(Self::conjuncts).collect(),
            single => vec![single],
        }
    }

    /// Evaluate against an item.
    ///
    /// Comparisons against a missing attribute, or across types, are false.
    pub fn evaluate(&self, item: &Item) -> bool {
        match self {
            BoundCondition::Compare {
                attribute,
                comparator,
                value,
            } => {
                let Some(current) = item.get(attribute) else {
                    return false;
                };
                match comparator {
                    Comparator::Eq => current.same_value(value),
                    Comparator::Ne => !current.same_value(value),
                    _ => current.compare(value).is_some_and(|ordering| match comparator {
                        Comparator::Lt => ordering.is_lt(),
                        Comparator::Le => ordering.is_le(),
                        Comparator::Gt => ordering.is_gt(),
                        _ => ordering.is_ge(),
                    }),
                }
            }
            BoundCondition::Between {
                attribute,
                low,
                high,
            } => item.get(attribute).is_some_and(|current| {
                current.compare(low).is_some_and(|o| o.is_ge())
                    && current.compare(high).is_some_and(|o| o.is_le())
            }),
            BoundCondition::BeginsWith { attribute, prefix } => {
                match (item.get(attribute), prefix) {
                    (Some(TypedValue::S(current)), TypedValue::S(prefix)) => {
                        current.starts_with(prefix.as_str())
                    }
                    _ => false,
                }
            }
            BoundCondition::Exists(attribute) => item.contains_key(attribute),
            BoundCondition::NotExists(attribute) => !item.contains_key(attribute),
            BoundCondition::And(clauses) => clauses.iter().all(|clause| clause.evaluate(item)),
        }
    }

    fn attribute(&self) -> Option<&str> {
        match self {
            BoundCondition::Compare { attribute, .. }
            | BoundCondition::Between { attribute, .. }
            | BoundCondition::BeginsWith { attribute, .. }
            | BoundCondition::Exists(attribute)
            | BoundCondition::NotExists(attribute) => Some(attribute.as_str()),
            BoundCondition::And(_) => None,
        }
    }
}

/// Key condition split into its native parts.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyCondition {
    /// Partition key attribute
    pub partition_key: String,
    /// Value the partition key must equal
    pub partition: TypedValue,
    /// Constraint on the sort key
    pub sort: Option<BoundCondition>,
    /// Everything else, applied as a filter after the key lookup
    pub residual: Option<BoundCondition>,
}

impl KeyCondition {
    /// Split a bound condition against a (table or index) key.
    ///
    /// The first equality on the partition key and the first supported
    /// constraint on the sort key become the key condition; the remaining
    /// conjuncts become the residual filter. A remaining conjunct on either
    /// key attribute is `InvalidExpression`, since filters may only name
    /// non-key attributes.
    pub fn split(
        condition: BoundCondition,
        partition_key: &str,
        sort_key: Option<&str>,
    ) -> Result<Self> {
        let mut partition = None;
        let mut sort = None;
        let mut residual = Vec::new();

        for clause in condition.conjuncts() {
            let on = clause.attribute().map(str::to_string);
            match clause {
                BoundCondition::Compare {
                    comparator: Comparator::Eq,
                    value,
                    ..
                } if partition.is_none() && on.as_deref() == Some(partition_key) => {
                    partition = Some(value);
                }
                BoundCondition::Compare { comparator, .. }
                    if comparator != Comparator::Ne
                        && sort.is_none()
                        && on.is_some()
                        && on.as_deref() == sort_key =>
                {
                    sort = Some(clause);
                }
                BoundCondition::Between { .. } | BoundCondition::BeginsWith { .. }
                    if sort.is_none() && on.is_some() && on.as_deref() == sort_key =>
                {
                    sort = Some(clause);
                }
                other => residual.push(other),
            }
        }

        let partition = partition.ok_or_else(|| {
            Error::InvalidExpression(format!(
                "key condition must include an equality on partition key '{partition_key}'"
            ))
        })?;
        let residual = BoundCondition::all(residual);
        if let Some(residual) = &residual {
            ensure_non_key_filter(residual, partition_key, sort_key)?;
        }

        Ok(Self {
            partition_key: partition_key.to_string(),
            partition,
            sort,
            residual,
        })
    }

    /// Partition equality and sort constraint as one condition
    pub fn key_only(&self) -> BoundCondition {
        let mut clauses = vec![BoundCondition::Compare {
            attribute: self.partition_key.clone(),
            comparator: Comparator::Eq,
            value: self.partition.clone(),
        }];
        clauses.extend(self.sort.clone());
        BoundCondition::And(clauses)
    }
}

/// Reject a query filter naming the partition or sort key being queried.
pub fn ensure_non_key_filter(
    filter: &BoundCondition,
    partition_key: &str,
    sort_key: Option<&str>,
) -> Result<()> {
    match filter {
        BoundCondition::And(clauses) => clauses
            .iter()
            .try_for_each(|clause| ensure_non_key_filter(clause, partition_key, sort_key)),
        clause => match clause.attribute() {
            Some(attribute) if attribute == partition_key || Some(attribute) == sort_key => {
                Err(Error::InvalidExpression(format!(
                    "key attribute '{attribute}' can only be constrained by the key condition"
                )))
            }
            _ => Ok(()),
        },
    }
}

/// A condition guarding a single-item write, with its own bindings.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteCondition {
    /// Condition tree
    pub condition: Condition,
    /// Placeholder values
    pub values: ExpressionValues,
    /// Alias map
    pub names: AttributeNames,
}

impl WriteCondition {
    /// Condition without bindings
    pub fn new(condition: Condition) -> Self {
        Self {
            condition,
            values: ExpressionValues::new(),
            names: AttributeNames::new(),
        }
    }

    /// Only write if no item with this key exists yet
    pub fn not_exists(partition_key: impl Into<String>) -> Self {
        Self::new(Condition::not_exists(partition_key))
    }

    /// Only write if an item with this key already exists
    pub fn exists(partition_key: impl Into<String>) -> Self {
        Self::new(Condition::exists(partition_key))
    }

    /// Bind a placeholder
    pub fn with_value(mut self, placeholder: impl Into<String>, value: Value) -> Self {
        let _ = self.values.insert(placeholder.into(), value);
        self
    }

    /// Bind an alias
    pub fn with_name(mut self, alias: impl Into<String>, attribute: impl Into<String>) -> Self {
        let _ = self.names.insert(alias.into(), attribute.into());
        self
    }

    /// Resolve the condition against its own bindings
    pub fn bind(&self) -> Result<Option<BoundCondition>> {
        self.condition.bind(&self.values, &self.names)
    }
}

impl From<Condition> for WriteCondition {
    fn from(condition: Condition) -> Self {
        Self::new(condition)
    }
}

/// Renders bound conditions into DynamoDB expression strings.
///
/// One renderer is shared by every expression of a request so that
/// aliases and value placeholders never collide.
#[derive(Debug, Default)]
pub struct ExpressionRenderer {
    names: HashMap<String, String>,
    aliases: HashMap<String, String>,
    values: HashMap<String, TypedValue>,
}

impl ExpressionRenderer {
    /// Fresh renderer
    pub fn new() -> Self {
        Self::default()
    }

    /// Expression text for `condition`
    pub fn render(&mut self, condition: &BoundCondition) -> String {
        match condition {
            BoundCondition::Compare {
                attribute,
                comparator,
                value,
            } => {
                let name = self.name(attribute);
                let value = self.value(value);
                format!("{name} {comparator} {value}")
            }
            BoundCondition::Between {
                attribute,
                low,
                high,
            } => {
                let name = self.name(attribute);
                let low = self.value(low);
                let high = self.value(high);
                format!("{name} BETWEEN {low} AND {high}")
            }
            BoundCondition::BeginsWith { attribute, prefix } => {
                let name = self.name(attribute);
                let prefix = self.value(prefix);
                format!("begins_with({name}, {prefix})")
            }
            BoundCondition::Exists(attribute) => {
                format!("attribute_exists({})", self.name(attribute))
            }
            BoundCondition::NotExists(attribute) => {
                format!("attribute_not_exists({})", self.name(attribute))
            }
            BoundCondition::And(clauses) => clauses
                .iter()
                .map(|clause| match clause {
                    BoundCondition::And(_) => format!("({})", self.render(clause)),
                    _ => self.render(clause),
                })
                .collect::<Vec<_>>()
                .join(" AND "),
        }
    }

    /// Attribute reference, aliased when the name is reserved or not a plain identifier
    pub fn name(&mut self, attribute: &str) -> String {
        if !needs_alias(attribute) {
            return attribute.to_string();
        }
        if let Some(alias) = self.aliases.get(attribute) {
            return alias.clone();
        }
        let alias = format!("#n{}", self.aliases.len());
        let _ = self.aliases.insert(attribute.to_string(), alias.clone());
        let _ = self.names.insert(alias.clone(), attribute.to_string());
        alias
    }

    /// Fresh placeholder bound to `value`
    pub fn value(&mut self, value: &TypedValue) -> String {
        let placeholder = format!(":v{}", self.values.len());
        let _ = self.values.insert(placeholder.clone(), value.clone());
        placeholder
    }

    /// Alias and value maps, `None` when empty
    pub fn finish(
        self,
    ) -> (
        Option<HashMap<String, String>>,
        Option<HashMap<String, TypedValue>>,
    ) {
        let names = (!self.names.is_empty()).then_some(self.names);
        let values = (!self.values.is_empty()).then_some(self.values);
        (names, values)
    }
}

fn needs_alias(attribute: &str) -> bool {
    let plain = attribute
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && attribute.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    !plain || reserved::is_reserved(attribute)
}
