//! Conversion between native values and the tagged wire representation.
//!
//! Native values are [`serde_json::Value`]s. The wire representation is
//! [`TypedValue`], which serializes to the single-key objects DynamoDB uses:
//! `{"S": "abc"}`, `{"N": "12"}`, `{"BOOL": true}`, `{"NULL": true}`,
//! `{"L": [...]}` and `{"M": {...}}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::{Error, Result};

/// Deepest list/map nesting accepted by [`encode`].
pub const MAX_NESTING_DEPTH: usize = 32;

/// Tags a single-key object must use to count as encoded.
pub const TYPE_TAGS: [&str; 6] = ["S", "N", "BOOL", "NULL", "L", "M"];

/// Typed wire value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TypedValue {
    /// String
    #[serde(rename = "S")]
    S(String),
    /// Number, carried as decimal text
    #[serde(rename = "N")]
    N(String),
    /// Boolean
    #[serde(rename = "BOOL")]
    Bool(bool),
    /// Null marker, always `true` when produced by this crate
    #[serde(rename = "NULL")]
    Null(bool),
    /// Ordered list
    #[serde(rename = "L")]
    L(Vec<TypedValue>),
    /// String keyed map
    #[serde(rename = "M")]
    M(HashMap<String, TypedValue>),
}

/// An encoded item: attribute name to typed value.
pub type Item = HashMap<String, TypedValue>;

/// A decoded item as handed back to callers.
pub type NativeItem = Map<String, Value>;

impl TypedValue {
    /// The null value
    pub fn null() -> Self {
        TypedValue::Null(true)
    }

    /// Build a number from a float, rejecting NaN and infinities
    pub fn from_f64(value: f64) -> Result<Self> {
        if !value.is_finite() {
            return Err(Error::UnencodableType(format!(
                "non-finite number {value}"
            )));
        }
        Number::from_f64(value)
            .map(|n| TypedValue::N(n.to_string()))
            .ok_or_else(|| Error::UnencodableType(format!("non-finite number {value}")))
    }

    /// Wire tag of this value
    pub fn tag(&self) -> &'static str {
        match self {
            TypedValue::S(_) => "S",
            TypedValue::N(_) => "N",
            TypedValue::Bool(_) => "BOOL",
            TypedValue::Null(_) => "NULL",
            TypedValue::L(_) => "L",
            TypedValue::M(_) => "M",
        }
    }

    /// Whether this is the null marker
    pub fn is_null(&self) -> bool {
        matches!(self, TypedValue::Null(_))
    }

    /// Order two scalars of the same type.
    ///
    /// Numbers compare numerically, strings lexicographically by bytes and
    /// booleans with `false < true`. Mixed types, lists, maps and nulls do
    /// not compare.
    pub fn compare(&self, other: &TypedValue) -> Option<Ordering> {
        match (self, other) {
            (TypedValue::S(a), TypedValue::S(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
            (TypedValue::N(a), TypedValue::N(b)) => {
                let a: f64 = a.parse().ok()?;
                let b: f64 = b.parse().ok()?;
                a.partial_cmp(&b)
            }
            (TypedValue::Bool(a), TypedValue::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Equality with numeric normalisation (`1` equals `1.0`).
    pub fn same_value(&self, other: &TypedValue) -> bool {
        match (self, other) {
            (TypedValue::L(a), TypedValue::L(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_value(y))
            }
            (TypedValue::M(a), TypedValue::M(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|other| v.same_value(other)))
            }
            (TypedValue::Null(_), TypedValue::Null(_)) => true,
            _ => self.compare(other) == Some(Ordering::Equal),
        }
    }
}

/// Scalar value usable as part of a primary or index key.
///
/// Totally ordered so keys can live in ordered maps; numbers are compared
/// by value, so `"1"` and `"1.0"` are the same key.
#[derive(Clone, Debug)]
pub enum KeyPart {
    /// Boolean key
    Bool(bool),
    /// Numeric key
    Number(f64),
    /// String key
    String(String),
}

impl KeyPart {
    /// Extract a key part from a typed value; only scalars qualify.
    pub fn from_typed(value: &TypedValue) -> Option<Self> {
        match value {
            TypedValue::S(s) => Some(KeyPart::String(s.clone())),
            TypedValue::N(n) => n
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(|v| KeyPart::Number(if v == 0.0 { 0.0 } else { v })),
            TypedValue::Bool(b) => Some(KeyPart::Bool(*b)),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            KeyPart::Bool(_) => 0,
            KeyPart::Number(_) => 1,
            KeyPart::String(_) => 2,
        }
    }
}

impl PartialEq for KeyPart {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyPart {}

impl PartialOrd for KeyPart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyPart {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyPart::Bool(a), KeyPart::Bool(b)) => a.cmp(b),
            (KeyPart::Number(a), KeyPart::Number(b)) => a.total_cmp(b),
            (KeyPart::String(a), KeyPart::String(b)) => a.as_bytes().cmp(b.as_bytes()),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for KeyPart {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            KeyPart::Bool(b) => b.hash(state),
            KeyPart::Number(n) => n.to_bits().hash(state),
            KeyPart::String(s) => s.hash(state),
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Bool(b) => write!(f, "{b}"),
            KeyPart::Number(n) => write!(f, "{n}"),
            KeyPart::String(s) => f.write_str(s),
        }
    }
}

/// Encode a native value
pub fn encode(value: &Value) -> Result<TypedValue> {
    encode_at(value, 0)
}

fn encode_at(value: &Value, depth: usize) -> Result<TypedValue> {
    if depth > MAX_NESTING_DEPTH {
        return Err(Error::UnencodableType(format!(
            "nesting deeper than {MAX_NESTING_DEPTH} levels"
        )));
    }

    Ok(match value {
        Value::Null => TypedValue::null(),
        Value::Bool(b) => TypedValue::Bool(*b),
        Value::Number(n) => encode_number(n)?,
        Value::String(s) => TypedValue::S(s.clone()),
        Value::Array(values) => TypedValue::L(
            values
                .iter()
                .map(|v| encode_at(v, depth + 1))
                .collect::<Result<_>>()?,
        ),
        Value::Object(map) => TypedValue::M(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), encode_at(v, depth + 1)?)))
                .collect::<Result<_>>()?,
        ),
    })
}

fn encode_number(n: &Number) -> Result<TypedValue> {
    if let Some(f) = n.as_f64() {
        if !f.is_finite() {
            return Err(Error::UnencodableType(format!("non-finite number {n}")));
        }
    }
    Ok(TypedValue::N(n.to_string()))
}

/// Decode a typed value back into a native value
pub fn decode(value: &TypedValue) -> Result<Value> {
    Ok(match value {
        TypedValue::S(s) => Value::String(s.clone()),
        TypedValue::N(n) => Value::Number(decode_number(n)?),
        TypedValue::Bool(b) => Value::Bool(*b),
        TypedValue::Null(_) => Value::Null,
        TypedValue::L(values) => Value::Array(values.iter().map(decode).collect::<Result<_>>()?),
        TypedValue::M(map) => Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), decode(v)?)))
                .collect::<Result<_>>()?,
        ),
    })
}

fn decode_number(text: &str) -> Result<Number> {
    let text = text.trim();
    if let Ok(n) = text.parse::<u64>() {
        return Ok(Number::from(n));
    }
    if let Ok(n) = text.parse::<i64>() {
        return Ok(Number::from(n));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .ok_or_else(|| Error::UnencodableType(format!("'{text}' is not a finite number")))
}

/// Encode every attribute of a native item
pub fn encode_item(item: &NativeItem) -> Result<Item> {
    item.iter()
        .map(|(k, v)| Ok((k.clone(), encode(v)?)))
        .collect()
}

/// Decode every attribute of an encoded item
pub fn decode_item(item: &Item) -> Result<NativeItem> {
    item.iter()
        .map(|(k, v)| Ok((k.clone(), decode(v)?)))
        .collect()
}

/// Whether every value of a flat mapping is already a single-key tagged object.
///
/// Used to tell an encoded item from a plain one before encoding, so that
/// items which are already on the wire are not wrapped twice.
pub fn is_encoded(candidate: &Value) -> bool {
    let Value::Object(map) = candidate else {
        return false;
    };

    map.values().all(|value| match value {
        Value::Object(tagged) => {
            tagged.len() == 1 && tagged.keys().all(|tag| TYPE_TAGS.contains(&tag.as_str()))
        }
        _ => false,
    })
}

/// Accept either a plain item or an already encoded one and return the encoded form.
pub fn normalize_item(value: Value) -> Result<Item> {
    if is_encoded(&value) {
        return serde_json::from_value(value)
            .map_err(|e| Error::UnencodableType(format!("malformed encoded item: {e}")));
    }

    match value {
        Value::Object(map) => encode_item(&map),
        other => Err(Error::UnencodableType(format!(
            "an item must be a map, got {}",
            kind_of(&other)
        ))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a map",
    }
}

impl TryFrom<serde_dynamo::AttributeValue> for TypedValue {
    type Error = Error;

    fn try_from(value: serde_dynamo::AttributeValue) -> Result<Self> {
        use serde_dynamo::AttributeValue as Av;

        Ok(match value {
            Av::S(s) => TypedValue::S(s),
            Av::N(n) => {
                let _ = decode_number(&n)?;
                TypedValue::N(n)
            }
            Av::Bool(b) => TypedValue::Bool(b),
            Av::Null(_) => TypedValue::null(),
            Av::L(values) => TypedValue::L(
                values
                    .into_iter()
                    .map(TypedValue::try_from)
                    .collect::<Result<_>>()?,
            ),
            Av::M(map) => TypedValue::M(
                map.into_iter()
                    .map(|(k, v)| Ok((k, TypedValue::try_from(v)?)))
                    .collect::<Result<_>>()?,
            ),
            Av::Ss(values) => TypedValue::L(values.into_iter().map(TypedValue::S).collect()),
            Av::Ns(values) => TypedValue::L(
                values
                    .into_iter()
                    .map(|n| decode_number(&n).map(|_| TypedValue::N(n)))
                    .collect::<Result<_>>()?,
            ),
            Av::B(_) | Av::Bs(_) => {
                return Err(Error::UnencodableType(
                    "binary attributes are not supported".to_string(),
                ));
            }
        })
    }
}

impl From<TypedValue> for serde_dynamo::AttributeValue {
    fn from(value: TypedValue) -> Self {
        use serde_dynamo::AttributeValue as Av;

        match value {
            TypedValue::S(s) => Av::S(s),
            TypedValue::N(n) => Av::N(n),
            TypedValue::Bool(b) => Av::Bool(b),
            TypedValue::Null(b) => Av::Null(b),
            TypedValue::L(values) => Av::L(values.into_iter().map(Into::into).collect()),
            TypedValue::M(map) => Av::M(map.into_iter().map(|(k, v)| (k, v.into())).collect()),
        }
    }
}
