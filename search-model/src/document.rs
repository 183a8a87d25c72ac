use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::schema::Schema;

/// Placeholder written instead of an empty string; some engines refuse to index "".
pub const EMPTY_TEXT_PLACEHOLDER: &str = " ";

/// A single typed field value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Text(String),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Integer(_) => None,
        }
    }

    /// Integer view; text is parsed, since several engines hand numbers back as strings.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            Value::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{v}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Value::Text(s.to_string()) }
}

impl From<String> for Value {
    fn from(s: String) -> Self { Value::Text(s) }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self { Value::Integer(v) }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self { Value::Integer(v as i64) }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self { Value::Integer(v as i64) }
}

/// How a document came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Built by the caller for writing; input normalization applied.
    Authored,
    /// Rebuilt from an engine result; values kept as returned.
    Restored,
}

/// A record of field values conforming to a [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    values: BTreeMap<String, Value>,
    origin: Origin,
}

impl Default for Document {
    fn default() -> Self { Self::new() }
}

impl Document {
    /// Empty authored document.
    pub fn new() -> Self {
        Self { values: BTreeMap::new(), origin: Origin::Authored }
    }

    pub fn authored<K, V, I>(values: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        values.into_iter().fold(Self::new(), |doc, (k, v)| doc.with(k, v))
    }

    /// Rebuild a document from engine output. No normalization is applied.
    pub fn restored(values: BTreeMap<String, Value>) -> Self {
        Self { values, origin: Origin::Restored }
    }

    /// Builder-style insert.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        let mut value = value.into();
        if self.origin == Origin::Authored {
            normalize(&mut value);
        }
        self.values.insert(field.into(), value);
    }

    pub fn get(&self, field: &str) -> Option<&Value> { self.values.get(field) }

    pub fn remove(&mut self, field: &str) -> Option<Value> { self.values.remove(field) }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize { self.values.len() }
    pub fn is_empty(&self) -> bool { self.values.is_empty() }
    pub fn origin(&self) -> Origin { self.origin }
    pub fn is_restored(&self) -> bool { self.origin == Origin::Restored }

    pub fn into_values(self) -> BTreeMap<String, Value> { self.values }

    /// Value of the schema's identifier field, rendered as text.
    ///
    /// Blank text counts as absent.
    pub fn identifier(&self, schema: &Schema) -> Option<String> {
        let field = schema.identifier_field()?;
        match self.values.get(field)? {
            Value::Text(s) if s.trim().is_empty() => None,
            v => Some(v.to_string()),
        }
    }
}

fn normalize(value: &mut Value) {
    if let Value::Text(s) = value {
        if s.is_empty() {
            s.push_str(EMPTY_TEXT_PLACEHOLDER);
        }
    }
}
