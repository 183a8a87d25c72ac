use std::collections::BTreeMap;
use std::sync::Arc;

use search_model::{
    sort_shadow_name, Direction, Document, FieldKind, Result, Schema, SearchError, SortOrder, Value,
    EMPTY_TEXT_PLACEHOLDER, SORT_SHADOW_SUFFIX,
};

/// Bookkeeping derived once from a [`Schema`] when an adapter converts it.
#[derive(Debug, Clone)]
pub struct FieldLayout {
    schema: Arc<Schema>,
    /// Fields returned in results, in schema order.
    pub stored: Vec<String>,
    /// Every non-identifier field.
    pub searchable: Vec<String>,
    pub identifier: Option<String>,
    /// `(source field, shadow field)` for every field with a sort shadow.
    pub shadows: Vec<(String, String)>,
}

/// A document after write-side preparation, ready to map into an engine document.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedDocument {
    /// Identifier value, used as the engine's native document identity.
    pub id: Option<String>,
    /// Schema fields followed by shadow fields. Numeric fields hold `Value::Integer`.
    pub values: Vec<(String, Value)>,
}

impl PreparedDocument {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.iter().find(|(n, _)| n == field).map(|(_, v)| v)
    }
}

impl FieldLayout {
    /// Validate kind/flag combinations and compute the derived field lists.
    pub fn from_schema(schema: Arc<Schema>) -> Result<Self> {
        let mut stored = Vec::new();
        let mut searchable = Vec::new();
        let mut shadows = Vec::new();
        for (name, field) in schema.fields() {
            let bad_flag = match field.kind {
                FieldKind::Identifier | FieldKind::Numeric => field.analyzed || field.split_to_terms,
                FieldKind::LongText => field.split_to_terms,
                FieldKind::ShortText => false,
            };
            if bad_flag {
                return Err(SearchError::SchemaViolation(format!(
                    "field {name}: {:?} cannot be analyzed or split to terms this way", field.kind
                )));
            }
            if field.stored {
                stored.push(name.to_string());
            }
            if field.kind != FieldKind::Identifier {
                searchable.push(name.to_string());
            }
            if field.has_sort_shadow() {
                shadows.push((name.to_string(), sort_shadow_name(name)));
            }
        }
        let identifier = schema.identifier_field().map(str::to_string);
        Ok(Self { schema, stored, searchable, identifier, shadows })
    }

    pub fn schema(&self) -> &Schema { &self.schema }

    pub fn shared_schema(&self) -> Arc<Schema> { Arc::clone(&self.schema) }

    pub fn shadow_for(&self, field: &str) -> Option<&str> {
        self.shadows.iter().find(|(src, _)| src == field).map(|(_, s)| s.as_str())
    }

    pub fn is_numeric(&self, field: &str) -> bool {
        self.schema.get(field).map(|f| f.kind == FieldKind::Numeric).unwrap_or(false)
    }

    /// Resolve a sort order into engine field names: shadows replace their
    /// source fields. Unknown or non-sortable fields are rejected.
    pub fn sort_targets(&self, order: &SortOrder) -> Result<Vec<(String, Direction)>> {
        let mut out = Vec::with_capacity(order.keys().len());
        for (name, dir) in order.keys() {
            let Some(field) = self.schema.get(name) else {
                return Err(SearchError::SchemaViolation(format!("cannot sort on unknown field {name}")));
            };
            if let Some(shadow) = self.shadow_for(name) {
                out.push((shadow.to_string(), *dir));
            } else if field.sortable || field.kind == FieldKind::Numeric {
                out.push((name.clone(), *dir));
            } else {
                return Err(SearchError::SchemaViolation(format!("field {name} is not sortable")));
            }
        }
        Ok(out)
    }

    /// Write-side preparation shared by every adapter.
    pub fn prepare(&self, doc: &Document) -> Result<PreparedDocument> {
        self.schema.validate(doc)?;
        let mut values = Vec::with_capacity(doc.len() + self.shadows.len());
        for (name, field) in self.schema.fields() {
            let Some(value) = doc.get(name) else { continue };
            let value = match (field.kind, value) {
                (FieldKind::Numeric, v) => Value::Integer(v.as_integer().ok_or_else(|| {
                    SearchError::SchemaViolation(format!("numeric field {name} holds {v:?}"))
                })?),
                (_, Value::Integer(v)) => Value::Text(v.to_string()),
                (_, Value::Text(s)) => Value::Text(placeholder_if_empty(s.clone())),
            };
            values.push((name.to_string(), value));
        }
        for (source, shadow) in &self.shadows {
            let folded = match doc.get(source) {
                Some(Value::Text(s)) => shadow_value(s),
                _ => String::new(),
            };
            values.push((shadow.clone(), Value::Text(placeholder_if_empty(folded))));
        }
        Ok(PreparedDocument { id: doc.identifier(&self.schema), values })
    }

    /// Rebuild a result document from engine output: stored fields only,
    /// numeric values coerced back to integers.
    pub fn restore<I>(&self, values: I) -> Document
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut out = BTreeMap::new();
        for (name, value) in values {
            let Some(field) = self.schema.get(&name) else { continue };
            if !field.stored {
                continue;
            }
            let value = match (field.kind, value) {
                (FieldKind::Numeric, Value::Text(s)) => match s.trim().parse::<i64>() {
                    Ok(v) => Value::Integer(v),
                    Err(_) => Value::Text(s),
                },
                (FieldKind::Numeric, v) => v,
                (_, Value::Integer(v)) => Value::Text(v.to_string()),
                (_, v) => v,
            };
            out.insert(name, value);
        }
        Document::restored(out)
    }
}

pub fn is_shadow(name: &str) -> bool { name.ends_with(SORT_SHADOW_SUFFIX) }

/// Case-folded, whitespace-free copy of `text` used for ordering.
pub fn shadow_value(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).flat_map(char::to_lowercase).collect()
}

fn placeholder_if_empty(s: String) -> String {
    if s.is_empty() { EMPTY_TEXT_PLACEHOLDER.to_string() } else { s }
}
