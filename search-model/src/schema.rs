use std::collections::HashSet;

use crate::document::{Document, Value};
use crate::error::{Result, SearchError};

/// Suffix appended to a text field name to form its sort shadow.
pub const SORT_SHADOW_SUFFIX: &str = "__isort";

/// Typed vocabulary for schema fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// Unique document key. At most one per schema.
    Identifier,
    /// Short token-like text (titles, tags, codes).
    ShortText,
    /// Free text subject to full-text analysis.
    LongText,
    /// Signed 64-bit integer.
    Numeric,
}

/// A field declaration: kind plus independent indexing flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub kind: FieldKind,
    /// Value is returned in query results.
    pub stored: bool,
    /// Value goes through full-text tokenization.
    pub analyzed: bool,
    /// Field may be used in a sort order.
    pub sortable: bool,
    /// Short text is split on token boundaries instead of kept as one token.
    pub split_to_terms: bool,
}

impl Field {
    fn of(kind: FieldKind) -> Self {
        Self { kind, stored: false, analyzed: false, sortable: false, split_to_terms: false }
    }

    pub fn identifier() -> Self { Self::of(FieldKind::Identifier) }
    pub fn short_text() -> Self { Self::of(FieldKind::ShortText) }
    /// Long text is analyzed unless switched off with [`Field::analyzed`].
    pub fn long_text() -> Self { Self { analyzed: true, ..Self::of(FieldKind::LongText) } }
    pub fn numeric() -> Self { Self::of(FieldKind::Numeric) }

    pub fn stored(mut self) -> Self { self.stored = true; self }
    pub fn analyzed(mut self, analyzed: bool) -> Self { self.analyzed = analyzed; self }
    pub fn sortable(mut self) -> Self { self.sortable = true; self }
    pub fn split_to_terms(mut self) -> Self { self.split_to_terms = true; self }

    pub fn is_text(&self) -> bool {
        matches!(self.kind, FieldKind::Identifier | FieldKind::ShortText | FieldKind::LongText)
    }

    /// Whether the engine should tokenize this field's values.
    pub fn is_tokenized(&self) -> bool {
        match self.kind {
            FieldKind::Identifier | FieldKind::Numeric => false,
            FieldKind::ShortText => self.split_to_terms || self.analyzed,
            FieldKind::LongText => self.analyzed,
        }
    }

    /// Sortable free text gets a case-folded shadow copy for ordering.
    pub fn has_sort_shadow(&self) -> bool {
        self.sortable && matches!(self.kind, FieldKind::ShortText | FieldKind::LongText)
    }
}

/// Name of the sort shadow for `field`.
pub fn sort_shadow_name(field: &str) -> String {
    format!("{field}{SORT_SHADOW_SUFFIX}")
}

/// Ordered, immutable mapping from field name to [`Field`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<(String, Field)>,
    identifier: Option<usize>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder { SchemaBuilder::default() }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, f)| f)
    }

    pub fn contains(&self, name: &str) -> bool { self.get(name).is_some() }

    /// Fields in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.fields.iter().map(|(n, f)| (n.as_str(), f))
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn len(&self) -> usize { self.fields.len() }
    pub fn is_empty(&self) -> bool { self.fields.is_empty() }

    /// Name of the identifier field, if the schema declares one.
    pub fn identifier_field(&self) -> Option<&str> {
        self.identifier.map(|i| self.fields[i].0.as_str())
    }

    /// Check that `doc` may be written against this schema.
    pub fn validate(&self, doc: &Document) -> Result<()> {
        for (name, value) in doc.iter() {
            let Some(field) = self.get(name) else {
                return Err(SearchError::SchemaViolation(format!(
                    "{} not in {}",
                    name,
                    self.field_names().join(",")
                )));
            };
            if field.kind == FieldKind::Numeric {
                if let Value::Text(s) = value {
                    if s.trim().parse::<i64>().is_err() {
                        return Err(SearchError::SchemaViolation(format!(
                            "numeric field {name} holds non-integer value {s:?}"
                        )));
                    }
                }
            }
        }
        if let Some(id_field) = self.identifier_field() {
            if doc.identifier(self).is_none() {
                return Err(SearchError::SchemaViolation(format!(
                    "identifier field {id_field} is missing"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct SchemaBuilder {
    fields: Vec<(String, Field)>,
}

impl SchemaBuilder {
    pub fn field(mut self, name: impl Into<String>, field: Field) -> Self {
        self.fields.push((name.into(), field));
        self
    }

    pub fn build(self) -> Result<Schema> {
        let mut seen = HashSet::new();
        let mut identifier: Option<usize> = None;
        for (i, (name, field)) in self.fields.iter().enumerate() {
            check_field_name(name)?;
            if !seen.insert(name.as_str()) {
                return Err(SearchError::SchemaViolation(format!("duplicate field {name}")));
            }
            if field.kind == FieldKind::Identifier {
                if let Some(prev) = identifier {
                    let prev_name: &String = &self.fields[prev].0;
                    return Err(SearchError::SchemaViolation(format!(
                        "more than one identifier field: {prev_name}, {name}"
                    )));
                }
                identifier = Some(i);
            }
        }
        Ok(Schema { fields: self.fields, identifier })
    }
}

fn check_field_name(name: &str) -> Result<()> {
    let valid_chars = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with('_');
    if !valid_chars {
        return Err(SearchError::SchemaViolation(format!(
            "invalid field name {name:?}: use ASCII letters, digits and '_' and do not start with '_'"
        )));
    }
    if name.ends_with(SORT_SHADOW_SUFFIX) {
        return Err(SearchError::SchemaViolation(format!(
            "field name {name} collides with the sort shadow suffix"
        )));
    }
    Ok(())
}
