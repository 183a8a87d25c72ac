//! Engine-independent schema, document and query model shared across crates

pub mod document;
pub mod error;
pub mod query;
pub mod schema;

pub use document::{Document, Origin, Value, EMPTY_TEXT_PLACEHOLDER};
pub use error::{Result, SearchError};
pub use query::{Condition, Conjunction, Direction, Interval, Operator, Query, RangeSet, SortOrder};
pub use schema::{sort_shadow_name, Field, FieldKind, Schema, SchemaBuilder, SORT_SHADOW_SUFFIX};
