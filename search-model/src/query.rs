use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::document::Value;
use crate::error::SearchError;

/// How sibling conditions and sub-queries combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Conjunction {
    And,
    Or,
}

impl Conjunction {
    /// Separator used by string-based query syntaxes.
    pub fn separator(self) -> &'static str {
        match self {
            Conjunction::And => " AND ",
            Conjunction::Or => " OR ",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Contains,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Operator {
    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Contains => ":",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
        }
    }

    pub fn is_range(self) -> bool { !matches!(self, Operator::Contains) }

    /// Lookup suffix recognised by [`Condition::from_lookup`].
    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "lt" => Some(Operator::Lt),
            "le" => Some(Operator::Le),
            "gt" => Some(Operator::Gt),
            "ge" => Some(Operator::Ge),
            _ => None,
        }
    }
}

/// A single `(field, operator, value)` comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self { field: field.into(), operator, value: value.into() }
    }

    pub fn contains(field: impl Into<String>, value: impl Into<Value>) -> Self { Self::new(field, Operator::Contains, value) }
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self { Self::new(field, Operator::Lt, value) }
    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self { Self::new(field, Operator::Le, value) }
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self { Self::new(field, Operator::Gt, value) }
    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self { Self::new(field, Operator::Ge, value) }

    /// Build from a lookup key such as `price__ge`. A key without a known
    /// suffix is a `contains` condition on the whole key.
    pub fn from_lookup(key: &str, value: impl Into<Value>) -> Self {
        if let Some((field, suffix)) = key.rsplit_once("__") {
            if let Some(op) = Operator::from_suffix(suffix) {
                return Self::new(field, op, value);
            }
        }
        Self::contains(key, value)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.operator.symbol(), self.value)
    }
}

/// Boolean tree of conditions, independent of any engine syntax.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    conjunction: Conjunction,
    conditions: Vec<Condition>,
    subqueries: Vec<Query>,
}

impl Default for Query {
    fn default() -> Self { Self::and() }
}

impl Query {
    pub fn and() -> Self { Self::with_conjunction(Conjunction::And) }
    pub fn or() -> Self { Self::with_conjunction(Conjunction::Or) }

    pub fn with_conjunction(conjunction: Conjunction) -> Self {
        Self { conjunction, conditions: Vec::new(), subqueries: Vec::new() }
    }

    pub fn with(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Shorthand for a `contains` condition.
    pub fn filter(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(Condition::contains(field, value))
    }

    pub fn lookup(self, key: &str, value: impl Into<Value>) -> Self {
        self.with(Condition::from_lookup(key, value))
    }

    pub fn subquery(mut self, query: Query) -> Self {
        self.subqueries.push(query);
        self
    }

    pub fn conjunction(&self) -> Conjunction { self.conjunction }
    pub fn conditions(&self) -> &[Condition] { &self.conditions }
    pub fn subqueries(&self) -> &[Query] { &self.subqueries }

    /// True when the tree holds no condition at any depth.
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty() && self.subqueries.iter().all(Query::is_empty)
    }

    /// Every condition in the tree, depth first.
    pub fn walk(&self) -> Vec<&Condition> {
        let mut out: Vec<&Condition> = self.conditions.iter().collect();
        for sq in &self.subqueries {
            out.extend(sq.walk());
        }
        out
    }

    /// Render into a string syntax. `translate` returns `None` to defer a
    /// condition; deferred conditions leave no trace in the output.
    ///
    /// Conditions are joined with the conjunction, then the sub-query group
    /// is appended in parentheses when it renders to something non-blank.
    pub fn render<F>(&self, translate: &mut F) -> String
    where
        F: FnMut(&Condition) -> Option<String>,
    {
        let sep = self.conjunction.separator();
        let fragments: Vec<String> = self
            .conditions
            .iter()
            .filter_map(|c| translate(c))
            .filter(|s| !s.trim().is_empty())
            .collect();
        let mut out = fragments.join(sep);

        let subs: Vec<String> = self
            .subqueries
            .iter()
            .map(|sq| sq.render(&mut *translate))
            .filter(|s| !s.trim().is_empty())
            .collect();
        let group = if subs.len() > 1 {
            // keep each sub-query's own conjunction from mixing with its siblings
            subs.iter().map(|s| format!("({s})")).collect::<Vec<_>>().join(sep)
        } else {
            subs.join(sep)
        };
        if !group.trim().is_empty() {
            if !out.trim().is_empty() {
                out.push_str(sep);
            }
            out.push('(');
            out.push_str(&group);
            out.push(')');
        }
        out
    }

    /// Fold the tree into engine query objects with the same grouping as
    /// [`Query::render`]. Returns `None` when nothing survives translation.
    pub fn compile<T, F, G>(&self, leaf: &mut F, combine: &mut G) -> Result<Option<T>, SearchError>
    where
        F: FnMut(&Condition) -> Result<Option<T>, SearchError>,
        G: FnMut(Conjunction, Vec<T>) -> T,
    {
        let mut fragments = Vec::new();
        for c in &self.conditions {
            if let Some(t) = leaf(c)? {
                fragments.push(t);
            }
        }
        let mut subs = Vec::new();
        for sq in &self.subqueries {
            if let Some(t) = sq.compile(&mut *leaf, &mut *combine)? {
                subs.push(t);
            }
        }
        let mut group = |items: Vec<T>| -> Option<T> {
            match items.len() {
                0 => None,
                1 => items.into_iter().next(),
                _ => Some(combine(self.conjunction, items)),
            }
        };
        let conds = group(fragments);
        let subs = group(subs);
        Ok(match (conds, subs) {
            (Some(a), Some(b)) => Some(combine(self.conjunction, vec![a, b])),
            (a, b) => a.or(b),
        })
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(&mut |c| Some(c.to_string())))
    }
}

/// One interval per field, collected from deferred range conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub start: Bound<Value>,
    pub end: Bound<Value>,
}

impl Default for Interval {
    fn default() -> Self { Self { start: Bound::Unbounded, end: Bound::Unbounded } }
}

/// Range state for a single `find()` call.
///
/// Created fresh per compilation and handed back with the compiled query.
/// A later bound on the same side of a field replaces the earlier one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    intervals: BTreeMap<String, Interval>,
}

impl RangeSet {
    pub fn new() -> Self { Self::default() }

    /// Absorb a range comparator. Returns false for `contains`.
    pub fn absorb(&mut self, condition: &Condition) -> bool {
        let value = condition.value.clone();
        let slot = || Interval::default();
        match condition.operator {
            Operator::Contains => return false,
            Operator::Gt => self.intervals.entry(condition.field.clone()).or_insert_with(slot).start = Bound::Excluded(value),
            Operator::Ge => self.intervals.entry(condition.field.clone()).or_insert_with(slot).start = Bound::Included(value),
            Operator::Lt => self.intervals.entry(condition.field.clone()).or_insert_with(slot).end = Bound::Excluded(value),
            Operator::Le => self.intervals.entry(condition.field.clone()).or_insert_with(slot).end = Bound::Included(value),
        }
        true
    }

    pub fn is_empty(&self) -> bool { self.intervals.is_empty() }
    pub fn len(&self) -> usize { self.intervals.len() }
    pub fn get(&self, field: &str) -> Option<&Interval> { self.intervals.get(field) }
    pub fn clear(&mut self) { self.intervals.clear() }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Interval)> {
        self.intervals.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

impl FromStr for Direction {
    type Err = SearchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(Direction::Asc),
            "desc" => Ok(Direction::Desc),
            other => Err(SearchError::InvalidQuery(format!("unknown sort direction {other:?}"))),
        }
    }
}

/// Ordered list of sort keys. Empty means engine relevance order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortOrder {
    keys: Vec<(String, Direction)>,
}

impl SortOrder {
    pub fn new() -> Self { Self::default() }

    pub fn asc(self, field: impl Into<String>) -> Self { self.push(field, Direction::Asc) }
    pub fn desc(self, field: impl Into<String>) -> Self { self.push(field, Direction::Desc) }

    pub fn push(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.keys.push((field.into(), direction));
        self
    }

    /// Build from `(field, "asc" | "desc")` pairs.
    pub fn parse<'a, I>(pairs: I) -> Result<Self, SearchError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut order = Self::new();
        for (field, dir) in pairs {
            order = order.push(field, dir.parse()?);
        }
        Ok(order)
    }

    pub fn keys(&self) -> &[(String, Direction)] { &self.keys }
    pub fn is_empty(&self) -> bool { self.keys.is_empty() }
}
