//! Filter expressions and aggregation stages.
//!
//! Field paths are dotted (`members.user_id`). When a path crosses an array
//! every element is visited, so `members.user_id` yields one value per
//! member. Equality against an array field matches when any element is
//! equal, the way document databases treat arrays.

use super::{Collection, Document};
use chrono::{DateTime, Utc};
use fleet_core::Timestamp;
use serde_json::Value;
use std::cmp::Ordering;

// ============================================================================
// EXPRESSIONS
// ============================================================================

/// Boolean predicate over a document.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    True,
    Eq(String, Value),
    Ne(String, Value),
    In(String, Vec<Value>),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    /// Case-insensitive substring match on a string field.
    Contains(String, String),
    /// Array field holds every listed value.
    All(String, Vec<Value>),
    /// Field is present and non-null (`true`) or absent/null (`false`).
    Exists(String, bool),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Expr::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Expr::Ne(field.into(), value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Expr::Gt(field.into(), value.into())
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Expr::Gte(field.into(), value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Expr::Lt(field.into(), value.into())
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Expr::Lte(field.into(), value.into())
    }

    pub fn exists(field: impl Into<String>, present: bool) -> Self {
        Expr::Exists(field.into(), present)
    }

    /// Conjunction, flattening nested `And`s and dropping `True`.
    pub fn and(exprs: impl IntoIterator<Item = Expr>) -> Self {
        let mut out = Vec::new();
        for e in exprs {
            match e {
                Expr::True => {}
                Expr::And(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => Expr::True,
            1 => out.remove(0),
            _ => Expr::And(out),
        }
    }

    pub fn or(exprs: impl IntoIterator<Item = Expr>) -> Self {
        Expr::Or(exprs.into_iter().collect())
    }

    pub fn not(expr: Expr) -> Self {
        Expr::Not(Box::new(expr))
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Expr::True => true,
            Expr::Eq(field, value) => field_equals(doc, field, value),
            Expr::Ne(field, value) => !field_equals(doc, field, value),
            Expr::In(field, values) => values.iter().any(|v| field_equals(doc, field, v)),
            Expr::Gt(field, value) => field_compares(doc, field, value, |o| o == Ordering::Greater),
            Expr::Gte(field, value) => field_compares(doc, field, value, |o| o != Ordering::Less),
            Expr::Lt(field, value) => field_compares(doc, field, value, |o| o == Ordering::Less),
            Expr::Lte(field, value) => {
                field_compares(doc, field, value, |o| o != Ordering::Greater)
            }
            Expr::Contains(field, needle) => {
                let needle = needle.to_lowercase();
                scalars(doc, field).into_iter().any(|v| {
                    v.as_str()
                        .is_some_and(|s| s.to_lowercase().contains(&needle))
                })
            }
            Expr::All(field, wanted) => lookup_path(doc, field).into_iter().any(|v| match v {
                Value::Array(items) => wanted
                    .iter()
                    .all(|w| items.iter().any(|item| values_equal(item, w))),
                single => wanted.len() == 1 && values_equal(single, &wanted[0]),
            }),
            Expr::Exists(field, present) => {
                let found = lookup_path(doc, field).into_iter().any(|v| !v.is_null());
                found == *present
            }
            Expr::And(exprs) => exprs.iter().all(|e| e.matches(doc)),
            Expr::Or(exprs) => exprs.iter().any(|e| e.matches(doc)),
            Expr::Not(inner) => !inner.matches(doc),
        }
    }
}

fn field_equals(doc: &Document, field: &str, value: &Value) -> bool {
    let found = lookup_path(doc, field);
    if value.is_null() {
        return found.is_empty() || found.iter().any(|v| v.is_null());
    }
    found.into_iter().any(|v| match v {
        Value::Array(items) if !value.is_array() => items.iter().any(|i| values_equal(i, value)),
        other => values_equal(other, value),
    })
}

fn field_compares(
    doc: &Document,
    field: &str,
    value: &Value,
    accept: impl Fn(Ordering) -> bool,
) -> bool {
    scalars(doc, field)
        .into_iter()
        .any(|v| compare_values(v, value).is_some_and(&accept))
}

/// Values at `path`, with array fields expanded into their elements.
fn scalars<'a>(doc: &'a Document, path: &str) -> Vec<&'a Value> {
    let mut out = Vec::new();
    for v in lookup_path(doc, path) {
        match v {
            Value::Array(items) => out.extend(items.iter()),
            other => out.push(other),
        }
    }
    out
}

// ============================================================================
// PATHS AND COMPARISON
// ============================================================================

/// Every value reachable at a dotted path, descending through arrays.
pub fn lookup_path<'a>(doc: &'a Document, path: &str) -> Vec<&'a Value> {
    let mut segments = path.split('.');
    let first = match segments.next().and_then(|s| doc.get(s)) {
        Some(v) => v,
        None => return Vec::new(),
    };
    let mut current = vec![first];
    for segment in segments {
        let mut next = Vec::new();
        for value in current {
            match value {
                Value::Object(map) => next.extend(map.get(segment)),
                Value::Array(items) => {
                    for item in items {
                        if let Value::Object(map) = item {
                            next.extend(map.get(segment));
                        }
                    }
                }
                _ => {}
            }
        }
        current = next;
    }
    current
}

/// The single value at a dotted path, without array traversal.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Parse an RFC 3339 timestamp string.
fn as_datetime(v: &Value) -> Option<DateTime<Utc>> {
    let s = v.as_str()?;
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Total-ish order over JSON scalars. Timestamps compare chronologically,
/// numbers numerically, strings lexicographically. Mismatched types are
/// unordered.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => match (as_datetime(a), as_datetime(b)) {
            (Some(dx), Some(dy)) => Some(dx.cmp(&dy)),
            _ => Some(x.cmp(y)),
        },
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

/// Ordering used by sort stages: missing and null sort first.
fn sort_compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let rank = |v: Option<&Value>| match v {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(_) => 4,
    };
    match (a, b) {
        (Some(x), Some(y)) => match compare_values(x, y) {
            Some(o) => o,
            None => rank(a).cmp(&rank(b)),
        },
        _ => rank(a).cmp(&rank(b)),
    }
}

// ============================================================================
// STAGES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub order: SortOrder,
}

impl SortKey {
    pub fn new(field: impl Into<String>, order: SortOrder) -> Self {
        Self {
            field: field.into(),
            order,
        }
    }
}

/// Value computed by a `Set` stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Computed {
    Literal(Value),
    /// True iff `last_seen` is at or after `cutoff` and `disconnected_at`
    /// is absent or null.
    Online {
        last_seen: String,
        disconnected_at: String,
        cutoff: Timestamp,
    },
    /// `sub_field` of the first element of an array field, or null.
    FirstOf { array: String, sub_field: String },
    /// Length of an array field (0 when absent).
    Size(String),
}

impl Computed {
    fn evaluate(&self, doc: &Document) -> Value {
        match self {
            Computed::Literal(v) => v.clone(),
            Computed::Online {
                last_seen,
                disconnected_at,
                cutoff,
            } => {
                let disconnected = get_path(doc, disconnected_at).is_some_and(|v| !v.is_null());
                let recent = get_path(doc, last_seen)
                    .and_then(as_datetime)
                    .is_some_and(|seen| seen >= *cutoff);
                Value::Bool(recent && !disconnected)
            }
            Computed::FirstOf { array, sub_field } => get_path(doc, array)
                .and_then(Value::as_array)
                .and_then(|items| items.first())
                .and_then(Value::as_object)
                .and_then(|first| get_path(first, sub_field))
                .cloned()
                .unwrap_or(Value::Null),
            Computed::Size(array) => {
                let n = get_path(doc, array)
                    .and_then(Value::as_array)
                    .map_or(0, |items| items.len());
                Value::from(n as u64)
            }
        }
    }
}

/// One step of an aggregation pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Expr),
    Sort(Vec<SortKey>),
    Skip(u64),
    Limit(u64),
    /// Left outer join: sets `as_field` to the array of documents in `from`
    /// whose `foreign_field` equals this document's `local_field`.
    Lookup {
        from: Collection,
        local_field: String,
        foreign_field: String,
        as_field: String,
    },
    Set {
        field: String,
        value: Computed,
    },
    Unset(Vec<String>),
    /// Replace the stream with a single `{field: n}` document.
    Count(String),
}

impl Stage {
    /// Apply this stage to a document stream. `foreign` resolves the
    /// contents of another collection for lookups.
    pub fn apply<'a>(
        &self,
        docs: Vec<Document>,
        foreign: &dyn Fn(Collection) -> &'a [Document],
    ) -> Vec<Document> {
        match self {
            Stage::Match(expr) => docs.into_iter().filter(|d| expr.matches(d)).collect(),
            Stage::Sort(keys) => {
                let mut docs = docs;
                docs.sort_by(|a, b| {
                    for key in keys {
                        let o = sort_compare(get_path(a, &key.field), get_path(b, &key.field));
                        let o = match key.order {
                            SortOrder::Asc => o,
                            SortOrder::Desc => o.reverse(),
                        };
                        if o != Ordering::Equal {
                            return o;
                        }
                    }
                    Ordering::Equal
                });
                docs
            }
            Stage::Skip(n) => docs.into_iter().skip(*n as usize).collect(),
            Stage::Limit(n) => docs.into_iter().take(*n as usize).collect(),
            Stage::Lookup {
                from,
                local_field,
                foreign_field,
                as_field,
            } => {
                let others = foreign(*from);
                docs.into_iter()
                    .map(|mut doc| {
                        let joined: Vec<Value> = match get_path(&doc, local_field) {
                            Some(local) if !local.is_null() => others
                                .iter()
                                .filter(|o| field_equals(o, foreign_field, local))
                                .map(|o| Value::Object(o.clone()))
                                .collect(),
                            _ => Vec::new(),
                        };
                        set_path(&mut doc, as_field, Value::Array(joined));
                        doc
                    })
                    .collect()
            }
            Stage::Set { field, value } => docs
                .into_iter()
                .map(|mut doc| {
                    let v = value.evaluate(&doc);
                    set_path(&mut doc, field, v);
                    doc
                })
                .collect(),
            Stage::Unset(fields) => docs
                .into_iter()
                .map(|mut doc| {
                    for f in fields {
                        remove_path(&mut doc, f);
                    }
                    doc
                })
                .collect(),
            Stage::Count(field) => {
                let mut out = Document::new();
                out.insert(field.clone(), Value::from(docs.len() as u64));
                vec![out]
            }
        }
    }
}

/// An ordered list of stages.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    pub fn with(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// A pipeline consisting of a single match.
    pub fn matching(expr: Expr) -> Self {
        Self::new().with(Stage::Match(expr))
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Collections joined by lookup stages.
    pub fn foreign_collections(&self) -> Vec<Collection> {
        self.stages
            .iter()
            .filter_map(|s| match s {
                Stage::Lookup { from, .. } => Some(*from),
                _ => None,
            })
            .collect()
    }

    pub fn run<'a>(
        &self,
        docs: Vec<Document>,
        foreign: &dyn Fn(Collection) -> &'a [Document],
    ) -> Vec<Document> {
        self.stages
            .iter()
            .fold(docs, |acc, stage| stage.apply(acc, foreign))
    }
}

impl From<Vec<Stage>> for Pipeline {
    fn from(stages: Vec<Stage>) -> Self {
        Self { stages }
    }
}

// ============================================================================
// DOCUMENT MUTATION
// ============================================================================

/// Set a dotted path, creating intermediate objects as needed.
pub fn set_path(doc: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            if !entry.is_object() {
                *entry = Value::Object(Document::new());
            }
            if let Value::Object(inner) = entry {
                set_path(inner, rest, value);
            }
        }
    }
}

/// Remove a dotted path. Returns the removed value.
pub fn remove_path(doc: &mut Document, path: &str) -> Option<Value> {
    match path.split_once('.') {
        None => doc.remove(path),
        Some((head, rest)) => match doc.get_mut(head) {
            Some(Value::Object(inner)) => remove_path(inner, rest),
            _ => None,
        },
    }
}

pub fn get_path_mut<'a>(doc: &'a mut Document, path: &str) -> Option<&'a mut Value> {
    match path.split_once('.') {
        None => doc.get_mut(path),
        Some((head, rest)) => match doc.get_mut(head) {
            Some(Value::Object(inner)) => get_path_mut(inner, rest),
            _ => None,
        },
    }
}
