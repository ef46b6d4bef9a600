//! Query vocabulary shared by every store adapter: filters, find options, updates, indexes.

use serde_json::{Map, Value};

use crate::types::GeoPoint;

/// A schemaless record as it crosses the store boundary.
pub type Document = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
  Items,
  Events,
}

impl Collection {
  pub fn name(self) -> &'static str {
    match self {
      Self::Items => "items",
      Self::Events => "events",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
  Gt,
  Gte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
  Null,
  Bool,
  Number,
  String,
  Array,
  Object,
}

impl ValueKind {
  pub fn of(v: &Value) -> Self {
    match v {
      Value::Null => Self::Null,
      Value::Bool(_) => Self::Bool,
      Value::Number(_) => Self::Number,
      Value::String(_) => Self::String,
      Value::Array(_) => Self::Array,
      Value::Object(_) => Self::Object,
    }
  }
}

/// Document predicate. Dotted paths descend into objects and fan out over arrays.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
  All,
  Eq(String, Value),
  Cmp(String, CmpOp, Value),
  /// Array at path contains every listed value.
  ContainsAll(String, Vec<Value>),
  Exists(String, bool),
  Type(String, ValueKind),
  Regex {
    path: String,
    pattern: String,
    case_insensitive: bool,
  },
  /// Full-text match against the collection's text index.
  Text(String),
  /// Within `max_meters` of `center`; requires a 2d-sphere index on `path`.
  Near {
    path: String,
    center: GeoPoint,
    max_meters: f64,
  },
  /// Some element of the array at path satisfies the inner filter.
  ElemMatch(String, Box<Filter>),
  And(Vec<Filter>),
  Not(Box<Filter>),
}

pub fn eq(path: &str, value: impl Into<Value>) -> Filter {
  Filter::Eq(path.into(), value.into())
}

pub fn gt(path: &str, value: impl Into<Value>) -> Filter {
  Filter::Cmp(path.into(), CmpOp::Gt, value.into())
}

pub fn gte(path: &str, value: impl Into<Value>) -> Filter {
  Filter::Cmp(path.into(), CmpOp::Gte, value.into())
}

pub fn all_of<V: Into<Value>>(path: &str, values: impl IntoIterator<Item = V>) -> Filter {
  Filter::ContainsAll(path.into(), values.into_iter().map(Into::into).collect())
}

pub fn exists(path: &str) -> Filter {
  Filter::Exists(path.into(), true)
}

pub fn missing(path: &str) -> Filter {
  Filter::Exists(path.into(), false)
}

pub fn is_type(path: &str, kind: ValueKind) -> Filter {
  Filter::Type(path.into(), kind)
}

pub fn regex(path: &str, pattern: impl Into<String>) -> Filter {
  Filter::Regex {
    path: path.into(),
    pattern: pattern.into(),
    case_insensitive: false,
  }
}

pub fn regex_ci(path: &str, pattern: impl Into<String>) -> Filter {
  Filter::Regex {
    path: path.into(),
    pattern: pattern.into(),
    case_insensitive: true,
  }
}

pub fn text(query: impl Into<String>) -> Filter {
  Filter::Text(query.into())
}

pub fn near(path: &str, center: GeoPoint, max_meters: f64) -> Filter {
  Filter::Near {
    path: path.into(),
    center,
    max_meters,
  }
}

pub fn elem_match(path: &str, inner: Filter) -> Filter {
  Filter::ElemMatch(path.into(), Box::new(inner))
}

pub fn and(filters: Vec<Filter>) -> Filter {
  Filter::And(filters)
}

pub fn not(filter: Filter) -> Filter {
  Filter::Not(Box::new(filter))
}

/// Present and not explicitly null.
pub fn present(path: &str) -> Filter {
  and(vec![exists(path), not(is_type(path, ValueKind::Null))])
}

impl Filter {
  /// Equality pairs implied by the filter (used to seed upserted documents).
  pub fn equalities(&self) -> Vec<(&str, &Value)> {
    match self {
      Self::Eq(path, v) => vec![(path.as_str(), v)],
      Self::And(fs) => fs.iter().flat_map(|f| f.equalities()).collect(),
      _ => Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  Asc,
  Desc,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
  pub sort: Vec<(String, Direction)>,
  pub limit: Option<usize>,
  /// Top-level or dotted fields to keep; `_id` is always kept.
  pub projection: Option<Vec<String>>,
}

impl FindOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn sort_asc(mut self, path: &str) -> Self {
    self.sort.push((path.into(), Direction::Asc));
    self
  }

  pub fn sort_desc(mut self, path: &str) -> Self {
    self.sort.push((path.into(), Direction::Desc));
    self
  }

  pub fn limit(mut self, n: usize) -> Self {
    self.limit = Some(n);
    self
  }

  pub fn project(mut self, fields: &[&str]) -> Self {
    self.projection = Some(fields.iter().map(|f| f.to_string()).collect());
    self
  }
}

/// `$set` / `$push` / `$setOnInsert` style modification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
  pub set: Vec<(String, Value)>,
  pub push: Vec<(String, Value)>,
  pub set_on_insert: Vec<(String, Value)>,
}

impl Update {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(mut self, path: &str, value: impl Into<Value>) -> Self {
    self.set.push((path.into(), value.into()));
    self
  }

  pub fn push(mut self, path: &str, value: impl Into<Value>) -> Self {
    self.push.push((path.into(), value.into()));
    self
  }

  pub fn set_on_insert(mut self, path: &str, value: impl Into<Value>) -> Self {
    self.set_on_insert.push((path.into(), value.into()));
    self
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateResult {
  pub matched: u64,
  pub modified: u64,
  pub upserted_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexSpec {
  Ascending(String),
  /// Compound text index over the listed string fields.
  Text(Vec<String>),
  Geo2dSphere(String),
}

impl IndexSpec {
  pub fn ascending(path: &str) -> Self {
    Self::Ascending(path.into())
  }

  pub fn text(fields: &[&str]) -> Self {
    Self::Text(fields.iter().map(|f| f.to_string()).collect())
  }

  pub fn geo(path: &str) -> Self {
    Self::Geo2dSphere(path.into())
  }

  /// Stable index name, e.g. `votes_1`, `text_author_text`, `coordinates_2dsphere`.
  pub fn name(&self) -> String {
    match self {
      Self::Ascending(p) => format!("{}_1", p),
      Self::Text(fields) => fields
        .iter()
        .map(|f| format!("{}_text", f))
        .collect::<Vec<_>>()
        .join("_"),
      Self::Geo2dSphere(p) => format!("{}_2dsphere", p),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn index_names_are_stable() {
    assert_eq!(IndexSpec::ascending("events.coordinates").name(), "events.coordinates_1");
    assert_eq!(IndexSpec::text(&["text", "author"]).name(), "text_text_author_text");
    assert_eq!(IndexSpec::geo("coordinates").name(), "coordinates_2dsphere");
  }

  #[test]
  fn equalities_are_found_through_conjunctions() {
    let center = GeoPoint::new(1.0, 2.0);
    let f = and(vec![
      eq("matched_title", "Matrix"),
      near("coordinates", center, 5.0),
      and(vec![eq("year", 1999)]),
    ]);
    assert_eq!(
      f.equalities(),
      vec![("matched_title", &json!("Matrix")), ("year", &json!(1999))]
    );
    assert!(not(eq("a", 1)).equalities().is_empty());
  }
}
