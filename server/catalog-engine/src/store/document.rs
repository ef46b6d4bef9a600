//! In-process document evaluation: dotted paths, filter matching, updates, projection.
//!
//! Path semantics follow the usual document-store rules: each segment descends into
//! an object; an array in the middle of a path fans out over its elements; a numeric
//! segment indexes into an array.

use std::cmp::Ordering;

use regex::{Regex, RegexBuilder};
use serde_json::{Map, Number, Value};

use crate::error::CatalogError;
use crate::geo;
use crate::store::query::{CmpOp, Document, Filter, Update, ValueKind};
use crate::store::text::TextQuery;
use crate::types::GeoPoint;

/// Values reached by `path`. Leaf arrays are returned as-is (not expanded).
pub fn resolve<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
  let mut current = vec![doc];
  for seg in path.split('.') {
    let mut next = Vec::new();
    for v in current {
      match v {
        Value::Object(map) => {
          if let Some(child) = map.get(seg) {
            next.push(child);
          }
        }
        Value::Array(items) => {
          if let Ok(idx) = seg.parse::<usize>() {
            if let Some(child) = items.get(idx) {
              next.push(child);
            }
          } else {
            next.extend(items.iter().filter_map(|it| it.as_object()).filter_map(|m| m.get(seg)));
          }
        }
        _ => {}
      }
    }
    current = next;
  }
  current
}

/// Leaf values plus the elements of leaf arrays (what scalar predicates test).
fn candidates<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
  let mut out = Vec::new();
  for v in resolve(doc, path) {
    if let Value::Array(items) = v {
      out.extend(items.iter());
    }
    out.push(v);
  }
  out
}

/// Integers compare exactly; floats only come in when either side is not an integer.
fn compare_numbers(x: &Number, y: &Number) -> Option<Ordering> {
  if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
    return Some(a.cmp(&b));
  }
  if let (Some(a), Some(b)) = (x.as_u64(), y.as_u64()) {
    return Some(a.cmp(&b));
  }
  x.as_f64()?.partial_cmp(&y.as_f64()?)
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
  match (a, b) {
    (Value::Number(x), Value::Number(y)) => compare_numbers(x, y) == Some(Ordering::Equal),
    (Value::Array(x), Value::Array(y)) => {
      x.len() == y.len() && x.iter().zip(y).all(|(p, q)| values_equal(p, q))
    }
    _ => a == b,
  }
}

/// Ordering between two values of the same kind; `None` across kinds.
fn compare_same_kind(a: &Value, b: &Value) -> Option<Ordering> {
  match (a, b) {
    (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
    (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
    (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
    _ => None,
  }
}

fn kind_rank(v: Option<&Value>) -> u8 {
  match v {
    None | Some(Value::Null) => 0,
    Some(Value::Number(_)) => 1,
    Some(Value::String(_)) => 2,
    Some(Value::Object(_)) => 3,
    Some(Value::Array(_)) => 4,
    Some(Value::Bool(_)) => 5,
  }
}

/// Total order used for sorting: missing/null first, then numbers, strings, objects, arrays, bools.
pub fn sort_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
  match (a, b) {
    (Some(x), Some(y)) => compare_same_kind(x, y)
      .unwrap_or_else(|| kind_rank(a).cmp(&kind_rank(b))),
    _ => kind_rank(a).cmp(&kind_rank(b)),
  }
}

/// Per-collection facts a filter needs at match time.
#[derive(Debug, Clone, Default)]
pub struct IndexView {
  pub text_fields: Option<Vec<String>>,
  pub geo_paths: Vec<String>,
}

/// Filter with regexes compiled and index requirements checked.
#[derive(Debug)]
pub enum Matcher {
  All,
  Eq(String, Value),
  Cmp(String, CmpOp, Value),
  ContainsAll(String, Vec<Value>),
  Exists(String, bool),
  Type(String, ValueKind),
  Regex(String, Regex),
  Text(Vec<String>, TextQuery),
  Near(String, GeoPoint, f64),
  ElemMatch(String, Box<Matcher>),
  And(Vec<Matcher>),
  Not(Box<Matcher>),
}

impl Matcher {
  pub fn compile(
    filter: &Filter,
    indexes: &IndexView,
    collection: &'static str,
  ) -> Result<Self, CatalogError> {
    let many = |fs: &[Filter]| -> Result<Vec<Matcher>, CatalogError> {
      fs.iter().map(|f| Matcher::compile(f, indexes, collection)).collect()
    };
    Ok(match filter {
      Filter::All => Self::All,
      Filter::Eq(p, v) => Self::Eq(p.clone(), v.clone()),
      Filter::Cmp(p, op, v) => Self::Cmp(p.clone(), *op, v.clone()),
      Filter::ContainsAll(p, vs) => Self::ContainsAll(p.clone(), vs.clone()),
      Filter::Exists(p, want) => Self::Exists(p.clone(), *want),
      Filter::Type(p, k) => Self::Type(p.clone(), *k),
      Filter::Regex {
        path,
        pattern,
        case_insensitive,
      } => {
        let re = RegexBuilder::new(pattern)
          .case_insensitive(*case_insensitive)
          .build()
          .map_err(|e| CatalogError::invalid("pattern", &e.to_string()))?;
        Self::Regex(path.clone(), re)
      }
      Filter::Text(q) => {
        let fields = indexes.text_fields.clone().ok_or(CatalogError::IndexMissing {
          collection,
          kind: "text",
        })?;
        Self::Text(fields, TextQuery::parse(q))
      }
      Filter::Near {
        path,
        center,
        max_meters,
      } => {
        if !indexes.geo_paths.iter().any(|p| p == path) {
          return Err(CatalogError::IndexMissing {
            collection,
            kind: "2dsphere",
          });
        }
        Self::Near(path.clone(), *center, *max_meters)
      }
      Filter::ElemMatch(p, inner) => {
        Self::ElemMatch(p.clone(), Box::new(Matcher::compile(inner, indexes, collection)?))
      }
      Filter::And(fs) => Self::And(many(fs)?),
      Filter::Not(f) => Self::Not(Box::new(Matcher::compile(f, indexes, collection)?)),
    })
  }

  pub fn matches(&self, doc: &Value) -> bool {
    match self {
      Self::All => true,
      Self::Eq(p, v) => candidates(doc, p).into_iter().any(|c| values_equal(c, v)),
      Self::Cmp(p, op, v) => candidates(doc, p).into_iter().any(|c| {
        compare_same_kind(c, v).is_some_and(|ord| match op {
          CmpOp::Gt => ord == Ordering::Greater,
          CmpOp::Gte => ord != Ordering::Less,
        })
      }),
      Self::ContainsAll(p, vs) => {
        let found = candidates(doc, p);
        !vs.is_empty() && vs.iter().all(|v| found.iter().any(|c| values_equal(c, v)))
      }
      Self::Exists(p, want) => !resolve(doc, p).is_empty() == *want,
      Self::Type(p, kind) => candidates(doc, p).into_iter().any(|c| ValueKind::of(c) == *kind),
      Self::Regex(p, re) => candidates(doc, p)
        .into_iter()
        .any(|c| c.as_str().is_some_and(|s| re.is_match(s))),
      Self::Text(fields, q) => self.text_score_with(doc, fields, q).is_some(),
      Self::Near(p, center, max) => distance(doc, p, center).is_some_and(|d| d <= *max),
      Self::ElemMatch(p, inner) => resolve(doc, p).into_iter().any(|v| match v {
        Value::Array(items) => items.iter().any(|it| inner.matches(it)),
        _ => false,
      }),
      Self::And(ms) => ms.iter().all(|m| m.matches(doc)),
      Self::Not(m) => !m.matches(doc),
    }
  }

  fn text_score_with(&self, doc: &Value, fields: &[String], q: &TextQuery) -> Option<f64> {
    let texts: Vec<&str> = fields
      .iter()
      .flat_map(|f| candidates(doc, f))
      .filter_map(|v| v.as_str())
      .collect();
    q.score(&texts)
  }

  /// Relevance of `doc` for the text clause, if any.
  pub fn text_score(&self, doc: &Value) -> Option<f64> {
    match self {
      Self::Text(fields, q) => self.text_score_with(doc, fields, q),
      Self::And(ms) => ms.iter().find_map(|m| m.text_score(doc)),
      _ => None,
    }
  }

  /// Distance of `doc` from the near clause's center, if any.
  pub fn near_distance(&self, doc: &Value) -> Option<f64> {
    match self {
      Self::Near(p, center, _) => distance(doc, p, center),
      Self::And(ms) => ms.iter().find_map(|m| m.near_distance(doc)),
      _ => None,
    }
  }

  pub fn has_text(&self) -> bool {
    match self {
      Self::Text(..) => true,
      Self::And(ms) => ms.iter().any(|m| m.has_text()),
      _ => false,
    }
  }

  pub fn has_near(&self) -> bool {
    match self {
      Self::Near(..) => true,
      Self::And(ms) => ms.iter().any(|m| m.has_near()),
      _ => false,
    }
  }
}

/// Smallest distance from `center` to any GeoJSON point at `path`.
fn distance(doc: &Value, path: &str, center: &GeoPoint) -> Option<f64> {
  resolve(doc, path)
    .into_iter()
    .filter_map(|v| serde_json::from_value::<GeoPoint>(v.clone()).ok())
    .map(|p| geo::haversine_m(center, &p))
    .min_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal))
}

/// Record id as stored in `_id` (strings verbatim, numbers rendered).
pub fn doc_id(doc: &Document) -> Result<String, CatalogError> {
  match doc.get("_id") {
    Some(Value::String(s)) => Ok(s.clone()),
    Some(Value::Number(n)) => Ok(n.to_string()),
    Some(other) => Err(CatalogError::invalid("_id", &format!("unsupported id {}", other))),
    None => Err(CatalogError::invalid("_id", "missing")),
  }
}

fn set_path(doc: &mut Document, path: &str, value: Value) -> Result<(), CatalogError> {
  let mut segs = path.split('.').peekable();
  let mut map = doc;
  while let Some(seg) = segs.next() {
    if segs.peek().is_none() {
      map.insert(seg.to_string(), value);
      return Ok(());
    }
    let child = map
      .entry(seg.to_string())
      .or_insert_with(|| Value::Object(Map::new()));
    map = child
      .as_object_mut()
      .ok_or_else(|| CatalogError::invalid(path, "cannot set a field inside a non-object"))?;
  }
  Ok(())
}

fn push_path(doc: &mut Document, path: &str, value: Value) -> Result<(), CatalogError> {
  let (parent, leaf) = match path.rsplit_once('.') {
    Some((parent, leaf)) => (Some(parent), leaf),
    None => (None, path),
  };
  let mut map = doc;
  if let Some(parent) = parent {
    for seg in parent.split('.') {
      let child = map
        .entry(seg.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
      map = child
        .as_object_mut()
        .ok_or_else(|| CatalogError::invalid(path, "cannot push inside a non-object"))?;
    }
  }
  match map
    .entry(leaf.to_string())
    .or_insert_with(|| Value::Array(Vec::new()))
  {
    Value::Array(items) => {
      items.push(value);
      Ok(())
    }
    _ => Err(CatalogError::invalid(path, "cannot push to a non-array field")),
  }
}

/// Apply `$set` then `$push`. Returns whether the document changed.
pub fn apply_update(doc: &mut Document, update: &Update) -> Result<bool, CatalogError> {
  let before = doc.clone();
  for (path, v) in &update.set {
    set_path(doc, path, v.clone())?;
  }
  for (path, v) in &update.push {
    push_path(doc, path, v.clone())?;
  }
  Ok(*doc != before)
}

/// Document inserted by an upsert that matched nothing.
pub fn upsert_seed(filter: &Filter, update: &Update) -> Result<Document, CatalogError> {
  let mut doc = Document::new();
  for (path, v) in filter.equalities() {
    set_path(&mut doc, path, v.clone())?;
  }
  for (path, v) in &update.set_on_insert {
    set_path(&mut doc, path, v.clone())?;
  }
  apply_update(&mut doc, update)?;
  if !doc.contains_key("_id") {
    doc.insert("_id".into(), Value::String(uuid::Uuid::new_v4().to_string()));
  }
  Ok(doc)
}

/// Keep `_id` and the listed fields. A dotted field whose parent is already a
/// non-object in the output is left out.
pub fn project(doc: &Document, fields: &[String]) -> Document {
  let mut out = Document::new();
  if let Some(id) = doc.get("_id") {
    out.insert("_id".into(), id.clone());
  }
  let source = Value::Object(doc.clone());
  for field in fields {
    if let Some(v) = resolve(&source, field).into_iter().next() {
      // Dotted projections land at their dotted location.
      if let Err(e) = set_path(&mut out, field, v.clone()) {
        tracing::debug!(field = %field, error = %e, "projection field skipped");
      }
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::query as q;
  use serde_json::json;

  fn compile(f: &Filter) -> Matcher {
    let idx = IndexView {
      text_fields: Some(vec!["text".into(), "author".into()]),
      geo_paths: vec!["coordinates".into()],
    };
    Matcher::compile(f, &idx, "events").unwrap()
  }

  fn item() -> Value {
    json!({
      "_id": "m1",
      "title": "The Matrix",
      "rating": 8.7,
      "votes": 1500,
      "genre": ["Action", "Sci-Fi"],
      "events": [
        {"text": "Whoa, Matrix", "author": "neo"},
        {"text": "red pill", "author": "morpheus",
         "coordinates": {"type": "Point", "coordinates": [-74.0, 40.0]}}
      ]
    })
  }

  #[test]
  fn dotted_paths_fan_out_over_arrays() {
    let doc = item();
    assert_eq!(resolve(&doc, "events.author").len(), 2);
    assert_eq!(resolve(&doc, "events.coordinates").len(), 1);
    assert_eq!(resolve(&doc, "events.0.author"), vec![&json!("neo")]);
    assert!(resolve(&doc, "missing.path").is_empty());
  }

  #[test]
  fn scalar_predicates() {
    let doc = item();
    assert!(compile(&q::eq("title", "The Matrix")).matches(&doc));
    assert!(compile(&q::gt("votes", 1000)).matches(&doc));
    assert!(!compile(&q::gt("rating", 8.7)).matches(&doc));
    assert!(compile(&q::gte("rating", 8.7)).matches(&doc));
    // Cross-kind comparison never matches.
    assert!(!compile(&q::gt("title", 1)).matches(&doc));
  }

  #[test]
  fn containment_and_existence() {
    let doc = item();
    assert!(compile(&q::all_of("genre", ["Sci-Fi", "Action"])).matches(&doc));
    assert!(!compile(&q::all_of("genre", ["Action", "Drama"])).matches(&doc));
    assert!(compile(&q::exists("events.coordinates")).matches(&doc));
    assert!(compile(&q::missing("annotation")).matches(&doc));
  }

  #[test]
  fn null_is_present_but_not_geotagged() {
    let doc = json!({"_id": 1, "coordinates": null});
    assert!(compile(&q::exists("coordinates")).matches(&doc));
    assert!(!compile(&q::present("coordinates")).matches(&doc));
  }

  #[test]
  fn regex_and_elem_match() {
    let doc = item();
    assert!(compile(&q::regex("title", "^The Ma")).matches(&doc));
    assert!(!compile(&q::regex("title", "^the ma")).matches(&doc));
    let scan = q::elem_match("events", q::regex_ci("text", "RED PILL"));
    assert!(compile(&scan).matches(&doc));
    assert!(compile(&q::elem_match("events", Filter::All)).matches(&doc));
    assert!(!compile(&q::elem_match("genre", q::exists("x"))).matches(&doc));
  }

  #[test]
  fn text_and_near_need_indexes() {
    let none = IndexView::default();
    let err = Matcher::compile(&q::text("matrix"), &none, "events").unwrap_err();
    assert!(matches!(err, CatalogError::IndexMissing { kind: "text", .. }));
    let near = q::near("coordinates", GeoPoint::new(0.0, 0.0), 10.0);
    let err = Matcher::compile(&near, &none, "events").unwrap_err();
    assert!(matches!(err, CatalogError::IndexMissing { kind: "2dsphere", .. }));
  }

  #[test]
  fn near_includes_exact_point_at_zero_radius() {
    let doc = json!({"_id": 1, "coordinates": {"type": "Point", "coordinates": [-74.0, 40.0]}});
    let m = compile(&q::near("coordinates", GeoPoint::new(40.0, -74.0), 0.0));
    assert!(m.matches(&doc));
    assert_eq!(m.near_distance(&doc), Some(0.0));
  }

  #[test]
  fn updates_set_push_and_seed() {
    let mut doc = Document::new();
    doc.insert("_id".into(), json!("x"));
    let changed = apply_update(
      &mut doc,
      &Update::new().set("annotation", "great").push("events", json!({"text": "hi"})),
    )
    .unwrap();
    assert!(changed);
    assert_eq!(doc["events"], json!([{"text": "hi"}]));

    let seed = upsert_seed(
      &q::eq("title", "Matrix"),
      &Update::new().set_on_insert("_id", "t-1").push("events", json!(1)),
    )
    .unwrap();
    assert_eq!(Value::Object(seed), json!({"_id": "t-1", "title": "Matrix", "events": [1]}));

    let mut scalar = Document::new();
    scalar.insert("events".into(), json!(5));
    assert!(apply_update(&mut scalar, &Update::new().push("events", 1)).is_err());
  }

  #[test]
  fn projection_keeps_id_and_fields() {
    let doc = item();
    let p = project(doc.as_object().unwrap(), &["title".to_string()]);
    assert_eq!(Value::Object(p), json!({"_id": "m1", "title": "The Matrix"}));
  }

  #[test]
  fn projection_skips_fields_under_a_non_object() {
    let doc = json!({"_id": 1, "a": [{"c": 1}], "b": {"c": 2, "d": 3}});
    let p = project(
      doc.as_object().unwrap(),
      &["a".to_string(), "a.c".to_string(), "b.c".to_string()],
    );
    assert_eq!(Value::Object(p), json!({"_id": 1, "a": [{"c": 1}], "b": {"c": 2}}));
  }

  #[test]
  fn large_integers_compare_exactly() {
    let a = json!(1_700_000_000_000_000_001_i64);
    let b = json!(1_700_000_000_000_000_002_i64);
    assert_eq!(sort_cmp(Some(&a), Some(&b)), Ordering::Less);
    assert!(!values_equal(&a, &b));
    assert!(values_equal(&a, &json!(1_700_000_000_000_000_001_u64)));
    assert!(values_equal(&json!(2), &json!(2.0)));
    assert_eq!(sort_cmp(Some(&json!(-1)), Some(&json!(u64::MAX))), Ordering::Less);

    let doc = json!({"_id": 1_700_000_000_000_000_002_i64});
    assert!(!compile(&q::eq("_id", 1_700_000_000_000_000_001_i64)).matches(&doc));
    assert!(compile(&q::gt("_id", 1_700_000_000_000_000_001_i64)).matches(&doc));
  }

  #[test]
  fn sort_order_puts_missing_first() {
    assert_eq!(sort_cmp(None, Some(&json!(1))), Ordering::Less);
    assert_eq!(sort_cmp(Some(&json!(2)), Some(&json!(10))), Ordering::Less);
    assert_eq!(sort_cmp(Some(&json!("b")), Some(&json!("a"))), Ordering::Greater);
  }
}
