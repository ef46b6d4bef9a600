//! In-process document store.
//!
//! Each collection sits behind its own `RwLock`, so a single operation is atomic
//! and readers run concurrently. Documents keep insertion order.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::document::{self, IndexView, Matcher};
use super::query::{Collection, Direction, Document, Filter, FindOptions, IndexSpec, Update, UpdateResult};
use super::DocumentStore;
use crate::error::CatalogError;

#[derive(Debug, Default)]
struct MemCollection {
  /// Insertion sequence -> document (always a JSON object).
  docs: BTreeMap<u64, Value>,
  by_id: HashMap<String, u64>,
  next_seq: u64,
  indexes: Vec<IndexSpec>,
}

impl MemCollection {
  fn index_view(&self) -> IndexView {
    let mut view = IndexView::default();
    for idx in &self.indexes {
      match idx {
        IndexSpec::Text(fields) => view.text_fields = Some(fields.clone()),
        IndexSpec::Geo2dSphere(path) => view.geo_paths.push(path.clone()),
        IndexSpec::Ascending(_) => {}
      }
    }
    view
  }

  fn insert(&mut self, doc: Document) -> Result<String, CatalogError> {
    let id = document::doc_id(&doc)?;
    if self.by_id.contains_key(&id) {
      return Err(CatalogError::DuplicateKey(id));
    }
    let seq = self.next_seq;
    self.next_seq += 1;
    self.docs.insert(seq, Value::Object(doc));
    self.by_id.insert(id.clone(), seq);
    Ok(id)
  }

  fn matching(&self, m: &Matcher) -> Vec<u64> {
    self
      .docs
      .iter()
      .filter(|(_, doc)| m.matches(doc))
      .map(|(seq, _)| *seq)
      .collect()
  }

  fn update(
    &mut self,
    coll: Collection,
    filter: &Filter,
    update: &Update,
    upsert: bool,
    multi: bool,
  ) -> Result<UpdateResult, CatalogError> {
    let m = Matcher::compile(filter, &self.index_view(), coll.name())?;
    let mut seqs = self.matching(&m);
    if !multi {
      seqs.truncate(1);
    }

    let mut result = UpdateResult::default();
    if seqs.is_empty() {
      if upsert {
        let seed = document::upsert_seed(filter, update)?;
        result.upserted_id = Some(self.insert(seed)?);
      }
      return Ok(result);
    }

    for seq in seqs {
      let Some(Value::Object(doc)) = self.docs.get_mut(&seq) else {
        continue;
      };
      result.matched += 1;
      if document::apply_update(doc, update)? {
        result.modified += 1;
      }
    }
    Ok(result)
  }
}

/// Store that keeps both collections in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
  items: RwLock<MemCollection>,
  events: RwLock<MemCollection>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn slot(&self, coll: Collection) -> &RwLock<MemCollection> {
    match coll {
      Collection::Items => &self.items,
      Collection::Events => &self.events,
    }
  }
}

fn sort_by_keys(docs: &mut [&Value], keys: &[(String, Direction)]) {
  docs.sort_by(|a, b| {
    for (path, dir) in keys {
      let va = document::resolve(a, path).into_iter().next();
      let vb = document::resolve(b, path).into_iter().next();
      let ord = document::sort_cmp(va, vb);
      let ord = match dir {
        Direction::Asc => ord,
        Direction::Desc => ord.reverse(),
      };
      if ord != Ordering::Equal {
        return ord;
      }
    }
    Ordering::Equal
  });
}

#[async_trait]
impl DocumentStore for MemoryStore {
  fn name(&self) -> &'static str {
    "memory"
  }

  async fn create_index(&self, coll: Collection, index: &IndexSpec) -> Result<(), CatalogError> {
    let mut c = self.slot(coll).write().await;
    if c.indexes.contains(index) {
      return Ok(());
    }
    if let IndexSpec::Text(_) = index {
      if c.indexes.iter().any(|i| matches!(i, IndexSpec::Text(_))) {
        return Err(CatalogError::invalid(
          "index",
          "collection already has a different text index",
        ));
      }
    }
    tracing::debug!(collection = coll.name(), index = %index.name(), "index created");
    c.indexes.push(index.clone());
    Ok(())
  }

  async fn find(
    &self,
    coll: Collection,
    filter: &Filter,
    options: &FindOptions,
  ) -> Result<Vec<Document>, CatalogError> {
    let c = self.slot(coll).read().await;
    let m = Matcher::compile(filter, &c.index_view(), coll.name())?;
    let mut hits: Vec<&Value> = c.docs.values().filter(|d| m.matches(d)).collect();

    if !options.sort.is_empty() {
      sort_by_keys(&mut hits, &options.sort);
    } else if m.has_near() {
      hits.sort_by(|a, b| {
        let da = m.near_distance(a).unwrap_or(f64::INFINITY);
        let db = m.near_distance(b).unwrap_or(f64::INFINITY);
        da.partial_cmp(&db).unwrap_or(Ordering::Equal)
      });
    } else if m.has_text() {
      hits.sort_by(|a, b| {
        let sa = m.text_score(a).unwrap_or(0.0);
        let sb = m.text_score(b).unwrap_or(0.0);
        sb.partial_cmp(&sa).unwrap_or(Ordering::Equal)
      });
    }

    let limit = options.limit.unwrap_or(usize::MAX);
    Ok(
      hits
        .into_iter()
        .take(limit)
        .filter_map(|v| v.as_object())
        .map(|doc| match &options.projection {
          Some(fields) => document::project(doc, fields),
          None => doc.clone(),
        })
        .collect(),
    )
  }

  async fn insert_one(&self, coll: Collection, doc: Document) -> Result<(), CatalogError> {
    self.slot(coll).write().await.insert(doc).map(|_| ())
  }

  async fn insert_many(&self, coll: Collection, docs: Vec<Document>) -> Result<u64, CatalogError> {
    let mut c = self.slot(coll).write().await;
    let mut n = 0;
    for doc in docs {
      c.insert(doc)?;
      n += 1;
    }
    Ok(n)
  }

  async fn update_one(
    &self,
    coll: Collection,
    filter: &Filter,
    update: &Update,
    upsert: bool,
  ) -> Result<UpdateResult, CatalogError> {
    self.slot(coll).write().await.update(coll, filter, update, upsert, false)
  }

  async fn update_many(
    &self,
    coll: Collection,
    filter: &Filter,
    update: &Update,
    upsert: bool,
  ) -> Result<UpdateResult, CatalogError> {
    self.slot(coll).write().await.update(coll, filter, update, upsert, true)
  }

  async fn delete_many(&self, coll: Collection, filter: &Filter) -> Result<u64, CatalogError> {
    let mut c = self.slot(coll).write().await;
    let m = Matcher::compile(filter, &c.index_view(), coll.name())?;
    let seqs = c.matching(&m);
    for seq in &seqs {
      if let Some(Value::Object(doc)) = c.docs.remove(seq) {
        if let Ok(id) = document::doc_id(&doc) {
          c.by_id.remove(&id);
        }
      }
    }
    Ok(seqs.len() as u64)
  }

  async fn count(&self, coll: Collection, filter: &Filter) -> Result<u64, CatalogError> {
    let c = self.slot(coll).read().await;
    let m = Matcher::compile(filter, &c.index_view(), coll.name())?;
    Ok(c.docs.values().filter(|d| m.matches(d)).count() as u64)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::query as q;
  use crate::types::GeoPoint;
  use serde_json::json;

  fn doc(v: Value) -> Document {
    v.as_object().cloned().unwrap()
  }

  #[tokio::test]
  async fn duplicate_id_is_rejected() {
    let store = MemoryStore::new();
    store.insert_one(Collection::Items, doc(json!({"_id": "a"}))).await.unwrap();
    let err = store
      .insert_one(Collection::Items, doc(json!({"_id": "a", "title": "x"})))
      .await
      .unwrap_err();
    assert!(matches!(err, CatalogError::DuplicateKey(id) if id == "a"));
  }

  #[tokio::test]
  async fn sort_and_limit() {
    let store = MemoryStore::new();
    for (id, votes) in [(1, 10), (2, 30), (3, 20), (4, 20)] {
      store
        .insert_one(Collection::Events, doc(json!({"_id": id, "votes": votes})))
        .await
        .unwrap();
    }
    let docs = store
      .find(Collection::Events, &Filter::All, &FindOptions::new().sort_desc("votes").limit(2))
      .await
      .unwrap();
    let ids: Vec<_> = docs.iter().map(|d| d["_id"].clone()).collect();
    assert_eq!(ids, vec![json!(2), json!(3)]);

    let tied = store
      .find(
        Collection::Events,
        &q::eq("votes", 20),
        &FindOptions::new().sort_desc("votes").sort_asc("_id"),
      )
      .await
      .unwrap();
    let ids: Vec<_> = tied.iter().map(|d| d["_id"].clone()).collect();
    assert_eq!(ids, vec![json!(3), json!(4)]);
  }

  #[tokio::test]
  async fn upsert_many_creates_once_then_appends_to_every_match() {
    let store = MemoryStore::new();
    let filter = q::eq("title", "Matrix");
    let update = Update::new().set_on_insert("_id", "t-1").push("events", json!({"n": 1}));

    let r = store.update_many(Collection::Items, &filter, &update, true).await.unwrap();
    assert_eq!(r.upserted_id.as_deref(), Some("t-1"));

    store
      .insert_one(Collection::Items, doc(json!({"_id": "dup", "title": "Matrix"})))
      .await
      .unwrap();
    let r = store.update_many(Collection::Items, &filter, &update, true).await.unwrap();
    assert_eq!(r.matched, 2);
    assert_eq!(r.modified, 2);
    assert!(r.upserted_id.is_none());

    let stub = store
      .find_one(Collection::Items, &q::eq("_id", "t-1"))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(stub["events"].as_array().unwrap().len(), 2);
  }

  #[tokio::test]
  async fn index_creation_is_idempotent() {
    let store = MemoryStore::new();
    let idx = IndexSpec::text(&["text", "author"]);
    store.create_index(Collection::Events, &idx).await.unwrap();
    store.create_index(Collection::Events, &idx).await.unwrap();
    let other = IndexSpec::text(&["text"]);
    assert!(store.create_index(Collection::Events, &other).await.is_err());
  }

  #[tokio::test]
  async fn text_results_are_ranked() {
    let store = MemoryStore::new();
    store
      .create_index(Collection::Events, &IndexSpec::text(&["text", "author"]))
      .await
      .unwrap();
    store
      .insert_many(
        Collection::Events,
        vec![
          doc(json!({"_id": 1, "text": "matrix is fine, lots of other words here", "author": "a"})),
          doc(json!({"_id": 2, "text": "matrix matrix", "author": "b"})),
          doc(json!({"_id": 3, "text": "inception", "author": "matrixfan"})),
        ],
      )
      .await
      .unwrap();
    let docs = store
      .find(Collection::Events, &q::text("matrix"), &FindOptions::new())
      .await
      .unwrap();
    let ids: Vec<_> = docs.iter().map(|d| d["_id"].clone()).collect();
    assert_eq!(ids, vec![json!(2), json!(1)]);
  }

  #[tokio::test]
  async fn near_orders_by_distance() {
    let store = MemoryStore::new();
    store
      .create_index(Collection::Events, &IndexSpec::geo("coordinates"))
      .await
      .unwrap();
    let far = serde_json::to_value(GeoPoint::new(41.0, -74.0)).unwrap();
    let close = serde_json::to_value(GeoPoint::new(40.01, -74.0)).unwrap();
    store
      .insert_many(
        Collection::Events,
        vec![
          doc(json!({"_id": 1, "coordinates": far})),
          doc(json!({"_id": 2, "coordinates": close})),
          doc(json!({"_id": 3})),
        ],
      )
      .await
      .unwrap();
    let center = GeoPoint::new(40.0, -74.0);
    let docs = store
      .find(
        Collection::Events,
        &q::near("coordinates", center, 200_000.0),
        &FindOptions::new(),
      )
      .await
      .unwrap();
    let ids: Vec<_> = docs.iter().map(|d| d["_id"].clone()).collect();
    assert_eq!(ids, vec![json!(2), json!(1)]);
  }

  #[tokio::test]
  async fn delete_frees_ids() {
    let store = MemoryStore::new();
    store.insert_one(Collection::Items, doc(json!({"_id": "a"}))).await.unwrap();
    assert_eq!(store.delete_many(Collection::Items, &Filter::All).await.unwrap(), 1);
    assert_eq!(store.count(Collection::Items, &Filter::All).await.unwrap(), 0);
    store.insert_one(Collection::Items, doc(json!({"_id": "a"}))).await.unwrap();
  }
}
