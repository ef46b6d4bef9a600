//! Queries over the raw event log.
//!
//! The engine owns the indexes its queries need and creates each one once, on
//! first use.

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::info;

use crate::config::resolve_limit;
use crate::error::CatalogError;
use crate::geo::km_to_meters;
use crate::store::query::{self as q, Filter};
use crate::store::{decode, Collection, DocumentStore, FindOptions, IndexSpec};
use crate::types::{Event, GeoPoint, MapMarker};

/// Fields covered by the event text index.
pub const TEXT_FIELDS: [&str; 2] = ["text", "author"];

#[derive(Default)]
struct EnsuredIndexes {
  text: OnceCell<()>,
  geo: OnceCell<()>,
  coordinates: OnceCell<()>,
}

/// Query engine over the event log.
#[derive(Clone)]
pub struct EventQueryEngine {
  store: Arc<dyn DocumentStore>,
  ensured: Arc<EnsuredIndexes>,
}

/// Radius filter on event coordinates; `radius_km` is converted to meters here.
pub fn near_filter(lat: f64, lng: f64, radius_km: f64) -> Filter {
  q::near("coordinates", GeoPoint::new(lat, lng), km_to_meters(radius_km))
}

impl EventQueryEngine {
  pub fn new(store: Arc<dyn DocumentStore>) -> Self {
    Self {
      store,
      ensured: Arc::new(EnsuredIndexes::default()),
    }
  }

  async fn ensure(&self, cell: &OnceCell<()>, index: IndexSpec) -> Result<(), CatalogError> {
    cell
      .get_or_try_init(|| async {
        self.store.create_index(Collection::Events, &index).await?;
        info!(index = %index.name(), store = self.store.name(), "event index ready");
        Ok::<(), CatalogError>(())
      })
      .await?;
    Ok(())
  }

  async fn find_events(&self, filter: &Filter, options: &FindOptions) -> Result<Vec<Event>, CatalogError> {
    let docs = self.store.find(Collection::Events, filter, options).await?;
    docs.into_iter().map(decode).collect()
  }

  /// Ranked text search over event body and author.
  pub async fn full_text_search(&self, query: &str, limit: i64) -> Result<Vec<Event>, CatalogError> {
    if query.trim().is_empty() {
      return Err(CatalogError::invalid("query", "must not be empty"));
    }
    let limit = resolve_limit(limit)?;
    if limit == 0 {
      return Ok(Vec::new());
    }
    self.ensure(&self.ensured.text, IndexSpec::text(&TEXT_FIELDS)).await?;
    self
      .find_events(&q::text(query), &FindOptions::new().limit(limit))
      .await
  }

  /// Most recent events first.
  pub async fn newest(&self, limit: i64) -> Result<Vec<Event>, CatalogError> {
    let limit = resolve_limit(limit)?;
    if limit == 0 {
      return Ok(Vec::new());
    }
    self
      .find_events(&Filter::All, &FindOptions::new().sort_desc("_id").limit(limit))
      .await
  }

  /// Events with a non-null location, newest first.
  pub async fn geotagged(&self, limit: i64) -> Result<Vec<Event>, CatalogError> {
    let limit = resolve_limit(limit)?;
    if limit == 0 {
      return Ok(Vec::new());
    }
    self
      .find_events(
        &q::present("coordinates"),
        &FindOptions::new().sort_desc("_id").limit(limit),
      )
      .await
  }

  /// Events within `radius_km` of (`lat`, `lng`), nearest first.
  pub async fn near(&self, lat: f64, lng: f64, radius_km: f64, limit: i64) -> Result<Vec<Event>, CatalogError> {
    if !GeoPoint::new(lat, lng).is_valid() {
      return Err(CatalogError::invalid("center", "latitude or longitude out of range"));
    }
    if !radius_km.is_finite() || radius_km < 0.0 {
      return Err(CatalogError::invalid("radius_km", "must be a non-negative number"));
    }
    let limit = resolve_limit(limit)?;
    if limit == 0 {
      return Ok(Vec::new());
    }
    self.ensure(&self.ensured.geo, IndexSpec::geo("coordinates")).await?;
    self
      .find_events(&near_filter(lat, lng, radius_km), &FindOptions::new().limit(limit))
      .await
  }

  /// Geotagged events reduced to map markers, newest first.
  pub async fn map_view(&self, limit: i64) -> Result<Vec<MapMarker>, CatalogError> {
    let limit = resolve_limit(limit)?;
    if limit == 0 {
      return Ok(Vec::new());
    }
    self
      .ensure(&self.ensured.coordinates, IndexSpec::ascending("coordinates"))
      .await?;
    let options = FindOptions::new()
      .sort_desc("_id")
      .limit(limit)
      .project(&["text", "matched_title", "author", "coordinates"]);
    let docs = self
      .store
      .find(Collection::Events, &q::present("coordinates"), &options)
      .await?;
    docs.into_iter().map(decode).collect()
  }

  /// Number of events in the log.
  pub async fn count(&self) -> Result<u64, CatalogError> {
    self.store.count(Collection::Events, &Filter::All).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::{encode, MemoryStore};
  use chrono::{TimeZone, Utc};
  use serde_json::{json, Value};

  fn event(id: i64, author: &str, text: &str, at: Option<GeoPoint>) -> Event {
    Event {
      id,
      author: author.into(),
      text: text.into(),
      created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
      retransmission: false,
      coordinates: at,
      matched_title: "Matrix".into(),
    }
  }

  async fn engine_with(events: Vec<Event>) -> (EventQueryEngine, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    for e in &events {
      store.insert_one(Collection::Events, encode(e).unwrap()).await.unwrap();
    }
    (EventQueryEngine::new(store.clone()), store)
  }

  #[tokio::test]
  async fn newest_orders_by_id_desc() {
    let (engine, _) = engine_with(vec![
      event(2, "a", "two", None),
      event(9, "a", "nine", None),
      event(5, "a", "five", None),
    ])
    .await;
    let ids: Vec<i64> = engine.newest(10).await.unwrap().iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![9, 5, 2]);
    assert_eq!(engine.newest(1).await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn geotagged_excludes_missing_and_null() {
    let (engine, store) = engine_with(vec![
      event(1, "a", "located", Some(GeoPoint::new(40.0, -74.0))),
      event(2, "a", "unlocated", None),
    ])
    .await;
    let mut null_doc = encode(&event(3, "a", "null coords", None)).unwrap();
    null_doc.insert("coordinates".into(), Value::Null);
    store.insert_one(Collection::Events, null_doc).await.unwrap();

    let hits = engine.geotagged(10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, 1);
  }

  #[tokio::test]
  async fn full_text_matches_text_and_author() {
    let (engine, _) = engine_with(vec![
      event(1, "trinity", "the matrix has you", None),
      event(2, "morpheus", "red pill", None),
      event(3, "smith", "mr anderson", None),
    ])
    .await;
    let by_text = engine.full_text_search("matrix", 10).await.unwrap();
    assert_eq!(by_text.len(), 1);
    assert_eq!(by_text[0].id, 1);

    let by_author = engine.full_text_search("morpheus", 10).await.unwrap();
    assert_eq!(by_author[0].id, 2);

    // index creation is idempotent across calls
    assert!(engine.full_text_search("anderson", 10).await.is_ok());
    assert!(engine.full_text_search("  ", 10).await.is_err());
  }

  #[tokio::test]
  async fn near_converts_kilometers_and_orders_by_distance() {
    let (engine, _) = engine_with(vec![
      event(1, "a", "far", Some(GeoPoint::new(40.5, -74.0))),
      event(2, "a", "close", Some(GeoPoint::new(40.01, -74.0))),
      event(3, "a", "none", None),
    ])
    .await;
    let hits = engine.near(40.0, -74.0, 100.0, 10).await.unwrap();
    assert_eq!(hits.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2, 1]);

    let tight = engine.near(40.0, -74.0, 5.0, 10).await.unwrap();
    assert_eq!(tight.len(), 1);

    assert_eq!(
      near_filter(40.0, -74.0, 2.5),
      q::near("coordinates", GeoPoint::new(40.0, -74.0), 2500.0)
    );
  }

  #[tokio::test]
  async fn near_rejects_bad_arguments() {
    let (engine, _) = engine_with(vec![]).await;
    assert!(engine.near(91.0, 0.0, 1.0, 10).await.is_err());
    assert!(engine.near(0.0, 0.0, -1.0, 10).await.is_err());
    assert!(engine.near(0.0, 0.0, f64::NAN, 10).await.is_err());
  }

  #[tokio::test]
  async fn map_view_projects_markers() {
    let (engine, _) = engine_with(vec![
      event(1, "a", "first", Some(GeoPoint::new(1.0, 2.0))),
      event(2, "b", "second", Some(GeoPoint::new(3.0, 4.0))),
      event(3, "c", "nowhere", None),
    ])
    .await;
    let markers = engine.map_view(10).await.unwrap();
    assert_eq!(markers.len(), 2);
    assert_eq!(markers[0].id, 2);
    assert_eq!(markers[0].author, "b");
    assert_eq!(markers[0].coordinates.lat(), 3.0);

    let raw = serde_json::to_value(&markers[1]).unwrap();
    assert_eq!(raw["coordinates"], json!({ "type": "Point", "coordinates": [2.0, 1.0] }));
  }

  #[tokio::test]
  async fn event_limits_are_validated_and_honoured() {
    let events: Vec<Event> = (1..=2100)
      .map(|id| event(id, "a", "x", Some(GeoPoint::new(1.0, 1.0))))
      .collect();
    let (engine, _) = engine_with(events).await;
    assert!(engine.newest(-5).await.is_err());
    assert!(engine.newest(0).await.unwrap().is_empty());
    assert_eq!(engine.newest(2050).await.unwrap().len(), 2050);
    assert_eq!(engine.map_view(2100).await.unwrap().len(), 2100);
    assert_eq!(engine.near(1.0, 1.0, 1.0, 3000).await.unwrap().len(), 2100);
  }

  #[tokio::test]
  async fn large_ids_keep_exact_recency_order() {
    let first = 1_700_000_000_000_000_001;
    let second = 1_700_000_000_000_000_002;
    let (engine, store) = engine_with(vec![
      event(first, "a", "older", Some(GeoPoint::new(1.0, 1.0))),
      event(second, "a", "newer", Some(GeoPoint::new(1.0, 1.0))),
    ])
    .await;

    let newest: Vec<i64> = engine.newest(10).await.unwrap().iter().map(|e| e.id).collect();
    assert_eq!(newest, vec![second, first]);
    let located: Vec<i64> = engine.geotagged(10).await.unwrap().iter().map(|e| e.id).collect();
    assert_eq!(located, vec![second, first]);
    assert_eq!(engine.map_view(1).await.unwrap()[0].id, second);

    let hit = store
      .find_one(Collection::Events, &q::eq("_id", first))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(hit["_id"], json!(first));
  }
}
