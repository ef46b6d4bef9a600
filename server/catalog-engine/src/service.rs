//! Explicit bootstrap: indexes, optional seeding, and the engines wired to one store.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::blob::{BlobFile, BlobStore};
use crate::catalog::CatalogQueryEngine;
use crate::config::Config;
use crate::error::CatalogError;
use crate::events::EventQueryEngine;
use crate::pipeline::CorrelationPipeline;
use crate::store::{encode, Collection, DocumentStore, Filter, IndexSpec};
use crate::subscription::{spawn_subscription, EventStream, SubscriptionHandle, SubscriptionOptions};
use crate::sync::CatalogSync;
use crate::types::{Event, Item};

/// Item fields indexed at open.
const ITEM_INDEXES: [&str; 4] = ["title", "rating", "votes", "events.coordinates"];

#[derive(Debug, Clone)]
pub struct SeedBlob {
  pub bytes: Vec<u8>,
  pub content_type: Option<String>,
}

/// Records written when seeding applies.
#[derive(Debug, Clone, Default)]
pub struct SeedData {
  pub items: Vec<Item>,
  pub events: Vec<Event>,
  /// Stored under the configured default blob name when that name is free.
  pub default_blob: Option<SeedBlob>,
}

impl SeedData {
  /// Seed from JSON arrays of items and events.
  pub fn from_json(items: &str, events: &str) -> Result<Self, CatalogError> {
    Ok(Self {
      items: serde_json::from_str(items)?,
      events: serde_json::from_str(events)?,
      default_blob: None,
    })
  }
}

#[derive(Debug, Clone, Default)]
pub enum SeedPolicy {
  #[default]
  Never,
  /// Replace both collections with `seed` when the event log holds fewer than
  /// `threshold` records.
  IfBelow { threshold: u64, seed: SeedData },
}

impl SeedPolicy {
  /// Seed below the configured threshold.
  pub fn below_configured(config: &Config, seed: SeedData) -> Self {
    Self::IfBelow {
      threshold: config.seed_threshold,
      seed,
    }
  }
}

/// The catalog engine, opened against a document store and a blob store.
pub struct CatalogService {
  store: Arc<dyn DocumentStore>,
  blobs: Arc<dyn BlobStore>,
  catalog: CatalogQueryEngine,
  events: EventQueryEngine,
  pipeline: CorrelationPipeline,
  sync: CatalogSync,
}

impl CatalogService {
  pub async fn open(
    store: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    config: Config,
    seed: SeedPolicy,
  ) -> Result<Self, CatalogError> {
    for path in ITEM_INDEXES {
      store
        .create_index(Collection::Items, &IndexSpec::ascending(path))
        .await?;
    }
    info!(store = store.name(), "item indexes ready");

    let catalog = CatalogQueryEngine::new(store.clone(), config.clone());
    let service = Self {
      events: EventQueryEngine::new(store.clone()),
      pipeline: CorrelationPipeline::new(store.clone()),
      sync: CatalogSync::new(catalog.clone(), config),
      catalog,
      store,
      blobs,
    };

    if let SeedPolicy::IfBelow { threshold, seed } = seed {
      service.apply_seed(threshold, seed).await?;
    }
    Ok(service)
  }

  async fn apply_seed(&self, threshold: u64, seed: SeedData) -> Result<(), CatalogError> {
    if let Some(blob) = &seed.default_blob {
      let name = self.blobs.default_name().to_string();
      if self.blobs.lookup(&name).await?.is_none() {
        self
          .blobs
          .store(&name, &blob.bytes, blob.content_type.as_deref())
          .await?;
        info!(name = %name, "default blob stored");
      }
    }

    let existing = self.store.count(Collection::Events, &Filter::All).await?;
    if existing >= threshold {
      return Ok(());
    }

    self.clear().await?;
    let items = seed.items.iter().map(encode).collect::<Result<Vec<_>, _>>()?;
    let events = seed.events.iter().map(encode).collect::<Result<Vec<_>, _>>()?;
    let items = self.store.insert_many(Collection::Items, items).await?;
    let events = self.store.insert_many(Collection::Events, events).await?;
    info!(existing, threshold, items, events, "store seeded");
    Ok(())
  }

  pub fn catalog(&self) -> &CatalogQueryEngine {
    &self.catalog
  }

  pub fn events(&self) -> &EventQueryEngine {
    &self.events
  }

  pub fn pipeline(&self) -> &CorrelationPipeline {
    &self.pipeline
  }

  pub fn sync(&self) -> &CatalogSync {
    &self.sync
  }

  /// Start a background subscription on this service's pipeline.
  pub fn subscribe<S: EventStream + 'static>(
    &self,
    stream: S,
    options: SubscriptionOptions,
  ) -> Result<SubscriptionHandle, CatalogError> {
    spawn_subscription(self.pipeline.clone(), stream, options)
  }

  pub async fn save_file(
    &self,
    name: &str,
    bytes: &[u8],
    content_type: Option<&str>,
  ) -> Result<Uuid, CatalogError> {
    self.blobs.store(name, bytes, content_type).await
  }

  /// Stored file, or the default file when `name` is unknown.
  pub async fn get_file(&self, name: &str) -> Result<BlobFile, CatalogError> {
    self.blobs.retrieve(name).await
  }

  /// Delete every item and event. Returns (items, events) removed.
  pub async fn clear(&self) -> Result<(u64, u64), CatalogError> {
    let items = self.store.delete_many(Collection::Items, &Filter::All).await?;
    let events = self.store.delete_many(Collection::Events, &Filter::All).await?;
    info!(items, events, "store cleared");
    Ok((items, events))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::blob::MemoryBlobStore;
  use crate::store::MemoryStore;
  use crate::types::GeoPoint;
  use chrono::{TimeZone, Utc};

  fn seed() -> SeedData {
    SeedData {
      items: vec![Item::new("1", "Matrix"), Item::new("2", "Heat")],
      events: vec![Event {
        id: 10,
        author: "a".into(),
        text: "seeded".into(),
        created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        retransmission: false,
        coordinates: Some(GeoPoint::new(1.0, 1.0)),
        matched_title: "Matrix".into(),
      }],
      default_blob: Some(SeedBlob {
        bytes: b"png".to_vec(),
        content_type: Some("image/png".into()),
      }),
    }
  }

  fn blobs() -> Arc<MemoryBlobStore> {
    Arc::new(MemoryBlobStore::new(1024, "sample.png"))
  }

  #[tokio::test]
  async fn seeds_when_below_threshold() {
    let store = Arc::new(MemoryStore::new());
    store
      .insert_one(Collection::Items, encode(&Item::new("old", "Stale")).unwrap())
      .await
      .unwrap();
    let svc = CatalogService::open(
      store,
      blobs(),
      Config::default(),
      SeedPolicy::IfBelow { threshold: 5, seed: seed() },
    )
    .await
    .unwrap();

    assert!(svc.catalog().get("old").await.unwrap().is_none());
    assert!(svc.catalog().find_exact("Heat").await.unwrap().is_some());
    assert_eq!(svc.events().count().await.unwrap(), 1);
    assert_eq!(svc.get_file("missing.png").await.unwrap().content, b"png");
  }

  #[tokio::test]
  async fn keeps_data_at_or_above_threshold() {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let first = CatalogService::open(store.clone(), blobs(), Config::default(), SeedPolicy::IfBelow {
      threshold: 1,
      seed: seed(),
    })
    .await
    .unwrap();
    first.catalog().set_annotation("1", "kept").await.unwrap();

    let again = CatalogService::open(store, blobs(), Config::default(), SeedPolicy::IfBelow {
      threshold: 1,
      seed: seed(),
    })
    .await
    .unwrap();
    let item = again.catalog().get("1").await.unwrap().unwrap();
    assert_eq!(item.annotation.as_deref(), Some("kept"));
  }

  #[tokio::test]
  async fn never_policy_leaves_store_alone() {
    let svc = CatalogService::open(Arc::new(MemoryStore::new()), blobs(), Config::default(), SeedPolicy::Never)
      .await
      .unwrap();
    assert_eq!(svc.events().count().await.unwrap(), 0);
    assert!(matches!(
      svc.get_file("anything").await,
      Err(CatalogError::NotFound { .. })
    ));
  }

  #[tokio::test]
  async fn files_and_clear() {
    let svc = CatalogService::open(
      Arc::new(MemoryStore::new()),
      blobs(),
      Config::default(),
      SeedPolicy::IfBelow { threshold: 1, seed: seed() },
    )
    .await
    .unwrap();
    svc.save_file("poster.jpg", b"jpeg", Some("image/jpeg")).await.unwrap();
    assert_eq!(svc.get_file("poster.jpg").await.unwrap().content, b"jpeg");

    assert_eq!(svc.clear().await.unwrap(), (2, 1));
    assert_eq!(svc.events().count().await.unwrap(), 0);
  }

  #[test]
  fn seed_from_json() {
    let data = SeedData::from_json(
      r#"[{"_id":"1","title":"Matrix","year":"1999"}]"#,
      r#"[{"_id":5,"created_at":"2024-01-01T00:00:00Z","text":"hi"}]"#,
    )
    .unwrap();
    assert_eq!(data.items[0].year, Some(1999));
    assert_eq!(data.events[0].id, 5);
  }
}
