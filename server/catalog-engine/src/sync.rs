//! Catalog population from an external item feed.
//!
//! Descriptors are turned into full items and inserted first-write-wins, one at a time.
//! Nothing is transactional: a failed descriptor is reported and the batch carries on,
//! and re-running a batch only inserts what is still missing.

use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::catalog::CatalogQueryEngine;
use crate::config::Config;
use crate::error::CatalogError;
use crate::fingerprint;
use crate::types::{ExternalItem, Item, Release};

/// Feed category codes and their genre names.
pub const GENRES: &[(i64, &str)] = &[
  (28, "Action"),
  (12, "Adventure"),
  (16, "Animation"),
  (35, "Comedy"),
  (80, "Crime"),
  (99, "Documentary"),
  (18, "Drama"),
  (10751, "Family"),
  (14, "Fantasy"),
  (36, "History"),
  (27, "Horror"),
  (10402, "Music"),
  (9648, "Mystery"),
  (10749, "Romance"),
  (878, "Science Fiction"),
  (10770, "TV Movie"),
  (53, "Thriller"),
  (10752, "War"),
  (37, "Western"),
];

pub fn genre_name(code: i64) -> Option<&'static str> {
  GENRES.iter().find(|(c, _)| *c == code).map(|(_, name)| *name)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncFailure {
  pub id: String,
  pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
  pub inserted: u64,
  /// Already present; left untouched.
  pub skipped: u64,
  pub failed: Vec<SyncFailure>,
}

/// Build a full item from a feed descriptor.
///
/// `batch_year` stands in for items without a usable release date.
pub fn synthesize(desc: &ExternalItem, batch_year: i32, config: &Config) -> Result<Item, CatalogError> {
  if desc.id.trim().is_empty() {
    return Err(CatalogError::invalid("id", "must not be empty"));
  }
  if desc.title.trim().is_empty() {
    return Err(CatalogError::invalid("title", "must not be empty"));
  }

  let date = desc.release_date.as_deref().map(str::trim).filter(|d| !d.is_empty());
  let year = date
    .and_then(|d| d.get(..4))
    .and_then(|y| y.parse::<i32>().ok())
    .unwrap_or(batch_year);

  let mut item = Item::new(desc.id.clone(), desc.title.clone());
  item.year = Some(year);
  item.rating = desc.vote_average.unwrap_or(0.0);
  item.votes = desc
    .vote_count
    .unwrap_or_else(|| fingerprint::placeholder_votes(&desc.id, config.placeholder_votes_ceiling));
  item.genre = desc
    .genre_ids
    .iter()
    .filter_map(|&code| genre_name(code))
    .map(str::to_string)
    .collect();
  item.plot = desc.overview.clone().filter(|p| !p.is_empty());
  item.releases = date
    .map(|d| {
      vec![Release {
        country: Some("USA".into()),
        date: format!("{}T23:00:00Z", d),
      }]
    })
    .unwrap_or_default();
  Ok(item)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Feed {
  Page { results: Vec<ExternalItem> },
  List(Vec<ExternalItem>),
}

/// Descriptors from a feed body: either a bare array or a page with `results`.
pub fn parse_feed(body: &str) -> Result<Vec<ExternalItem>, CatalogError> {
  Ok(match serde_json::from_str(body)? {
    Feed::Page { results } => results,
    Feed::List(items) => items,
  })
}

/// Applies feed descriptors to the catalog.
#[derive(Clone)]
pub struct CatalogSync {
  catalog: CatalogQueryEngine,
  config: Config,
}

impl CatalogSync {
  pub fn new(catalog: CatalogQueryEngine, config: Config) -> Self {
    Self { catalog, config }
  }

  pub async fn sync(&self, descriptors: &[ExternalItem]) -> SyncReport {
    self.sync_at(descriptors, Utc::now().year()).await
  }

  /// Sync with an explicit fallback year.
  pub async fn sync_at(&self, descriptors: &[ExternalItem], batch_year: i32) -> SyncReport {
    let mut report = SyncReport::default();
    for desc in descriptors {
      let result = match synthesize(desc, batch_year, &self.config) {
        Ok(item) => self.catalog.upsert(&item).await,
        Err(e) => Err(e),
      };
      match result {
        Ok(true) => report.inserted += 1,
        Ok(false) => report.skipped += 1,
        Err(e) => {
          warn!(id = %desc.id, error = %e, "descriptor not synced");
          report.failed.push(SyncFailure {
            id: desc.id.clone(),
            error: e.to_string(),
          });
        }
      }
    }
    info!(
      inserted = report.inserted,
      skipped = report.skipped,
      failed = report.failed.len(),
      "catalog sync finished"
    );
    report
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::{encode, MemoryStore};
  use std::sync::Arc;

  fn descriptor(id: &str, title: &str) -> ExternalItem {
    ExternalItem {
      id: id.into(),
      title: title.into(),
      genre_ids: vec![28, 878, 424242],
      overview: Some("A hacker learns the truth.".into()),
      vote_average: Some(8.7),
      vote_count: None,
      release_date: Some("1999-03-30".into()),
    }
  }

  #[test]
  fn genre_table_lookup() {
    assert_eq!(genre_name(878), Some("Science Fiction"));
    assert_eq!(genre_name(1), None);
    assert_eq!(GENRES.len(), 19);
  }

  #[test]
  fn synthesis_rules() {
    let item = synthesize(&descriptor("603", "The Matrix"), 2024, &Config::default()).unwrap();
    assert_eq!(item.genre, vec!["Action", "Science Fiction"]);
    assert_eq!(item.year, Some(1999));
    assert_eq!(item.rating, 8.7);
    assert!((0..200).contains(&item.votes));
    assert_eq!(item.releases[0].date, "1999-03-30T23:00:00Z");
    assert_eq!(item.plot.as_deref(), Some("A hacker learns the truth."));

    let mut undated = descriptor("604", "Untitled");
    undated.release_date = None;
    undated.vote_count = Some(12);
    let item = synthesize(&undated, 2024, &Config::default()).unwrap();
    assert_eq!(item.year, Some(2024));
    assert_eq!(item.votes, 12);
    assert!(item.releases.is_empty());
  }

  #[test]
  fn synthesis_is_deterministic() {
    let a = synthesize(&descriptor("603", "The Matrix"), 2024, &Config::default()).unwrap();
    let b = synthesize(&descriptor("603", "The Matrix"), 2024, &Config::default()).unwrap();
    assert_eq!(encode(&a).unwrap(), encode(&b).unwrap());
  }

  #[test]
  fn feed_shapes() {
    let page = r#"{"page":1,"results":[{"id":603,"title":"The Matrix","genre_ids":[28]}]}"#;
    let items = parse_feed(page).unwrap();
    assert_eq!(items[0].id, "603");

    let list = r#"[{"id":"tt1","title":"Heat"}]"#;
    assert_eq!(parse_feed(list).unwrap()[0].title, "Heat");
    assert!(parse_feed("{}").is_err());
  }

  #[tokio::test]
  async fn sync_is_idempotent_and_isolates_failures() {
    let catalog = CatalogQueryEngine::new(Arc::new(MemoryStore::new()), Config::default());
    let sync = CatalogSync::new(catalog.clone(), Config::default());
    let batch = vec![
      descriptor("603", "The Matrix"),
      descriptor("", "Nameless"),
      descriptor("604", "The Matrix Reloaded"),
    ];

    let first = sync.sync_at(&batch, 2024).await;
    assert_eq!(first.inserted, 2);
    assert_eq!(first.failed.len(), 1);

    let before = catalog.get("603").await.unwrap().unwrap();
    let second = sync.sync_at(&batch, 2024).await;
    assert_eq!(second.inserted, 0);
    assert_eq!(second.skipped, 2);
    assert_eq!(catalog.get("603").await.unwrap().unwrap(), before);
  }
}
