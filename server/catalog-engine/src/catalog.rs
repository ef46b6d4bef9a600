//! Read and annotate operations over the item catalog.
//!
//! Every query validates its arguments before touching the store and returns an
//! empty result (never `NotFound`) when nothing matches.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::config::{resolve_limit, Config};
use crate::error::CatalogError;
use crate::store::query::{self as q, Filter};
use crate::store::{decode, encode, Collection, DocumentStore, FindOptions, Update};
use crate::types::Item;

/// Query engine over catalog items.
#[derive(Clone)]
pub struct CatalogQueryEngine {
  store: Arc<dyn DocumentStore>,
  config: Config,
}

impl CatalogQueryEngine {
  pub fn new(store: Arc<dyn DocumentStore>, config: Config) -> Self {
    Self { store, config }
  }

  async fn find_items(&self, filter: &Filter, options: &FindOptions) -> Result<Vec<Item>, CatalogError> {
    let docs = self.store.find(Collection::Items, filter, options).await?;
    docs.into_iter().map(decode).collect()
  }

  /// Item by id.
  pub async fn get(&self, id: &str) -> Result<Option<Item>, CatalogError> {
    let doc = self.store.find_one(Collection::Items, &q::eq("_id", id)).await?;
    doc.map(decode).transpose()
  }

  /// First item whose title equals `title` exactly.
  pub async fn find_exact(&self, title: &str) -> Result<Option<Item>, CatalogError> {
    if title.is_empty() {
      return Err(CatalogError::invalid("title", "must not be empty"));
    }
    let doc = self.store.find_one(Collection::Items, &q::eq("title", title)).await?;
    doc.map(decode).transpose()
  }

  /// Items with `votes > min_votes` and `rating > min_rating`, votes then rating descending.
  pub async fn find_best(&self, min_votes: i64, min_rating: f64, limit: i64) -> Result<Vec<Item>, CatalogError> {
    if !min_rating.is_finite() {
      return Err(CatalogError::invalid("min_rating", "must be a finite number"));
    }
    let limit = resolve_limit(limit)?;
    if limit == 0 {
      return Ok(Vec::new());
    }
    let filter = q::and(vec![q::gt("votes", min_votes), q::gt("rating", min_rating)]);
    let options = FindOptions::new().sort_desc("votes").sort_desc("rating").limit(limit);
    self.find_items(&filter, &options).await
  }

  /// [`find_best`](Self::find_best) with the configured vote floor.
  pub async fn find_top_rated(&self, min_rating: f64, limit: i64) -> Result<Vec<Item>, CatalogError> {
    self.find_best(self.config.best_min_votes, min_rating, limit).await
  }

  /// Items carrying every genre of a comma-separated list.
  pub async fn find_by_genres(&self, genres: &str, limit: i64) -> Result<Vec<Item>, CatalogError> {
    let wanted: Vec<&str> = genres.split(',').map(str::trim).filter(|g| !g.is_empty()).collect();
    if wanted.is_empty() {
      return Err(CatalogError::invalid("genres", "at least one genre is required"));
    }
    let limit = resolve_limit(limit)?;
    if limit == 0 {
      return Ok(Vec::new());
    }
    self
      .find_items(&q::all_of("genre", wanted), &FindOptions::new().limit(limit))
      .await
  }

  /// Items whose title starts with `prefix` (case-sensitive, taken literally).
  pub async fn search_by_prefix(&self, prefix: &str, limit: i64) -> Result<Vec<Item>, CatalogError> {
    let limit = resolve_limit(limit)?;
    if limit == 0 {
      return Ok(Vec::new());
    }
    self
      .find_items(&prefix_filter(prefix), &FindOptions::new().limit(limit))
      .await
  }

  /// Titles only, for typeahead.
  pub async fn suggest(&self, prefix: &str, limit: i64) -> Result<Vec<String>, CatalogError> {
    let limit = resolve_limit(limit)?;
    if limit == 0 {
      return Ok(Vec::new());
    }
    let options = FindOptions::new().limit(limit).project(&["title"]);
    let docs = self.store.find(Collection::Items, &prefix_filter(prefix), &options).await?;
    Ok(docs
      .into_iter()
      .filter_map(|mut d| match d.remove("title") {
        Some(Value::String(t)) => Some(t),
        _ => None,
      })
      .collect())
  }

  /// Items with at least one correlated event.
  pub async fn find_with_events(&self, limit: i64) -> Result<Vec<Item>, CatalogError> {
    let limit = resolve_limit(limit)?;
    if limit == 0 {
      return Ok(Vec::new());
    }
    let filter = q::elem_match("events", Filter::All);
    self.find_items(&filter, &FindOptions::new().limit(limit)).await
  }

  /// Items with at least one located event (something to put on a map).
  pub async fn find_viewable(&self, limit: i64) -> Result<Vec<Item>, CatalogError> {
    let limit = resolve_limit(limit)?;
    if limit == 0 {
      return Ok(Vec::new());
    }
    let filter = q::elem_match("events", q::present("coordinates"));
    self.find_items(&filter, &FindOptions::new().limit(limit)).await
  }

  /// Items with an embedded event whose text contains `keyword`, ignoring case.
  ///
  /// Unanchored regex over every embedded event: a full scan. Prefer
  /// [`EventQueryEngine::full_text_search`](crate::events::EventQueryEngine::full_text_search).
  pub async fn find_by_event_keyword_scan(&self, keyword: &str, limit: i64) -> Result<Vec<Item>, CatalogError> {
    if keyword.trim().is_empty() {
      return Err(CatalogError::invalid("keyword", "must not be empty"));
    }
    let limit = resolve_limit(limit)?;
    if limit == 0 {
      return Ok(Vec::new());
    }
    let filter = q::elem_match("events", q::regex_ci("text", regex::escape(keyword)));
    self.find_items(&filter, &FindOptions::new().limit(limit)).await
  }

  /// Overwrite the annotation of item `id`.
  pub async fn set_annotation(&self, id: &str, text: &str) -> Result<(), CatalogError> {
    let update = Update::new().set("annotation", text);
    let res = self
      .store
      .update_one(Collection::Items, &q::eq("_id", id), &update, false)
      .await?;
    if res.matched == 0 {
      return Err(CatalogError::not_found("item", id));
    }
    debug!(id, changed = res.modified > 0, "annotation set");
    Ok(())
  }

  /// Insert `item` unless its id is already taken. Returns whether it was inserted.
  pub async fn upsert(&self, item: &Item) -> Result<bool, CatalogError> {
    if item.id.is_empty() {
      return Err(CatalogError::invalid("id", "must not be empty"));
    }
    match self.store.insert_one(Collection::Items, encode(item)?).await {
      Ok(()) => Ok(true),
      Err(CatalogError::DuplicateKey(_)) => Ok(false),
      Err(e) => Err(e),
    }
  }
}

fn prefix_filter(prefix: &str) -> Filter {
  q::regex("title", format!("^{}", regex::escape(prefix)))
}
