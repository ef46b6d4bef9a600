//! Document store contract and adapters.
//!
//! The engines only speak [`DocumentStore`]. Two adapters ship with the crate:
//!
//! - [`MemoryStore`] - in-process collections, used by tests and single-node runs
//! - [`PgStore`] - PostgreSQL `jsonb` tables via sqlx
//!
//! Every operation is atomic on its own; nothing spans documents or collections.

pub mod document;
mod memory;
mod postgres;
pub mod query;
pub mod text;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use query::{Collection, Document, Filter, FindOptions, IndexSpec, Update, UpdateResult};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::CatalogError;

/// Typed record from a stored document.
pub fn decode<T: DeserializeOwned>(doc: Document) -> Result<T, CatalogError> {
  Ok(serde_json::from_value(Value::Object(doc))?)
}

/// Stored document from a typed record.
pub fn encode<T: Serialize>(record: &T) -> Result<Document, CatalogError> {
  match serde_json::to_value(record)? {
    Value::Object(doc) => Ok(doc),
    _ => Err(CatalogError::invalid("record", "must serialize to an object")),
  }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
  /// Human-readable adapter name (used in logs).
  fn name(&self) -> &'static str;

  /// Create an index. Creating an index that already exists is a no-op.
  async fn create_index(&self, coll: Collection, index: &IndexSpec) -> Result<(), CatalogError>;

  async fn find(
    &self,
    coll: Collection,
    filter: &Filter,
    options: &FindOptions,
  ) -> Result<Vec<Document>, CatalogError>;

  /// Fails with `DuplicateKey` when `_id` is already taken.
  async fn insert_one(&self, coll: Collection, doc: Document) -> Result<(), CatalogError>;

  /// Stops at the first failure; earlier documents stay inserted.
  async fn insert_many(&self, coll: Collection, docs: Vec<Document>) -> Result<u64, CatalogError>;

  async fn update_one(
    &self,
    coll: Collection,
    filter: &Filter,
    update: &Update,
    upsert: bool,
  ) -> Result<UpdateResult, CatalogError>;

  async fn update_many(
    &self,
    coll: Collection,
    filter: &Filter,
    update: &Update,
    upsert: bool,
  ) -> Result<UpdateResult, CatalogError>;

  async fn delete_many(&self, coll: Collection, filter: &Filter) -> Result<u64, CatalogError>;

  async fn count(&self, coll: Collection, filter: &Filter) -> Result<u64, CatalogError>;

  async fn find_one(&self, coll: Collection, filter: &Filter) -> Result<Option<Document>, CatalogError> {
    let mut docs = self.find(coll, filter, &FindOptions::new().limit(1)).await?;
    Ok(docs.pop())
  }
}
