//! Named binary objects (poster images and the like), stored in fixed-size chunks.

mod memory;
mod postgres;

pub use memory::MemoryBlobStore;
pub use postgres::PgBlobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::CatalogError;

/// A stored object with its content reassembled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlobFile {
  pub id: Uuid,
  pub name: String,
  pub length: u64,
  pub content_type: Option<String>,
  pub uploaded_at: DateTime<Utc>,
  #[serde(skip)]
  pub content: Vec<u8>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
  /// Name served when a lookup misses.
  fn default_name(&self) -> &str;

  /// Store `bytes` under `name`. Repeated names add a newer revision.
  async fn store(
    &self,
    name: &str,
    bytes: &[u8],
    content_type: Option<&str>,
  ) -> Result<Uuid, CatalogError>;

  /// Newest revision stored under `name`, if any.
  async fn lookup(&self, name: &str) -> Result<Option<BlobFile>, CatalogError>;

  /// Lookup with fallback to the default object.
  async fn retrieve(&self, name: &str) -> Result<BlobFile, CatalogError> {
    if let Some(file) = self.lookup(name).await? {
      return Ok(file);
    }
    let fallback = self.default_name().to_string();
    if fallback != name {
      if let Some(file) = self.lookup(&fallback).await? {
        tracing::debug!(requested = name, served = %fallback, "blob miss, serving default");
        return Ok(file);
      }
    }
    Err(CatalogError::not_found("blob", name))
  }
}

fn check_name(name: &str) -> Result<(), CatalogError> {
  if name.trim().is_empty() {
    return Err(CatalogError::invalid("name", "must not be empty"));
  }
  Ok(())
}

/// Split into chunks of at most `size` bytes. A zero size keeps one chunk.
fn split_chunks(bytes: &[u8], size: usize) -> Vec<&[u8]> {
  if bytes.is_empty() {
    return Vec::new();
  }
  if size == 0 {
    return vec![bytes];
  }
  bytes.chunks(size).collect()
}
