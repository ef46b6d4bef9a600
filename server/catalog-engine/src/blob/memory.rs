use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{check_name, split_chunks, BlobFile, BlobStore};
use crate::error::CatalogError;

#[derive(Debug)]
struct StoredBlob {
  id: Uuid,
  length: u64,
  content_type: Option<String>,
  uploaded_at: DateTime<Utc>,
  chunks: Vec<Vec<u8>>,
}

/// In-process blob store. Revisions per name are kept oldest first.
#[derive(Debug)]
pub struct MemoryBlobStore {
  chunk_size: usize,
  default_name: String,
  files: RwLock<HashMap<String, Vec<StoredBlob>>>,
}

impl MemoryBlobStore {
  pub fn new(chunk_size: usize, default_name: impl Into<String>) -> Self {
    Self {
      chunk_size,
      default_name: default_name.into(),
      files: RwLock::new(HashMap::new()),
    }
  }

  /// Number of chunks backing the newest revision of `name`.
  pub async fn chunk_count(&self, name: &str) -> Option<usize> {
    let files = self.files.read().await;
    files.get(name).and_then(|revs| revs.last()).map(|b| b.chunks.len())
  }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
  fn default_name(&self) -> &str {
    &self.default_name
  }

  async fn store(
    &self,
    name: &str,
    bytes: &[u8],
    content_type: Option<&str>,
  ) -> Result<Uuid, CatalogError> {
    check_name(name)?;
    let blob = StoredBlob {
      id: Uuid::new_v4(),
      length: bytes.len() as u64,
      content_type: content_type.map(str::to_string),
      uploaded_at: Utc::now(),
      chunks: split_chunks(bytes, self.chunk_size)
        .into_iter()
        .map(<[u8]>::to_vec)
        .collect(),
    };
    let id = blob.id;
    self.files.write().await.entry(name.to_string()).or_default().push(blob);
    Ok(id)
  }

  async fn lookup(&self, name: &str) -> Result<Option<BlobFile>, CatalogError> {
    let files = self.files.read().await;
    Ok(files.get(name).and_then(|revs| revs.last()).map(|b| BlobFile {
      id: b.id,
      name: name.to_string(),
      length: b.length,
      content_type: b.content_type.clone(),
      uploaded_at: b.uploaded_at,
      content: b.chunks.concat(),
    }))
  }
}
