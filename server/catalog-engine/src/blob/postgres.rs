use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx_core::query::query;
use sqlx_core::row::Row;
use sqlx_postgres::{PgPool, Postgres};
use uuid::Uuid;

use super::{check_name, split_chunks, BlobFile, BlobStore};
use crate::error::CatalogError;

/// Blob store on two tables: file metadata and ordered `bytea` chunks.
pub struct PgBlobStore {
  pool: PgPool,
  chunk_size: usize,
  default_name: String,
}

impl PgBlobStore {
  pub async fn new(
    pool: PgPool,
    chunk_size: usize,
    default_name: impl Into<String>,
  ) -> Result<Self, CatalogError> {
    query::<Postgres>(
      "CREATE TABLE IF NOT EXISTS blob_files (\
       id UUID PRIMARY KEY, name TEXT NOT NULL, length BIGINT NOT NULL, \
       content_type TEXT, chunk_size INTEGER NOT NULL, uploaded_at TIMESTAMPTZ NOT NULL)",
    )
    .execute(&pool)
    .await?;
    query::<Postgres>(
      "CREATE TABLE IF NOT EXISTS blob_chunks (\
       file_id UUID NOT NULL REFERENCES blob_files(id) ON DELETE CASCADE, \
       n INTEGER NOT NULL, data BYTEA NOT NULL, PRIMARY KEY (file_id, n))",
    )
    .execute(&pool)
    .await?;
    query::<Postgres>("CREATE INDEX IF NOT EXISTS blob_files_name ON blob_files (name, uploaded_at)")
      .execute(&pool)
      .await?;

    Ok(Self {
      pool,
      chunk_size,
      default_name: default_name.into(),
    })
  }
}

#[async_trait]
impl BlobStore for PgBlobStore {
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
    let id = Uuid::new_v4();
    let mut tx = self.pool.begin().await?;

    query::<Postgres>(
      "INSERT INTO blob_files (id, name, length, content_type, chunk_size, uploaded_at) \
       VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(id)
    .bind(name.to_string())
    .bind(bytes.len() as i64)
    .bind(content_type.map(str::to_string))
    .bind(self.chunk_size as i32)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;

    for (n, chunk) in split_chunks(bytes, self.chunk_size).into_iter().enumerate() {
      query::<Postgres>("INSERT INTO blob_chunks (file_id, n, data) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(n as i32)
        .bind(chunk.to_vec())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(id)
  }

  async fn lookup(&self, name: &str) -> Result<Option<BlobFile>, CatalogError> {
    let row = query::<Postgres>(
      "SELECT id, length, content_type, uploaded_at FROM blob_files \
       WHERE name = $1 ORDER BY uploaded_at DESC LIMIT 1",
    )
    .bind(name.to_string())
    .fetch_optional(&self.pool)
    .await?;
    let Some(row) = row else {
      return Ok(None);
    };

    let id: Uuid = row.try_get("id")?;
    let length: i64 = row.try_get("length")?;
    let content_type: Option<String> = row.try_get("content_type")?;
    let uploaded_at: DateTime<Utc> = row.try_get("uploaded_at")?;

    let chunks = query::<Postgres>("SELECT data FROM blob_chunks WHERE file_id = $1 ORDER BY n")
      .bind(id)
      .fetch_all(&self.pool)
      .await?;
    let mut content = Vec::with_capacity(length.max(0) as usize);
    for chunk in chunks {
      let data: Vec<u8> = chunk.try_get("data")?;
      content.extend_from_slice(&data);
    }

    Ok(Some(BlobFile {
      id,
      name: name.to_string(),
      length: length.max(0) as u64,
      content_type,
      uploaded_at,
      content,
    }))
  }
}
