//! Structured error types for the catalog engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
  #[error("not found: {what} {id}")]
  NotFound { what: &'static str, id: String },

  #[error("invalid argument: {field}: {reason}")]
  InvalidArgument { field: String, reason: String },

  #[error("store unavailable: {0}")]
  StoreUnavailable(String),

  #[error("duplicate key: {0}")]
  DuplicateKey(String),

  #[error("{kind} index required on collection {collection}")]
  IndexMissing {
    collection: &'static str,
    kind: &'static str,
  },

  /// One or both halves of the dual write failed for a single event.
  #[error(
    "partial ingest failure for event {event_id}: event log: {}, catalog: {}",
    .event_log.as_deref().unwrap_or("ok"),
    .catalog.as_deref().unwrap_or("ok")
  )]
  PartialIngest {
    event_id: i64,
    event_log: Option<String>,
    catalog: Option<String>,
  },

  #[error("json: {0}")]
  Json(#[from] serde_json::Error),
}

impl CatalogError {
  pub fn invalid(field: &str, reason: &str) -> Self {
    Self::InvalidArgument {
      field: field.to_string(),
      reason: reason.to_string(),
    }
  }

  pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
    Self::NotFound {
      what,
      id: id.into(),
    }
  }

  pub fn unavailable(msg: impl Into<String>) -> Self {
    Self::StoreUnavailable(msg.into())
  }
}
