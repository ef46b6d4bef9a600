//! Engine configuration with sane defaults.

use std::env;
use std::str::FromStr;

use crate::error::CatalogError;

/// Tunable limits and defaults for the catalog engine.
#[derive(Debug, Clone)]
pub struct Config {
  /// Seed when the event log holds fewer records than this.
  pub seed_threshold: u64,
  /// Chunk size for blob uploads, in bytes.
  pub blob_chunk_size: usize,
  /// Blob returned when a lookup by name misses.
  pub default_blob: String,
  /// Exclusive upper bound for synthesized vote counts.
  pub placeholder_votes_ceiling: u64,
  /// Vote floor used by "best items" lookups that only take a rating.
  pub best_min_votes: i64,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      seed_threshold: 1000,
      blob_chunk_size: 358_400,
      default_blob: "sample.png".into(),
      placeholder_votes_ceiling: 200,
      best_min_votes: 1000,
    }
  }
}

impl Config {
  /// Defaults overridden by `CATALOG_*` environment variables.
  ///
  /// Unparseable values are ignored with a warning.
  pub fn from_env() -> Self {
    let mut config = Self::default();
    override_from_env("CATALOG_SEED_THRESHOLD", &mut config.seed_threshold);
    override_from_env("CATALOG_BLOB_CHUNK_SIZE", &mut config.blob_chunk_size);
    override_from_env("CATALOG_DEFAULT_BLOB", &mut config.default_blob);
    override_from_env(
      "CATALOG_PLACEHOLDER_VOTES_CEILING",
      &mut config.placeholder_votes_ceiling,
    );
    override_from_env("CATALOG_BEST_MIN_VOTES", &mut config.best_min_votes);
    config
  }
}

/// Validate a caller-supplied result cap.
///
/// Negative caps are rejected; zero is allowed and means "no results".
pub fn resolve_limit(limit: i64) -> Result<usize, CatalogError> {
  if limit < 0 {
    return Err(CatalogError::invalid("limit", "must not be negative"));
  }
  Ok(usize::try_from(limit).unwrap_or(usize::MAX))
}

fn override_from_env<T: FromStr>(key: &str, slot: &mut T) {
  let Ok(raw) = env::var(key) else {
    return;
  };
  match raw.trim().parse() {
    Ok(v) => *slot = v,
    Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable config value"),
  }
}
