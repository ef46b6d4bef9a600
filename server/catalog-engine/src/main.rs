//! Binary entrypoint: consume SourcedEvent JSON lines from stdin into the catalog.
//!
//! Environment:
//! - `DATABASE_URL`: PostgreSQL store when set, in-memory store otherwise
//! - `CATALOG_KEYWORDS`: comma-separated titles to track (required)
//! - `CATALOG_IGNORE_UNTAGGED`: `true` to drop posts without a location
//! - `CATALOG_MAX_EVENTS`: stop after this many persisted events
//! - `CATALOG_SEED_ITEMS` / `CATALOG_SEED_EVENTS`: JSON seed files, applied below the seed threshold
//! - other `CATALOG_*` tunables, see `Config::from_env`
//!
//! Runs until EOF or Ctrl-C, then prints the subscription counters as one JSON line.
//! Logs go to stderr (`RUST_LOG`, default `info`).

use std::env;
use std::sync::Arc;

use catalog_engine::{
  BlobStore, CatalogService, Config, DocumentStore, JsonLinesStream, MemoryBlobStore, MemoryStore, PgBlobStore,
  PgStore, SeedData, SeedPolicy, SubscriptionOptions,
};
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn env_flag(key: &str) -> bool {
  env::var(key)
    .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
    .unwrap_or(false)
}

async fn seed_policy(config: &Config) -> Result<SeedPolicy, Box<dyn std::error::Error>> {
  let (Ok(items), Ok(events)) = (env::var("CATALOG_SEED_ITEMS"), env::var("CATALOG_SEED_EVENTS")) else {
    return Ok(SeedPolicy::Never);
  };
  let items = tokio::fs::read_to_string(&items).await?;
  let events = tokio::fs::read_to_string(&events).await?;
  Ok(SeedPolicy::below_configured(config, SeedData::from_json(&items, &events)?))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  let config = Config::from_env();

  let (store, blobs): (Arc<dyn DocumentStore>, Arc<dyn BlobStore>) = match env::var("DATABASE_URL") {
    Ok(url) => {
      let store = PgStore::connect(&url).await?;
      let blobs = PgBlobStore::new(store.pool().clone(), config.blob_chunk_size, config.default_blob.clone()).await?;
      (Arc::new(store) as Arc<dyn DocumentStore>, Arc::new(blobs) as Arc<dyn BlobStore>)
    }
    Err(_) => (
      Arc::new(MemoryStore::new()) as Arc<dyn DocumentStore>,
      Arc::new(MemoryBlobStore::new(config.blob_chunk_size, config.default_blob.clone())) as Arc<dyn BlobStore>,
    ),
  };
  info!(store = store.name(), "store selected");

  let seed = seed_policy(&config).await?;
  let service = CatalogService::open(store, blobs, config, seed).await?;

  let options = SubscriptionOptions {
    keywords: env::var("CATALOG_KEYWORDS")
      .unwrap_or_default()
      .split(',')
      .map(str::to_string)
      .collect(),
    ignore_untagged: env_flag("CATALOG_IGNORE_UNTAGGED"),
    max_events: env::var("CATALOG_MAX_EVENTS").ok().and_then(|v| v.trim().parse().ok()),
  };

  let stdin = JsonLinesStream::new("stdin", BufReader::new(tokio::io::stdin()));
  let handle = service.subscribe(stdin, options)?;

  let signal = handle.stop_signal();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      info!("interrupt received, stopping");
      signal.stop();
    }
  });

  let stats = handle.join().await?;
  println!("{}", serde_json::to_string(&stats)?);
  Ok(())
}
