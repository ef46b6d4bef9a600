//! Stream-enriched catalog engine.
//!
//! Correlates a live stream of social posts against a movie catalog: each post is
//! classified by the title it was tracked under, located (precise geo, else the place
//! bounding box, else nowhere), appended to the event log, and snapshotted onto every
//! item with that title. Query engines cover both collections.
//!
//! Storage is behind [`DocumentStore`] and [`BlobStore`]; in-memory and PostgreSQL
//! adapters ship with the crate. Nothing happens implicitly: open a
//! [`CatalogService`] with a [`SeedPolicy`] to create indexes and seed.

pub mod blob;
pub mod catalog;
pub mod config;
pub mod correlation;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod geo;
pub mod normalize;
pub mod pipeline;
pub mod service;
pub mod store;
pub mod subscription;
pub mod sync;
pub mod types;

pub use blob::{BlobFile, BlobStore, MemoryBlobStore, PgBlobStore};
pub use catalog::CatalogQueryEngine;
pub use config::Config;
pub use error::CatalogError;
pub use events::EventQueryEngine;
pub use pipeline::CorrelationPipeline;
pub use service::{CatalogService, SeedBlob, SeedData, SeedPolicy};
pub use store::{DocumentStore, MemoryStore, PgStore};
pub use subscription::{
  spawn_subscription, EventStream, JsonLinesStream, SubscriptionHandle, SubscriptionOptions, SubscriptionStats,
};
pub use sync::{CatalogSync, SyncReport};
pub use types::{Event, EventRef, GeoPoint, IngestOutcome, Item, MapMarker, SourcedEvent};
