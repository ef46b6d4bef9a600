//! Correlation pipeline: classify, locate, then write to the event log and the catalog.
//!
//! Stages: received -> classified -> located -> persisted | discarded.
//! The two writes are independent; a failure in either is reported for that event
//! alone as `PartialIngest` and never stops the stream.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::correlation;
use crate::error::CatalogError;
use crate::fingerprint;
use crate::normalize;
use crate::store::query as q;
use crate::store::{encode, Collection, DocumentStore, Update, UpdateResult};
use crate::types::*;

/// Processes one sourced event at a time against a shared store.
#[derive(Clone)]
pub struct CorrelationPipeline {
  store: Arc<dyn DocumentStore>,
}

impl CorrelationPipeline {
  pub fn new(store: Arc<dyn DocumentStore>) -> Self {
    Self { store }
  }

  /// Run one event through every stage.
  ///
  /// `keywords` are the titles the caller tracks. With `ignore_untagged`, events
  /// without any resolvable location are discarded before anything is written.
  pub async fn process(
    &self,
    sourced: &SourcedEvent,
    keywords: &[String],
    ignore_untagged: bool,
  ) -> Result<IngestOutcome, CatalogError> {
    let event_id = sourced.status.id;
    debug!(event_id, stage = ?Stage::Received, "event received");

    let Some(title) = correlation::classify(sourced, keywords) else {
      debug!(event_id, "no tracked title applies");
      return Ok(IngestOutcome::Unmatched { event_id });
    };
    debug!(event_id, stage = ?Stage::Classified, title = %title);

    let (event, location) = normalize::normalize(&sourced.status, &title)?;
    debug!(event_id, stage = ?Stage::Located, ?location);

    if ignore_untagged && location == LocationSource::Unresolved {
      debug!(event_id, stage = ?Stage::Discarded, "unlocated event ignored");
      return Ok(IngestOutcome::Discarded {
        event_id,
        matched_title: title,
      });
    }

    // Both writes run regardless of the other's outcome.
    let logged = self.append_to_log(&event).await;
    let attached = self.attach_to_catalog(&event).await;

    match (logged, attached) {
      (Ok(()), Ok(res)) => {
        let item_created = res.upserted_id.is_some();
        debug!(event_id, stage = ?Stage::Persisted, matched = res.matched, item_created);
        Ok(IngestOutcome::Persisted {
          event_id,
          matched_title: title,
          location,
          items_updated: res.matched + u64::from(item_created),
          item_created,
        })
      }
      (logged, attached) => {
        let err = CatalogError::PartialIngest {
          event_id,
          event_log: logged.err().map(|e| e.to_string()),
          catalog: attached.err().map(|e| e.to_string()),
        };
        warn!(event_id, error = %err, "ingest failed");
        Err(err)
      }
    }
  }

  async fn append_to_log(&self, event: &Event) -> Result<(), CatalogError> {
    self.store.insert_one(Collection::Events, encode(event)?).await
  }

  /// Push a snapshot onto every item titled `event.matched_title`, creating a stub if none.
  async fn attach_to_catalog(&self, event: &Event) -> Result<UpdateResult, CatalogError> {
    let snapshot = serde_json::to_value(event.snapshot())?;
    let update = Update::new()
      .push("events", snapshot)
      .set_on_insert("_id", fingerprint::stub_item_id(&event.matched_title));
    self
      .store
      .update_many(Collection::Items, &q::eq("title", event.matched_title.as_str()), &update, true)
      .await
  }
}
