//! Long-running stream subscriptions.
//!
//! Each subscription is one tokio task pulling from an [`EventStream`] and pushing every
//! record through the [`CorrelationPipeline`]. Per-event failures are counted and logged;
//! the task only ends on end-of-stream, its event cap, or [`SubscriptionHandle::stop`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::CatalogError;
use crate::pipeline::CorrelationPipeline;
use crate::types::{IngestOutcome, SourcedEvent};

/// A source of sourced events. `None` means the stream is exhausted.
#[async_trait]
pub trait EventStream: Send {
  /// Name used in logs.
  fn name(&self) -> &str;

  async fn next_event(&mut self) -> Option<Result<SourcedEvent, CatalogError>>;
}

/// One JSON [`SourcedEvent`] per line. Blank lines are skipped; a malformed line
/// yields an error and reading continues with the next line.
pub struct JsonLinesStream<R> {
  name: String,
  lines: Lines<R>,
  done: bool,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesStream<R> {
  pub fn new(name: impl Into<String>, reader: R) -> Self {
    Self {
      name: name.into(),
      lines: reader.lines(),
      done: false,
    }
  }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> EventStream for JsonLinesStream<R> {
  fn name(&self) -> &str {
    &self.name
  }

  async fn next_event(&mut self) -> Option<Result<SourcedEvent, CatalogError>> {
    while !self.done {
      match self.lines.next_line().await {
        Ok(Some(line)) => {
          let trimmed = line.trim();
          if trimmed.is_empty() {
            continue;
          }
          return Some(serde_json::from_str(trimmed).map_err(CatalogError::from));
        }
        Ok(None) => self.done = true,
        Err(e) => {
          self.done = true;
          return Some(Err(CatalogError::unavailable(format!("read error: {}", e))));
        }
      }
    }
    None
  }
}

/// Events handed over in-process by a producer task.
#[async_trait]
impl EventStream for mpsc::Receiver<Result<SourcedEvent, CatalogError>> {
  fn name(&self) -> &str {
    "channel"
  }

  async fn next_event(&mut self) -> Option<Result<SourcedEvent, CatalogError>> {
    self.recv().await
  }
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
  /// Titles to track. Must contain at least one non-blank entry.
  pub keywords: Vec<String>,
  /// Discard events without any resolvable location.
  pub ignore_untagged: bool,
  /// Stop after this many events were persisted.
  pub max_events: Option<u64>,
}

/// Per-subscription counters. `received` is the sum of the others.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionStats {
  pub received: u64,
  pub persisted: u64,
  pub discarded: u64,
  pub unmatched: u64,
  pub invalid: u64,
  pub failed: u64,
}

/// Control handle for a running subscription. Dropping it leaves the task running.
pub struct SubscriptionHandle {
  name: String,
  stop: StopSignal,
  task: JoinHandle<SubscriptionStats>,
}

/// Detached stop trigger, usable after the handle was moved into `join`.
#[derive(Clone)]
pub struct StopSignal(Arc<watch::Sender<bool>>);

impl StopSignal {
  pub fn stop(&self) {
    self.0.send_replace(true);
  }
}

impl SubscriptionHandle {
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Ask the task to stop after the event in flight.
  pub fn stop(&self) {
    self.stop.stop();
  }

  pub fn stop_signal(&self) -> StopSignal {
    self.stop.clone()
  }

  pub fn is_finished(&self) -> bool {
    self.task.is_finished()
  }

  /// Wait for the task and return its counters.
  pub async fn join(self) -> Result<SubscriptionStats, CatalogError> {
    self
      .task
      .await
      .map_err(|e| CatalogError::unavailable(format!("subscription {} aborted: {}", self.name, e)))
  }
}

/// Start consuming `stream` in the background. Returns immediately.
pub fn spawn_subscription<S>(
  pipeline: CorrelationPipeline,
  stream: S,
  options: SubscriptionOptions,
) -> Result<SubscriptionHandle, CatalogError>
where
  S: EventStream + 'static,
{
  let keywords: Vec<String> = options
    .keywords
    .iter()
    .map(|k| k.trim().to_string())
    .filter(|k| !k.is_empty())
    .collect();
  if keywords.is_empty() {
    return Err(CatalogError::invalid("keywords", "at least one keyword is required"));
  }

  let name = stream.name().to_string();
  let (stop_tx, stop_rx) = watch::channel(false);
  let options = SubscriptionOptions { keywords, ..options };
  info!(
    subscription = %name,
    keywords = ?options.keywords,
    ignore_untagged = options.ignore_untagged,
    max_events = ?options.max_events,
    "subscription started"
  );
  let task = tokio::spawn(run(pipeline, stream, options, stop_rx));

  Ok(SubscriptionHandle {
    name,
    stop: StopSignal(Arc::new(stop_tx)),
    task,
  })
}

/// Resolves once a stop was requested; never resolves if the handle is gone.
async fn stop_requested(rx: &mut watch::Receiver<bool>) {
  if rx.wait_for(|stop| *stop).await.is_err() {
    std::future::pending::<()>().await;
  }
}

async fn run<S: EventStream>(
  pipeline: CorrelationPipeline,
  mut stream: S,
  options: SubscriptionOptions,
  mut stop_rx: watch::Receiver<bool>,
) -> SubscriptionStats {
  let mut stats = SubscriptionStats::default();
  let name = stream.name().to_string();

  loop {
    let next = tokio::select! {
      biased;
      _ = stop_requested(&mut stop_rx) => {
        info!(subscription = %name, "stop requested");
        break;
      }
      next = stream.next_event() => next,
    };

    let Some(next) = next else {
      info!(subscription = %name, "stream ended");
      break;
    };
    stats.received += 1;

    let sourced = match next {
      Ok(s) => s,
      Err(e) => {
        stats.invalid += 1;
        warn!(subscription = %name, error = %e, "unreadable stream record");
        continue;
      }
    };

    match pipeline
      .process(&sourced, &options.keywords, options.ignore_untagged)
      .await
    {
      Ok(IngestOutcome::Persisted { .. }) => stats.persisted += 1,
      Ok(IngestOutcome::Discarded { .. }) => stats.discarded += 1,
      Ok(IngestOutcome::Unmatched { .. }) => stats.unmatched += 1,
      Err(CatalogError::InvalidArgument { field, reason }) => {
        stats.invalid += 1;
        warn!(subscription = %name, event_id = sourced.status.id, %field, %reason, "invalid event");
      }
      Err(e) => {
        stats.failed += 1;
        warn!(subscription = %name, event_id = sourced.status.id, error = %e, "event not stored");
      }
    }

    if options.max_events.is_some_and(|max| stats.persisted >= max) {
      info!(subscription = %name, persisted = stats.persisted, "event cap reached");
      break;
    }
  }

  info!(subscription = %name, ?stats, "subscription finished");
  stats
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::{Collection, DocumentStore, Filter, MemoryStore};
  use std::io::Cursor;
  use std::time::Duration;

  fn line(id: i64, keyword: &str, geo: bool) -> String {
    let geo = if geo {
      r#","geo":{"latitude":40.0,"longitude":-74.0}"#
    } else {
      ""
    };
    format!(
      r#"{{"keyword":"{}","status":{{"id":{},"author":"a","text":"t","created_at":"2024-01-01T00:00:00Z"{}}}}}"#,
      keyword, id, geo
    )
  }

  fn options(max_events: Option<u64>) -> SubscriptionOptions {
    SubscriptionOptions {
      keywords: vec!["Matrix".into()],
      ignore_untagged: true,
      max_events,
    }
  }

  #[tokio::test]
  async fn json_lines_skip_blanks_and_survive_garbage() {
    let input = format!("{}\n\n{{not json\n{}\n", line(1, "Matrix", true), line(2, "Matrix", true));
    let mut stream = JsonLinesStream::new("stdin", Cursor::new(input.into_bytes()));
    assert!(stream.next_event().await.unwrap().is_ok());
    assert!(stream.next_event().await.unwrap().is_err());
    assert_eq!(stream.next_event().await.unwrap().unwrap().status.id, 2);
    assert!(stream.next_event().await.is_none());
  }

  #[tokio::test]
  async fn counts_every_outcome() {
    let input = [
      line(1, "Matrix", true),
      line(2, "Matrix", false),
      line(3, "Alien", true),
      "garbage".to_string(),
      line(-4, "Matrix", true),
    ]
    .join("\n");
    let store = Arc::new(MemoryStore::new());
    let handle = spawn_subscription(
      CorrelationPipeline::new(store.clone()),
      JsonLinesStream::new("test", Cursor::new(input.into_bytes())),
      options(None),
    )
    .unwrap();

    let stats = handle.join().await.unwrap();
    assert_eq!(
      stats,
      SubscriptionStats {
        received: 5,
        persisted: 1,
        discarded: 1,
        unmatched: 1,
        invalid: 2,
        failed: 0,
      }
    );
    assert_eq!(store.count(Collection::Events, &Filter::All).await.unwrap(), 1);
  }

  #[tokio::test]
  async fn event_cap_ends_the_task() {
    let input = (1..=5).map(|i| line(i, "Matrix", true)).collect::<Vec<_>>().join("\n");
    let store = Arc::new(MemoryStore::new());
    let handle = spawn_subscription(
      CorrelationPipeline::new(store.clone()),
      JsonLinesStream::new("capped", Cursor::new(input.into_bytes())),
      options(Some(2)),
    )
    .unwrap();
    let stats = handle.join().await.unwrap();
    assert_eq!(stats.persisted, 2);
    assert_eq!(store.count(Collection::Events, &Filter::All).await.unwrap(), 2);
  }

  #[tokio::test]
  async fn stop_ends_an_open_stream() {
    let (tx, rx) = mpsc::channel::<Result<SourcedEvent, CatalogError>>(8);
    let store = Arc::new(MemoryStore::new());
    let handle = spawn_subscription(CorrelationPipeline::new(store.clone()), rx, options(None)).unwrap();

    let first: SourcedEvent = serde_json::from_str(&line(1, "Matrix", true)).unwrap();
    tx.send(Ok(first)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    handle.stop();
    let stats = handle.join().await.unwrap();
    assert_eq!(stats.persisted, 1);
    drop(tx);
  }

  #[tokio::test]
  async fn empty_keywords_rejected_before_spawn() {
    let (_tx, rx) = mpsc::channel::<Result<SourcedEvent, CatalogError>>(1);
    let store = Arc::new(MemoryStore::new());
    let result = spawn_subscription(
      CorrelationPipeline::new(store),
      rx,
      SubscriptionOptions {
        keywords: vec!["  ".into()],
        ..Default::default()
      },
    );
    assert!(matches!(result, Err(CatalogError::InvalidArgument { .. })));
  }
}
