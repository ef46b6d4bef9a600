//! Core types for the catalog engine (stored records, inbound contracts, outcomes).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Geo
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointKind {
  #[default]
  Point,
}

/// GeoJSON point. `coordinates` is `[lng, lat]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
  #[serde(rename = "type", default)]
  pub kind: PointKind,
  pub coordinates: [f64; 2],
}

impl GeoPoint {
  pub fn new(lat: f64, lng: f64) -> Self {
    Self {
      kind: PointKind::Point,
      coordinates: [lng, lat],
    }
  }

  pub fn lat(&self) -> f64 {
    self.coordinates[1]
  }

  pub fn lng(&self) -> f64 {
    self.coordinates[0]
  }

  pub fn is_valid(&self) -> bool {
    let (lat, lng) = (self.lat(), self.lng());
    lat.is_finite() && lng.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng)
  }
}

// ---------------------------------------------------------------------------
// Stored records
// ---------------------------------------------------------------------------

/// A catalog item (movie).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
  #[serde(rename = "_id", deserialize_with = "lenient_id")]
  pub id: String,
  #[serde(default)]
  pub title: String,
  #[serde(default, deserialize_with = "lenient_year", skip_serializing_if = "Option::is_none")]
  pub year: Option<i32>,
  #[serde(default, deserialize_with = "lenient_f64")]
  pub rating: f64,
  #[serde(default, deserialize_with = "lenient_i64")]
  pub votes: i64,
  #[serde(default)]
  pub genre: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub plot: Option<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub releases: Vec<Release>,
  /// Append-only snapshots of correlated events. Grows without bound.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub events: Vec<EventRef>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub annotation: Option<String>,
}

impl Item {
  pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      title: title.into(),
      year: None,
      rating: 0.0,
      votes: 0,
      genre: Vec::new(),
      plot: None,
      releases: Vec::new(),
      events: Vec::new(),
      annotation: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub country: Option<String>,
  pub date: String,
}

/// A raw event (social post) in the event log. `id` doubles as the recency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
  #[serde(rename = "_id")]
  pub id: i64,
  #[serde(default)]
  pub author: String,
  #[serde(default)]
  pub text: String,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub retransmission: bool,
  /// Absent (never null) when no location could be resolved.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub coordinates: Option<GeoPoint>,
  #[serde(default)]
  pub matched_title: String,
}

impl Event {
  /// Snapshot embedded into matching items.
  pub fn snapshot(&self) -> EventRef {
    EventRef {
      author: self.author.clone(),
      text: self.text.clone(),
      retransmission: self.retransmission,
      created_at: self.created_at,
      coordinates: self.coordinates,
    }
  }
}

/// Immutable copy of an event embedded in an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRef {
  #[serde(default)]
  pub author: String,
  #[serde(default)]
  pub text: String,
  #[serde(default)]
  pub retransmission: bool,
  pub created_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub coordinates: Option<GeoPoint>,
}

/// Low-bandwidth projection of a geotagged event for map rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapMarker {
  #[serde(rename = "_id")]
  pub id: i64,
  #[serde(default)]
  pub text: String,
  #[serde(default)]
  pub matched_title: String,
  #[serde(default)]
  pub author: String,
  pub coordinates: GeoPoint,
}

// ---------------------------------------------------------------------------
// Inbound types (stream source contract)
// ---------------------------------------------------------------------------

/// One record from the stream: the post plus the keyword it was tracked under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcedEvent {
  #[serde(default)]
  pub keyword: Option<String>,
  pub status: InboundStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundStatus {
  pub id: i64,
  pub author: String,
  pub text: String,
  /// RFC 3339.
  pub created_at: String,
  #[serde(default)]
  pub retransmission: bool,
  #[serde(default)]
  pub geo: Option<InboundGeo>,
  #[serde(default)]
  pub place: Option<InboundPlace>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InboundGeo {
  pub latitude: f64,
  pub longitude: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundPlace {
  #[serde(default)]
  pub name: Option<String>,
  /// Corners as GeoJSON `[lng, lat]` pairs.
  #[serde(default)]
  pub bounding_box: Vec<[f64; 2]>,
}

/// Item descriptor from the external catalog feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalItem {
  #[serde(deserialize_with = "lenient_id")]
  pub id: String,
  pub title: String,
  #[serde(default)]
  pub genre_ids: Vec<i64>,
  #[serde(default)]
  pub overview: Option<String>,
  #[serde(default)]
  pub vote_average: Option<f64>,
  #[serde(default)]
  pub vote_count: Option<i64>,
  #[serde(default)]
  pub release_date: Option<String>,
}

// ---------------------------------------------------------------------------
// Pipeline outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
  Received,
  Classified,
  Located,
  Persisted,
  Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationSource {
  Precise,
  PlaceBoundingBox,
  Unresolved,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
  Persisted {
    event_id: i64,
    matched_title: String,
    location: LocationSource,
    items_updated: u64,
    item_created: bool,
  },
  /// Unlocated event dropped in ignore-untagged mode.
  Discarded { event_id: i64, matched_title: String },
  /// No subscription keyword applies to the event.
  Unmatched { event_id: i64 },
}

impl IngestOutcome {
  pub fn stage(&self) -> Stage {
    match self {
      Self::Persisted { .. } => Stage::Persisted,
      Self::Discarded { .. } => Stage::Discarded,
      Self::Unmatched { .. } => Stage::Received,
    }
  }
}

// ---------------------------------------------------------------------------
// Lenient field decoding (stored documents may predate the typed model)
// ---------------------------------------------------------------------------

fn lenient_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
  match Value::deserialize(d)? {
    Value::String(s) => Ok(s),
    Value::Number(n) => Ok(n.to_string()),
    other => Err(serde::de::Error::custom(format!("unsupported id: {}", other))),
  }
}

fn lenient_year<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i32>, D::Error> {
  Ok(match Option::<Value>::deserialize(d)? {
    Some(Value::Number(n)) => n.as_i64().and_then(|y| i32::try_from(y).ok()),
    Some(Value::String(s)) => s.trim().get(..4).and_then(|p| p.parse().ok()),
    _ => None,
  })
}

fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
  Ok(match Option::<Value>::deserialize(d)? {
    Some(Value::Number(n)) => n.as_f64().unwrap_or_default(),
    Some(Value::String(s)) => s.trim().parse().unwrap_or_default(),
    _ => 0.0,
  })
}

fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
  Ok(match Option::<Value>::deserialize(d)? {
    Some(Value::Number(n)) => n
      .as_i64()
      .or_else(|| n.as_f64().map(|f| f as i64))
      .unwrap_or_default(),
    Some(Value::String(s)) => s.trim().parse().unwrap_or_default(),
    _ => 0,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn item_tolerates_loose_legacy_fields() {
    let item: Item = serde_json::from_value(json!({
      "_id": 603,
      "title": "The Matrix",
      "year": "1999",
      "rating": "",
      "votes": 1200.0,
      "actors": ["Keanu Reeves"],
    }))
    .unwrap();
    assert_eq!(item.id, "603");
    assert_eq!(item.year, Some(1999));
    assert_eq!(item.rating, 0.0);
    assert_eq!(item.votes, 1200);
    assert!(item.genre.is_empty());
    assert!(item.events.is_empty());
  }

  #[test]
  fn event_without_location_omits_coordinates_field() {
    let event = Event {
      id: 1,
      author: "neo".into(),
      text: "whoa".into(),
      created_at: Utc::now(),
      retransmission: false,
      coordinates: None,
      matched_title: "Matrix".into(),
    };
    let doc = serde_json::to_value(&event).unwrap();
    assert!(doc.get("coordinates").is_none());
  }

  #[test]
  fn geo_point_is_lng_lat_geojson() {
    let p = GeoPoint::new(40.0, -74.0);
    assert_eq!(
      serde_json::to_value(p).unwrap(),
      json!({"type": "Point", "coordinates": [-74.0, 40.0]})
    );
    assert!(p.is_valid());
    assert!(!GeoPoint::new(91.0, 0.0).is_valid());
  }

  #[test]
  fn outcome_serializes_with_tag() {
    let out = IngestOutcome::Unmatched { event_id: 9 };
    assert_eq!(
      serde_json::to_value(&out).unwrap(),
      json!({"outcome": "unmatched", "event_id": 9})
    );
    assert_eq!(out.stage(), Stage::Received);
  }
}
