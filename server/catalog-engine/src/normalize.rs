//! Validate inbound posts and resolve their location.

use chrono::{DateTime, Utc};

use crate::error::CatalogError;
use crate::types::*;

/// Parse and validate an inbound post into an event tagged with `matched_title`.
///
/// The returned event carries coordinates only when a location was resolved.
pub fn normalize(raw: &InboundStatus, matched_title: &str) -> Result<(Event, LocationSource), CatalogError> {
  if raw.id <= 0 {
    return Err(CatalogError::invalid("id", "must be positive"));
  }
  if raw.author.trim().is_empty() {
    return Err(CatalogError::invalid("author", "must not be empty"));
  }
  if raw.text.trim().is_empty() {
    return Err(CatalogError::invalid("text", "must not be empty"));
  }
  let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&raw.created_at)
    .map_err(|e| CatalogError::invalid("created_at", &format!("invalid RFC3339: {}", e)))?
    .with_timezone(&Utc);

  let (coordinates, source) = locate(raw)?;

  let event = Event {
    id: raw.id,
    author: raw.author.clone(),
    text: raw.text.clone(),
    created_at,
    retransmission: raw.retransmission,
    coordinates,
    matched_title: matched_title.to_string(),
  };
  Ok((event, source))
}

/// Precise coordinate, else the first corner of the place bounding box, else nothing.
pub fn locate(raw: &InboundStatus) -> Result<(Option<GeoPoint>, LocationSource), CatalogError> {
  if let Some(geo) = raw.geo {
    let point = GeoPoint::new(geo.latitude, geo.longitude);
    if !point.is_valid() {
      return Err(CatalogError::invalid("geo", "latitude or longitude out of range"));
    }
    return Ok((Some(point), LocationSource::Precise));
  }

  let corner = raw.place.as_ref().and_then(|p| p.bounding_box.first());
  if let Some(&[lng, lat]) = corner {
    let point = GeoPoint::new(lat, lng);
    if !point.is_valid() {
      return Err(CatalogError::invalid(
        "place.bounding_box",
        "corner out of range",
      ));
    }
    return Ok((Some(point), LocationSource::PlaceBoundingBox));
  }

  Ok((None, LocationSource::Unresolved))
}
