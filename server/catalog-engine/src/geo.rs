//! Spherical distance helpers for radius queries.

use crate::types::GeoPoint;

/// Mean earth radius in meters (same sphere the 2d-sphere index assumes).
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Radius queries take kilometers at the API and meters at the store.
pub fn km_to_meters(km: f64) -> f64 {
  km * 1000.0
}

/// Great-circle distance in meters.
pub fn haversine_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
  let (lat1, lat2) = (a.lat().to_radians(), b.lat().to_radians());
  let dlat = lat2 - lat1;
  let dlng = (b.lng() - a.lng()).to_radians();
  let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
  2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}
