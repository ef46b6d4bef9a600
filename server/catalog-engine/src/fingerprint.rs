//! Stable, hash-derived identifiers and placeholders.

/// Id for a stub item created from a title alone: `t-` + 16 hex chars of blake3(title).
pub fn stub_item_id(title: &str) -> String {
  let hex = blake3::hash(title.as_bytes()).to_hex();
  format!("t-{}", &hex[..16])
}

/// Vote count in `0..ceiling` for items the feed sent without one.
///
/// Derived from the item id so retries synthesize the same record.
pub fn placeholder_votes(id: &str, ceiling: u64) -> i64 {
  if ceiling == 0 {
    return 0;
  }
  let hash = blake3::hash(id.as_bytes());
  let mut head = [0u8; 8];
  head.copy_from_slice(&hash.as_bytes()[..8]);
  (u64::from_le_bytes(head) % ceiling) as i64
}
