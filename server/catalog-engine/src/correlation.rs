//! Match inbound posts to the titles a subscription tracks.

use crate::types::SourcedEvent;

/// Title a post belongs to, spelled the way the subscription spells it.
///
/// An explicit source keyword must be one of `keywords` (ignoring case). Without one,
/// the first keyword found in the post text is used.
pub fn classify(sourced: &SourcedEvent, keywords: &[String]) -> Option<String> {
  if let Some(kw) = sourced.keyword.as_deref() {
    let kw = kw.trim().to_lowercase();
    return keywords.iter().find(|k| k.to_lowercase() == kw).cloned();
  }

  let text = sourced.status.text.to_lowercase();
  keywords
    .iter()
    .find(|k| !k.trim().is_empty() && text.contains(&k.to_lowercase()))
    .cloned()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::InboundStatus;

  fn sourced(keyword: Option<&str>, text: &str) -> SourcedEvent {
    SourcedEvent {
      keyword: keyword.map(str::to_string),
      status: InboundStatus {
        id: 1,
        author: "a".into(),
        text: text.into(),
        created_at: "2024-01-01T00:00:00Z".into(),
        retransmission: false,
        geo: None,
        place: None,
      },
    }
  }

  fn keywords() -> Vec<String> {
    vec!["Matrix".into(), "Star Wars".into()]
  }

  #[test]
  fn explicit_keyword_uses_subscription_spelling() {
    assert_eq!(classify(&sourced(Some("matrix"), "anything"), &keywords()).as_deref(), Some("Matrix"));
    assert_eq!(classify(&sourced(Some("Alien"), "matrix"), &keywords()), None);
  }

  #[test]
  fn text_scan_picks_first_tracked_keyword() {
    let hit = classify(&sourced(None, "star wars then the MATRIX"), &keywords());
    assert_eq!(hit.as_deref(), Some("Matrix"));
    assert_eq!(classify(&sourced(None, "nothing here"), &keywords()), None);
  }
}
