//! Full-text query parsing and scoring.
//!
//! Syntax: bare words are OR-ed, `-word` excludes, `"a phrase"` must appear.
//! Matching is case-insensitive on alphanumeric tokens.

/// Parsed text query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextQuery {
  pub terms: Vec<String>,
  pub negated: Vec<String>,
  /// Each phrase as its token sequence.
  pub phrases: Vec<Vec<String>>,
}

/// Lowercase alphanumeric tokens.
pub fn tokenize(s: &str) -> Vec<String> {
  s.split(|c: char| !c.is_alphanumeric())
    .filter(|t| !t.is_empty())
    .map(|t| t.to_lowercase())
    .collect()
}

impl TextQuery {
  pub fn parse(query: &str) -> Self {
    let mut out = Self::default();
    let mut rest = query;

    while let Some(start) = rest.find('"') {
      let (before, after) = rest.split_at(start);
      out.push_words(before);
      let after = &after[1..];
      match after.find('"') {
        Some(end) => {
          let phrase = tokenize(&after[..end]);
          if !phrase.is_empty() {
            out.phrases.push(phrase);
          }
          rest = &after[end + 1..];
        }
        None => {
          out.push_words(after);
          rest = "";
        }
      }
    }
    out.push_words(rest);
    out
  }

  fn push_words(&mut self, chunk: &str) {
    for word in chunk.split_whitespace() {
      if let Some(neg) = word.strip_prefix('-') {
        self.negated.extend(tokenize(neg));
      } else {
        self.terms.extend(tokenize(word));
      }
    }
  }

  /// True when nothing positive can ever match.
  pub fn is_empty(&self) -> bool {
    self.terms.is_empty() && self.phrases.is_empty()
  }

  /// Score the concatenated indexed fields; `None` when the document does not match.
  pub fn score(&self, fields: &[&str]) -> Option<f64> {
    if self.is_empty() {
      return None;
    }
    let tokens: Vec<String> = fields.iter().flat_map(|f| tokenize(f)).collect();
    if tokens.is_empty() {
      return None;
    }
    if self.negated.iter().any(|n| tokens.contains(n)) {
      return None;
    }
    for phrase in &self.phrases {
      if !tokens.windows(phrase.len()).any(|w| w == phrase.as_slice()) {
        return None;
      }
    }

    let hits = self
      .terms
      .iter()
      .map(|t| tokens.iter().filter(|tok| *tok == t).count())
      .sum::<usize>();
    if !self.terms.is_empty() && hits == 0 && self.phrases.is_empty() {
      return None;
    }
    let phrase_hits = self.phrases.len();
    Some((hits + phrase_hits) as f64 / tokens.len() as f64)
  }

  /// Postgres `to_tsquery` expression equivalent to this query.
  pub fn to_tsquery(&self) -> String {
    let mut parts = Vec::new();
    if !self.terms.is_empty() {
      parts.push(format!("({})", self.terms.join(" | ")));
    }
    for phrase in &self.phrases {
      parts.push(format!("({})", phrase.join(" <-> ")));
    }
    for neg in &self.negated {
      parts.push(format!("!{}", neg));
    }
    parts.join(" & ")
  }
}
