//! Routing keys and topic patterns for topic exchanges.
//!
//! A routing key is a dot-separated list of words (`user.created`). A topic
//! pattern is a dot-separated list of words and wildcards, where `*` matches
//! exactly one word and `#` matches zero or more words (`user.#`,
//! `*.created`). Matching follows AMQP 0-9-1 topic exchange semantics.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum length of a routing key or pattern in bytes (AMQP `shortstr`).
pub const MAX_KEY_LEN: usize = 255;

/// Errors produced when parsing routing keys or topic patterns.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("routing key must not be empty")]
    Empty,
    #[error("routing key exceeds {MAX_KEY_LEN} bytes: {len}")]
    TooLong { len: usize },
    #[error("empty segment in {input:?}")]
    EmptySegment { input: String },
    #[error("wildcard {wildcard:?} not allowed in routing key {input:?}")]
    WildcardInKey { input: String, wildcard: char },
    #[error("wildcard must occupy a whole segment in pattern {input:?}")]
    PartialWildcard { input: String },
}

fn check_common(input: &str) -> Result<(), RoutingError> {
    if input.is_empty() {
        return Err(RoutingError::Empty);
    }
    if input.len() > MAX_KEY_LEN {
        return Err(RoutingError::TooLong { len: input.len() });
    }
    if input.split('.').any(str::is_empty) {
        return Err(RoutingError::EmptySegment {
            input: input.to_string(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// RoutingKey
// ---------------------------------------------------------------------------

/// A validated routing key such as `user.created`.
///
/// Keys are non-empty, at most [`MAX_KEY_LEN`] bytes, contain no empty
/// segments and no wildcard characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoutingKey(String);

impl RoutingKey {
    /// Parses and validates a routing key.
    ///
    /// # Errors
    ///
    /// Returns a [`RoutingError`] if the key is empty, too long, has an empty
    /// segment, or contains `*` / `#`.
    pub fn new(key: impl Into<String>) -> Result<Self, RoutingError> {
        let key = key.into();
        check_common(&key)?;
        if let Some(wildcard) = key.chars().find(|c| *c == '*' || *c == '#') {
            return Err(RoutingError::WildcardInKey {
                input: key,
                wildcard,
            });
        }
        Ok(Self(key))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterates over the dot-separated words of the key.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoutingKey {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RoutingKey {
    type Error = RoutingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RoutingKey> for String {
    fn from(key: RoutingKey) -> Self {
        key.0
    }
}

impl AsRef<str> for RoutingKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// TopicPattern
// ---------------------------------------------------------------------------

/// One segment of a [`TopicPattern`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// A literal word that must match exactly.
    Word(String),
    /// `*`: exactly one word.
    Star,
    /// `#`: zero or more words.
    Hash,
}

/// A validated topic binding pattern such as `user.#` or `*.created`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Parses a topic pattern.
    ///
    /// # Errors
    ///
    /// Returns a [`RoutingError`] if the pattern is empty, too long, has an
    /// empty segment, or a wildcard that shares its segment with other text
    /// (`user*`).
    pub fn new(pattern: impl Into<String>) -> Result<Self, RoutingError> {
        let raw = pattern.into();
        check_common(&raw)?;
        let mut segments = Vec::new();
        for word in raw.split('.') {
            let segment = match word {
                "*" => Segment::Star,
                "#" => Segment::Hash,
                w if w.contains('*') || w.contains('#') => {
                    return Err(RoutingError::PartialWildcard { input: raw });
                }
                w => Segment::Word(w.to_string()),
            };
            segments.push(segment);
        }
        Ok(Self { raw, segments })
    }

    /// Pattern that matches exactly one routing key.
    #[must_use]
    pub fn exact(key: &RoutingKey) -> Self {
        Self {
            raw: key.as_str().to_string(),
            segments: key.segments().map(|w| Segment::Word(w.to_string())).collect(),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Returns `true` if the pattern contains no `*` or `#`.
    #[must_use]
    pub fn is_exact(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Word(_)))
    }

    /// Returns `true` if `key` is routed to a queue bound with this pattern.
    #[must_use]
    pub fn matches(&self, key: &RoutingKey) -> bool {
        let words: Vec<&str> = key.segments().collect();
        match_segments(&self.segments, &words)
    }
}

fn match_segments(pattern: &[Segment], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((Segment::Hash, rest)) => {
            // Collapse consecutive hashes; `#.#` behaves like `#`.
            if matches!(rest.first(), Some(Segment::Hash)) {
                return match_segments(rest, words);
            }
            (0..=words.len()).any(|skip| match_segments(rest, &words[skip..]))
        }
        Some((Segment::Star, rest)) => !words.is_empty() && match_segments(rest, &words[1..]),
        Some((Segment::Word(w), rest)) => {
            words.first() == Some(&w.as_str()) && match_segments(rest, &words[1..])
        }
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for TopicPattern {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TopicPattern {
    type Error = RoutingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TopicPattern> for String {
    fn from(pattern: TopicPattern) -> Self {
        pattern.raw
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
