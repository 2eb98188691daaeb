//! # Subjects and Subject Patterns
//!
//! Hierarchical `.`-separated routing keys and the wildcard patterns that
//! streams and handlers bind to.
//!
//! ## Wildcards
//!
//! - `*` matches exactly one token
//! - `>` matches one or more trailing tokens and is only valid last
//!
//! ## Specificity
//!
//! When several patterns match the same subject, the winner is the one with
//! the greatest [`Specificity`]: more literal tokens first, then patterns
//! without a `>` tail, then longer patterns.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::TypeError;

const SEPARATOR: char = '.';
const SINGLE_WILDCARD: &str = "*";
const TAIL_WILDCARD: &str = ">";

/// A concrete subject a message is published to, e.g. `predictions.normal.AAPL`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subject(String);

impl Subject {
    /// Parse and validate a subject.
    pub fn new(raw: impl Into<String>) -> Result<Self, TypeError> {
        let raw = raw.into();
        validate_tokens(&raw).map_err(|reason| TypeError::InvalidSubject {
            subject: raw.clone(),
            reason,
        })?;
        if raw
            .split(SEPARATOR)
            .any(|t| t == SINGLE_WILDCARD || t == TAIL_WILDCARD)
        {
            return Err(TypeError::InvalidSubject {
                subject: raw,
                reason: "wildcards are not allowed in a subject".to_string(),
            });
        }
        Ok(Self(raw))
    }

    /// The subject as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the `.`-separated tokens.
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR)
    }

    /// Token at `index`, if present.
    #[must_use]
    pub fn token(&self, index: usize) -> Option<&str> {
        self.tokens().nth(index)
    }

    /// Prefix this subject with additional tokens (`dlq` + `orders.created`
    /// becomes `dlq.orders.created`).
    pub fn prefixed(&self, prefix: &str) -> Result<Self, TypeError> {
        Self::new(format!("{prefix}{SEPARATOR}{}", self.0))
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Subject {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for Subject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Subject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

/// One token of a parsed pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PatternToken {
    Literal(String),
    Single,
    Tail,
}

/// A subject pattern such as `market.data.*` or `explanations.>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubjectPattern {
    raw: String,
    tokens: Vec<PatternToken>,
}

/// Ordering key used to choose between several matching patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Specificity {
    /// Number of literal (non-wildcard) tokens.
    pub literals: usize,
    /// True when the pattern has no `>` tail.
    pub bounded: bool,
    /// Total number of tokens.
    pub tokens: usize,
}

impl Ord for Specificity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.literals
            .cmp(&other.literals)
            .then(self.bounded.cmp(&other.bounded))
            .then(self.tokens.cmp(&other.tokens))
    }
}

impl PartialOrd for Specificity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl SubjectPattern {
    /// Parse and validate a pattern.
    pub fn new(raw: impl Into<String>) -> Result<Self, TypeError> {
        let raw = raw.into();
        validate_tokens(&raw).map_err(|reason| TypeError::InvalidPattern {
            pattern: raw.clone(),
            reason,
        })?;

        let parts: Vec<&str> = raw.split(SEPARATOR).collect();
        let last = parts.len() - 1;
        let mut tokens = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let token = match *part {
                SINGLE_WILDCARD => PatternToken::Single,
                TAIL_WILDCARD if i == last => PatternToken::Tail,
                TAIL_WILDCARD => {
                    return Err(TypeError::InvalidPattern {
                        pattern: raw.clone(),
                        reason: "'>' is only allowed as the last token".to_string(),
                    })
                }
                literal if literal.contains('*') || literal.contains('>') => {
                    return Err(TypeError::InvalidPattern {
                        pattern: raw.clone(),
                        reason: format!("wildcard must be a whole token, got '{literal}'"),
                    })
                }
                literal => PatternToken::Literal(literal.to_string()),
            };
            tokens.push(token);
        }

        Ok(Self { raw, tokens })
    }

    /// The pattern as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True if the pattern contains no wildcards.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        self.tokens
            .iter()
            .all(|t| matches!(t, PatternToken::Literal(_)))
    }

    /// Does `subject` match this pattern?
    #[must_use]
    pub fn matches(&self, subject: &Subject) -> bool {
        let subject_tokens: Vec<&str> = subject.tokens().collect();
        let mut i = 0;
        for token in &self.tokens {
            match token {
                PatternToken::Tail => return subject_tokens.len() > i,
                PatternToken::Single => {
                    if i >= subject_tokens.len() {
                        return false;
                    }
                }
                PatternToken::Literal(lit) => {
                    if subject_tokens.get(i) != Some(&lit.as_str()) {
                        return false;
                    }
                }
            }
            i += 1;
        }
        i == subject_tokens.len()
    }

    /// Is there at least one subject matched by both patterns?
    #[must_use]
    pub fn overlaps(&self, other: &SubjectPattern) -> bool {
        let (a, b) = (&self.tokens, &other.tokens);
        let mut i = 0;
        loop {
            match (a.get(i), b.get(i)) {
                (None, None) => return true,
                // A `>` tail consumes at least one token from the other side.
                (Some(PatternToken::Tail), Some(_)) | (Some(_), Some(PatternToken::Tail)) => {
                    return true
                }
                (Some(PatternToken::Tail), None) | (None, Some(PatternToken::Tail)) => {
                    return false
                }
                (None, Some(_)) | (Some(_), None) => return false,
                (Some(PatternToken::Literal(x)), Some(PatternToken::Literal(y))) => {
                    if x != y {
                        return false;
                    }
                }
                _ => {}
            }
            i += 1;
        }
    }

    /// Does every subject matched by `other` also match `self`?
    ///
    /// Used to find the stream that can serve a consumer's filter pattern.
    #[must_use]
    pub fn covers(&self, other: &SubjectPattern) -> bool {
        let (a, b) = (&self.tokens, &other.tokens);
        for (i, token) in a.iter().enumerate() {
            match (token, b.get(i)) {
                (PatternToken::Tail, Some(_)) => return true,
                (_, None) => return false,
                (PatternToken::Single, Some(PatternToken::Tail)) => return false,
                (PatternToken::Single, Some(_)) => {}
                (PatternToken::Literal(x), Some(PatternToken::Literal(y))) if x == y => {}
                (PatternToken::Literal(_), Some(_)) => return false,
            }
        }
        a.len() == b.len()
    }

    /// Ordering key for choosing among matching patterns.
    #[must_use]
    pub fn specificity(&self) -> Specificity {
        Specificity {
            literals: self
                .tokens
                .iter()
                .filter(|t| matches!(t, PatternToken::Literal(_)))
                .count(),
            bounded: !matches!(self.tokens.last(), Some(PatternToken::Tail)),
            tokens: self.tokens.len(),
        }
    }
}

impl From<&Subject> for SubjectPattern {
    fn from(subject: &Subject) -> Self {
        Self {
            raw: subject.as_str().to_string(),
            tokens: subject
                .tokens()
                .map(|t| PatternToken::Literal(t.to_string()))
                .collect(),
        }
    }
}

impl fmt::Display for SubjectPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for SubjectPattern {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for SubjectPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for SubjectPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

fn validate_tokens(raw: &str) -> Result<(), String> {
    if raw.is_empty() {
        return Err("must not be empty".to_string());
    }
    if raw.chars().any(char::is_whitespace) {
        return Err("must not contain whitespace".to_string());
    }
    if raw.split(SEPARATOR).any(str::is_empty) {
        return Err("must not contain empty tokens".to_string());
    }
    Ok(())
}
