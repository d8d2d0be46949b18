//! # Keyword Value Objects
//!
//! A keyword is an opaque, non-empty search term. The working set of a run is a
//! `KeywordSet` (ordered set, so iteration order is stable across runs), and a
//! `KeywordGroup` is the ordered slice of that set handed to a single worker.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Keyword construction errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeywordError {
    #[error("Keyword must not be empty")]
    Empty,
}

/// A single search keyword, trimmed and guaranteed non-empty
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Keyword(String);

impl Keyword {
    /// Creates a keyword from raw input, trimming surrounding whitespace
    ///
    /// # Errors
    /// Returns `KeywordError::Empty` if nothing is left after trimming
    pub fn new(raw: impl AsRef<str>) -> Result<Self, KeywordError> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(KeywordError::Empty);
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Keyword {
    type Error = KeywordError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Keyword> for String {
    fn from(keyword: Keyword) -> Self {
        keyword.0
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deduplicated keyword working set with deterministic iteration order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordSet(BTreeSet<Keyword>);

impl KeywordSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from raw lines, silently skipping blank entries
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        lines
            .into_iter()
            .filter_map(|line| Keyword::new(line).ok())
            .collect()
    }

    /// Reads a newline separated keyword file; duplicates and blank lines collapse
    pub async fn from_file(path: &Path) -> std::io::Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(Self::from_lines(content.lines()))
    }

    /// Returns true if the keyword was not present yet
    pub fn insert(&mut self, keyword: Keyword) -> bool {
        self.0.insert(keyword)
    }

    #[must_use]
    pub fn contains(&self, keyword: &Keyword) -> bool {
        self.0.contains(keyword)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Keyword> {
        self.0.iter()
    }
}

impl FromIterator<Keyword> for KeywordSet {
    fn from_iter<T: IntoIterator<Item = Keyword>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<Keyword> for KeywordSet {
    fn extend<T: IntoIterator<Item = Keyword>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}

impl IntoIterator for KeywordSet {
    type Item = Keyword;
    type IntoIter = std::collections::btree_set::IntoIter<Keyword>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a KeywordSet {
    type Item = &'a Keyword;
    type IntoIter = std::collections::btree_set::Iter<'a, Keyword>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Ordered keywords assigned to exactly one worker. Never contains placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordGroup(Vec<Keyword>);

impl KeywordGroup {
    #[must_use]
    pub const fn new(keywords: Vec<Keyword>) -> Self {
        Self(keywords)
    }

    #[must_use]
    pub fn keywords(&self) -> &[Keyword] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Keyword> {
        self.0.iter()
    }
}

impl<'a> IntoIterator for &'a KeywordGroup {
    type Item = &'a Keyword;
    type IntoIter = std::slice::Iter<'a, Keyword>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
