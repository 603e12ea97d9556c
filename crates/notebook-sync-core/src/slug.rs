//! Note slugs.
//!
//! A [`Slug`] is the file- and URL-safe name of a note. Allowed characters
//! are lowercase ASCII letters, digits, `-`, `_` and `/`; a `/` separates
//! path segments and may not lead, trail or repeat. [`Slug::new`] rejects
//! anything else. [`Slug::from_title`] is the explicit formatter for turning
//! free text into a slug.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_SLUG_LEN: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlugError {
    #[error("slug is empty")]
    Empty,
    #[error("slug exceeds {MAX_SLUG_LEN} characters")]
    TooLong,
    #[error("slug contains invalid character {ch:?}: {slug}")]
    InvalidChar { slug: String, ch: char },
    #[error("slug has an empty path segment: {0}")]
    EmptySegment(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Slug(String);

impl Slug {
    pub fn new(value: impl Into<String>) -> Result<Self, SlugError> {
        let value = value.into();
        validate(&value)?;
        Ok(Self(value))
    }

    /// Formats free text into a slug.
    ///
    /// Lowercases, collapses runs of whitespace and punctuation into `-`, and
    /// drops anything outside the allowed set. Returns `None` when nothing
    /// usable remains.
    pub fn from_title(text: &str) -> Option<Self> {
        let mut out = String::with_capacity(text.len());
        let mut pending_dash = false;
        for ch in text.trim().chars().flat_map(char::to_lowercase) {
            if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' {
                if pending_dash && !out.is_empty() {
                    out.push('-');
                }
                pending_dash = false;
                out.push(ch);
            } else if ch.is_whitespace() || ch == '-' || ch.is_ascii_punctuation() {
                pending_dash = true;
            }
        }
        out.truncate(MAX_SLUG_LEN);
        let trimmed = out.trim_end_matches('-');
        Self::new(trimmed).ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Human-readable title derived from the last path segment.
    pub fn to_title(&self) -> String {
        let last = self.0.rsplit('/').next().unwrap_or(&self.0);
        let spaced = last.replace(['-', '_'], " ");
        let mut chars = spaced.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }
}

fn validate(value: &str) -> Result<(), SlugError> {
    if value.is_empty() {
        return Err(SlugError::Empty);
    }
    if value.len() > MAX_SLUG_LEN {
        return Err(SlugError::TooLong);
    }
    if let Some(ch) = value
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '/')))
    {
        return Err(SlugError::InvalidChar {
            slug: value.to_string(),
            ch,
        });
    }
    if value.split('/').any(str::is_empty) {
        return Err(SlugError::EmptySegment(value.to_string()));
    }
    Ok(())
}

impl fmt::Display for Slug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Slug {
    type Err = SlugError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Slug {
    type Error = SlugError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Slug> for String {
    fn from(value: Slug) -> Self {
        value.0
    }
}

impl AsRef<str> for Slug {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
