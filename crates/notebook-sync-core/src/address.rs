//! Note addresses: a slug plus the audience that owns it.
//!
//! The same slug under `Local` and `Public` names two different notes with
//! independently tracked content.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::slug::{Slug, SlugError};

/// Visibility scope of a note, and therefore its backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    /// Private, stored on the local filesystem.
    Local,
    /// Shared, stored in the versioned sphere.
    Public,
}

impl Audience {
    pub fn as_str(&self) -> &'static str {
        match self {
            Audience::Local => "local",
            Audience::Public => "public",
        }
    }
}

impl fmt::Display for Audience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Audience {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Audience::Local),
            "public" => Ok(Audience::Public),
            other => Err(AddressError::UnknownAudience(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("unknown audience: {0}")]
    UnknownAudience(String),
    #[error("address must look like `<audience>::<slug>`: {0}")]
    Malformed(String),
    #[error(transparent)]
    Slug(#[from] SlugError),
}

/// Logical identity of a note.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub slug: Slug,
    pub audience: Audience,
}

impl Address {
    pub fn new(slug: Slug, audience: Audience) -> Self {
        Self { slug, audience }
    }

    pub fn local(slug: Slug) -> Self {
        Self::new(slug, Audience::Local)
    }

    pub fn public(slug: Slug) -> Self {
        Self::new(slug, Audience::Public)
    }

    /// Same slug, different audience.
    pub fn with_audience(&self, audience: Audience) -> Self {
        Self::new(self.slug.clone(), audience)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.audience, self.slug)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (audience, slug) = s
            .split_once("::")
            .ok_or_else(|| AddressError::Malformed(s.to_string()))?;
        Ok(Self::new(slug.parse()?, audience.parse()?))
    }
}
