//! Collaborator contracts for the three stores the reconciler keeps in step.
//!
//! | Trait | Role | Source of truth for |
//! |-------|------|---------------------|
//! | [`NoteStore`] | leader | local notes (filesystem) |
//! | [`SphereStore`] | leader | public notes (versioned sphere) |
//! | [`IndexStore`] | follower | nothing; a rebuildable search projection |
//!
//! All operations are async (via `async-trait`) and implementations must be
//! `Send + Sync`. In-memory implementations live in [`memory`].

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::address::{Address, Audience};
use crate::fingerprint::{datetime_seconds, Fingerprint};
use crate::memo::Memo;
use crate::slug::Slug;

/// Opaque sphere version token.
pub type Version = String;

/// Filesystem-style metadata for one stored note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    /// Unix seconds, rounded to the nearest second.
    pub modified: i64,
    pub size: u64,
}

/// Failure reading from a store where absence is a distinct outcome.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(Slug),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Local note storage, keyed by slug.
///
/// `write` must leave `info().modified` at or after the previous value.
#[async_trait]
pub trait NoteStore: Send + Sync {
    async fn list(&self) -> Result<Vec<Slug>>;

    /// Best-effort metadata read. `None` when the note does not exist.
    async fn info(&self, slug: &Slug) -> Result<Option<FileInfo>>;

    /// The returned memo's `modified` is `info().modified`, whatever the
    /// stored header says.
    async fn read(&self, slug: &Slug) -> Result<Option<Memo>>;

    async fn write(&self, slug: &Slug, memo: &Memo) -> Result<()>;

    /// Removing a missing note is not an error.
    async fn remove(&self, slug: &Slug) -> Result<()>;
}

/// Versioned store of public notes, synchronized with a remote gateway.
#[async_trait]
pub trait SphereStore: Send + Sync {
    async fn identity(&self) -> Result<String>;

    async fn version(&self) -> Result<Version>;

    /// Slugs touched after `since`, including removed ones. `None` lists
    /// every slug currently in the sphere.
    async fn changes(&self, since: Option<&str>) -> Result<Vec<Slug>>;

    /// Fails with [`StoreError::NotFound`] when the slug has no content.
    async fn read(&self, slug: &Slug) -> Result<Memo, StoreError>;

    async fn write(&self, slug: &Slug, memo: &Memo) -> Result<()>;

    async fn remove(&self, slug: &Slug) -> Result<()>;

    /// Commits staged writes and returns the new version.
    async fn save(&self) -> Result<Version>;

    /// Pushes and pulls against the gateway and returns the resulting version.
    async fn sync(&self) -> Result<Version>;
}

/// One indexed note: its address, content, and the size its leader reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    pub address: Address,
    pub memo: Memo,
    pub size: u64,
}

impl IndexEntry {
    pub fn new(address: Address, memo: Memo, size: u64) -> Self {
        Self {
            address,
            memo,
            size,
        }
    }

    /// The fingerprint this entry was stamped with.
    pub fn fingerprint(&self) -> Fingerprint<Slug> {
        Fingerprint::new(
            self.address.slug.clone(),
            datetime_seconds(self.memo.modified),
            self.size,
        )
    }
}

/// Derived search index over both audiences.
///
/// `upsert` must apply the content and its fingerprint fields as one atomic
/// unit so readers never see a new body with a stale modified time.
#[async_trait]
pub trait IndexStore: Send + Sync {
    async fn fingerprints(&self, audience: Audience) -> Result<Vec<Fingerprint<Slug>>>;

    async fn get(&self, address: &Address) -> Result<Option<IndexEntry>>;

    async fn upsert(&self, entry: &IndexEntry) -> Result<()>;

    /// Removing a missing entry is not an error.
    async fn remove(&self, address: &Address) -> Result<()>;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<IndexEntry>>;

    /// Most recently modified entries first.
    async fn recent(&self, limit: usize) -> Result<Vec<IndexEntry>>;

    async fn count(&self) -> Result<u64>;

    async fn read_metadata(&self, key: &str) -> Result<Option<String>>;

    /// Writes every pair or none of them.
    async fn write_metadata_batch(&self, entries: &[(&str, &str)]) -> Result<()>;

    async fn write_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.write_metadata_batch(&[(key, value)]).await
    }

    async fn fingerprint(&self, address: &Address) -> Result<Option<Fingerprint<Slug>>> {
        Ok(self.get(address).await?.map(|entry| entry.fingerprint()))
    }
}

/// Schema management for an index.
#[async_trait]
pub trait Migrator: Send + Sync {
    /// Applies pending migrations atomically and returns the schema version.
    async fn migrate(&self) -> Result<u32>;

    /// Drops all index data and migrates from scratch.
    async fn rebuild(&self) -> Result<u32>;
}
