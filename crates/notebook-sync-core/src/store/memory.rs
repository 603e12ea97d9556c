//! In-memory store implementations for tests and embedding.
//!
//! State sits behind `std::sync::RwLock`. Keyword search in
//! [`MemoryIndex`] is a case-insensitive term match over title and body.

use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::address::{Address, Audience};
use crate::fingerprint::{now_seconds, seconds_to_datetime, Fingerprint};
use crate::memo::Memo;
use crate::slug::Slug;

use super::{
    FileInfo, IndexEntry, IndexStore, Migrator, NoteStore, SphereStore, StoreError, Version,
};

fn read_lock<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("store lock poisoned"))
}

fn write_lock<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("store lock poisoned"))
}

// ─── Notes ──────────────────────────────────────────────────────────

struct StoredFile {
    text: String,
    modified: i64,
}

/// In-memory [`NoteStore`] that keeps each note as serialized file text.
#[derive(Default)]
pub struct MemoryNoteStore {
    files: RwLock<HashMap<Slug, StoredFile>>,
}

impl MemoryNoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places raw file text with an explicit modification time, bypassing
    /// the write clock.
    pub fn insert_raw(&self, slug: Slug, text: impl Into<String>, modified: i64) -> Result<()> {
        write_lock(&self.files)?.insert(
            slug,
            StoredFile {
                text: text.into(),
                modified,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl NoteStore for MemoryNoteStore {
    async fn list(&self) -> Result<Vec<Slug>> {
        let mut slugs: Vec<Slug> = read_lock(&self.files)?.keys().cloned().collect();
        slugs.sort();
        Ok(slugs)
    }

    async fn info(&self, slug: &Slug) -> Result<Option<FileInfo>> {
        Ok(read_lock(&self.files)?.get(slug).map(|f| FileInfo {
            modified: f.modified,
            size: f.text.len() as u64,
        }))
    }

    async fn read(&self, slug: &Slug) -> Result<Option<Memo>> {
        let files = read_lock(&self.files)?;
        let Some(file) = files.get(slug) else {
            return Ok(None);
        };
        let modified = seconds_to_datetime(file.modified);
        let mut memo = Memo::parse(&file.text, slug, modified)?;
        // The store's own time wins over whatever the header says.
        memo.modified = modified;
        Ok(Some(memo))
    }

    async fn write(&self, slug: &Slug, memo: &Memo) -> Result<()> {
        let mut files = write_lock(&self.files)?;
        let now = now_seconds().timestamp();
        let modified = files
            .get(slug)
            .map_or(now, |previous| previous.modified.max(now));
        files.insert(
            slug.clone(),
            StoredFile {
                text: memo.to_file_string(),
                modified,
            },
        );
        Ok(())
    }

    async fn remove(&self, slug: &Slug) -> Result<()> {
        write_lock(&self.files)?.remove(slug);
        Ok(())
    }
}

// ─── Sphere ─────────────────────────────────────────────────────────

#[derive(Default)]
struct SphereState {
    memos: HashMap<Slug, Memo>,
    version: u64,
    /// `(version, slug)` for every committed touch.
    log: Vec<(u64, Slug)>,
    staged: BTreeSet<Slug>,
    /// Changes waiting on the gateway; applied by the next `sync`.
    remote: Vec<(Slug, Option<Memo>)>,
    offline: bool,
}

impl SphereState {
    fn commit(&mut self) -> u64 {
        if self.staged.is_empty() {
            return self.version;
        }
        self.version += 1;
        let version = self.version;
        let staged = std::mem::take(&mut self.staged);
        self.log.extend(staged.into_iter().map(|slug| (version, slug)));
        version
    }
}

/// In-memory [`SphereStore`] with a simulated gateway.
///
/// Writes are staged until [`save`](SphereStore::save) commits them as a new
/// version. Remote changes queued with [`MemorySphere::stage_remote`] arrive
/// on the next [`sync`](SphereStore::sync).
pub struct MemorySphere {
    identity: String,
    state: RwLock<SphereState>,
}

impl MemorySphere {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            state: RwLock::new(SphereState::default()),
        }
    }

    /// Queues a change as if another device had pushed it to the gateway.
    /// `None` removes the slug.
    pub fn stage_remote(&self, slug: Slug, memo: Option<Memo>) -> Result<()> {
        write_lock(&self.state)?.remote.push((slug, memo));
        Ok(())
    }

    /// Makes `sync` fail until switched back.
    pub fn set_offline(&self, offline: bool) -> Result<()> {
        write_lock(&self.state)?.offline = offline;
        Ok(())
    }
}

#[async_trait]
impl SphereStore for MemorySphere {
    async fn identity(&self) -> Result<String> {
        Ok(self.identity.clone())
    }

    async fn version(&self) -> Result<Version> {
        Ok(read_lock(&self.state)?.version.to_string())
    }

    async fn changes(&self, since: Option<&str>) -> Result<Vec<Slug>> {
        let state = read_lock(&self.state)?;
        let Some(since) = since else {
            let mut all: Vec<Slug> = state.memos.keys().cloned().collect();
            all.sort();
            return Ok(all);
        };
        let since: u64 = since
            .parse()
            .map_err(|_| anyhow!("invalid sphere version: {since}"))?;
        if since > state.version {
            bail!(
                "sphere version {since} is ahead of current version {}",
                state.version
            );
        }
        let touched: BTreeSet<Slug> = state
            .log
            .iter()
            .filter(|(version, _)| *version > since)
            .map(|(_, slug)| slug.clone())
            .collect();
        Ok(touched.into_iter().collect())
    }

    async fn read(&self, slug: &Slug) -> Result<Memo, StoreError> {
        read_lock(&self.state)?
            .memos
            .get(slug)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(slug.clone()))
    }

    async fn write(&self, slug: &Slug, memo: &Memo) -> Result<()> {
        let mut state = write_lock(&self.state)?;
        state.memos.insert(slug.clone(), memo.clone());
        state.staged.insert(slug.clone());
        Ok(())
    }

    async fn remove(&self, slug: &Slug) -> Result<()> {
        let mut state = write_lock(&self.state)?;
        if state.memos.remove(slug).is_some() {
            state.staged.insert(slug.clone());
        }
        Ok(())
    }

    async fn save(&self) -> Result<Version> {
        Ok(write_lock(&self.state)?.commit().to_string())
    }

    async fn sync(&self) -> Result<Version> {
        let mut state = write_lock(&self.state)?;
        if state.offline {
            bail!("gateway unreachable");
        }
        let remote = std::mem::take(&mut state.remote);
        for (slug, memo) in remote {
            match memo {
                Some(memo) => {
                    state.memos.insert(slug.clone(), memo);
                }
                None => {
                    state.memos.remove(&slug);
                }
            }
            state.staged.insert(slug);
        }
        Ok(state.commit().to_string())
    }
}

// ─── Index ──────────────────────────────────────────────────────────

#[derive(Default)]
struct IndexState {
    entries: HashMap<Address, IndexEntry>,
    metadata: HashMap<String, String>,
}

/// In-memory [`IndexStore`] and [`Migrator`].
#[derive(Default)]
pub struct MemoryIndex {
    state: RwLock<IndexState>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_recent(mut entries: Vec<IndexEntry>, limit: usize) -> Vec<IndexEntry> {
    entries.sort_by(|a, b| {
        b.memo
            .modified
            .cmp(&a.memo.modified)
            .then_with(|| a.address.cmp(&b.address))
    });
    entries.truncate(limit);
    entries
}

#[async_trait]
impl IndexStore for MemoryIndex {
    async fn fingerprints(&self, audience: Audience) -> Result<Vec<Fingerprint<Slug>>> {
        Ok(read_lock(&self.state)?
            .entries
            .values()
            .filter(|entry| entry.address.audience == audience)
            .map(IndexEntry::fingerprint)
            .collect())
    }

    async fn get(&self, address: &Address) -> Result<Option<IndexEntry>> {
        Ok(read_lock(&self.state)?.entries.get(address).cloned())
    }

    async fn upsert(&self, entry: &IndexEntry) -> Result<()> {
        write_lock(&self.state)?
            .entries
            .insert(entry.address.clone(), entry.clone());
        Ok(())
    }

    async fn remove(&self, address: &Address) -> Result<()> {
        write_lock(&self.state)?.entries.remove(address);
        Ok(())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<IndexEntry>> {
        let query = query.to_lowercase();
        let terms: Vec<&str> = query.split_whitespace().collect();
        if terms.is_empty() {
            return self.recent(limit).await;
        }
        let matches: Vec<IndexEntry> = read_lock(&self.state)?
            .entries
            .values()
            .filter(|entry| {
                let haystack =
                    format!("{}\n{}", entry.memo.title, entry.memo.body).to_lowercase();
                terms.iter().all(|term| haystack.contains(term))
            })
            .cloned()
            .collect();
        Ok(sorted_recent(matches, limit))
    }

    async fn recent(&self, limit: usize) -> Result<Vec<IndexEntry>> {
        let entries: Vec<IndexEntry> = read_lock(&self.state)?.entries.values().cloned().collect();
        Ok(sorted_recent(entries, limit))
    }

    async fn count(&self) -> Result<u64> {
        Ok(read_lock(&self.state)?.entries.len() as u64)
    }

    async fn read_metadata(&self, key: &str) -> Result<Option<String>> {
        Ok(read_lock(&self.state)?.metadata.get(key).cloned())
    }

    async fn write_metadata_batch(&self, entries: &[(&str, &str)]) -> Result<()> {
        let mut state = write_lock(&self.state)?;
        for &(key, value) in entries {
            state.metadata.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl Migrator for MemoryIndex {
    async fn migrate(&self) -> Result<u32> {
        Ok(1)
    }

    async fn rebuild(&self) -> Result<u32> {
        let mut state = write_lock(&self.state)?;
        state.entries.clear();
        state.metadata.clear();
        Ok(1)
    }
}
