//! Write-through note operations.
//!
//! [`NoteService`] routes every mutation through the [`AddressRouter`] to
//! the store that owns the address, then mirrors the result into the index
//! using the fingerprint the store reported after the write. The index is a
//! projection: if mirroring fails the store write stands and the next
//! reconciliation pass repairs the index.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use notebook_sync_core::router::{RouterError, RouterResult};
use notebook_sync_core::store::{IndexEntry, IndexStore};
use notebook_sync_core::{Address, AddressRouter, Audience, Memo, Slug};

#[derive(Clone)]
pub struct NoteService {
    router: AddressRouter,
    index: Arc<dyn IndexStore>,
}

impl NoteService {
    pub fn new(router: AddressRouter, index: Arc<dyn IndexStore>) -> Self {
        Self { router, index }
    }

    pub fn router(&self) -> &AddressRouter {
        &self.router
    }

    /// Finds the address a bare slug refers to. Public wins over local.
    pub async fn resolve(&self, slug: &Slug) -> RouterResult<Option<Address>> {
        self.router.resolve(slug).await
    }

    pub async fn exists(&self, address: &Address) -> RouterResult<bool> {
        self.router.exists(address).await
    }

    pub async fn read_memo(&self, address: &Address) -> RouterResult<Memo> {
        self.router.read(address).await
    }

    /// Writes `memo` and indexes it. The caller's `modified` is ignored.
    pub async fn write_memo(&self, address: &Address, memo: Memo) -> RouterResult<IndexEntry> {
        let entry = self.router.write(address, memo).await?;
        self.mirror_upsert(&entry).await;
        Ok(entry)
    }

    /// Deletes the note and its index entry. Deleting a missing note is a
    /// no-op.
    pub async fn delete_memo(&self, address: &Address) -> RouterResult<()> {
        self.router.delete(address).await?;
        self.mirror_remove(address).await;
        Ok(())
    }

    /// Moves a note to a free address.
    ///
    /// Fails with `NotFound` or `AlreadyExists` before anything is written.
    pub async fn move_memo(&self, from: &Address, to: &Address) -> RouterResult<IndexEntry> {
        let entry = self.router.move_note(from, to).await?;
        self.mirror_upsert(&entry).await;
        self.mirror_remove(from).await;
        Ok(entry)
    }

    /// Appends `child`'s body to `parent`, then deletes `child`.
    pub async fn merge_memo(&self, parent: &Address, child: &Address) -> RouterResult<IndexEntry> {
        if parent == child {
            return Err(RouterError::AlreadyExists(child.clone()));
        }
        let mut merged = self.router.read(parent).await?;
        let child_memo = self.router.read(child).await?;
        merged.append(&child_memo);

        let entry = self.router.write(parent, merged).await?;
        self.mirror_upsert(&entry).await;
        self.router.delete(child).await?;
        self.mirror_remove(child).await;

        info!(%parent, %child, "merged notes");
        Ok(entry)
    }

    /// Moves a note to the same slug under `audience`.
    pub async fn update_audience(
        &self,
        address: &Address,
        audience: Audience,
    ) -> RouterResult<IndexEntry> {
        self.move_memo(address, &address.with_audience(audience))
            .await
    }

    /// Full-text search over both audiences. An empty query lists recent
    /// notes.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<IndexEntry>> {
        self.index.search(query, limit).await
    }

    pub async fn list_recent(&self, limit: usize) -> Result<Vec<IndexEntry>> {
        self.index.recent(limit).await
    }

    pub async fn count(&self) -> Result<u64> {
        self.index.count().await
    }

    async fn mirror_upsert(&self, entry: &IndexEntry) {
        if let Err(e) = self.index.upsert(entry).await {
            warn!(address = %entry.address, error = %e, "failed to index written note");
        }
    }

    async fn mirror_remove(&self, address: &Address) {
        if let Err(e) = self.index.remove(address).await {
            warn!(%address, error = %e, "failed to drop deleted note from index");
        }
    }
}
