//! Address routing between the local note store and the sphere.
//!
//! Every read and write is dispatched on [`Address::audience`]: `Local` goes
//! to the [`NoteStore`], `Public` to the [`SphereStore`]. The only work done
//! besides dispatch is stamping `modified` before a write and replacing it
//! with the store's own post-write value afterwards.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::address::{Address, Audience};
use crate::fingerprint::{datetime_seconds, now_seconds, seconds_to_datetime};
use crate::memo::Memo;
use crate::slug::Slug;
use crate::store::{IndexEntry, NoteStore, SphereStore, StoreError};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no note at {0}")]
    NotFound(Address),
    #[error("a note already exists at {0}")]
    AlreadyExists(Address),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl RouterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RouterError::NotFound(_))
    }
}

pub type RouterResult<T> = Result<T, RouterError>;

/// Dispatches note operations to the store that owns each audience.
#[derive(Clone)]
pub struct AddressRouter {
    notes: Arc<dyn NoteStore>,
    sphere: Arc<dyn SphereStore>,
}

impl AddressRouter {
    pub fn new(notes: Arc<dyn NoteStore>, sphere: Arc<dyn SphereStore>) -> Self {
        Self { notes, sphere }
    }

    pub fn notes(&self) -> &dyn NoteStore {
        self.notes.as_ref()
    }

    pub fn sphere(&self) -> &dyn SphereStore {
        self.sphere.as_ref()
    }

    /// Finds the address a bare slug refers to. Public wins over local.
    pub async fn resolve(&self, slug: &Slug) -> RouterResult<Option<Address>> {
        for audience in [Audience::Public, Audience::Local] {
            let address = Address::new(slug.clone(), audience);
            if self.exists(&address).await? {
                return Ok(Some(address));
            }
        }
        Ok(None)
    }

    pub async fn exists(&self, address: &Address) -> RouterResult<bool> {
        match address.audience {
            Audience::Local => Ok(self.notes.info(&address.slug).await?.is_some()),
            Audience::Public => match self.sphere.read(&address.slug).await {
                Ok(_) => Ok(true),
                Err(StoreError::NotFound(_)) => Ok(false),
                Err(StoreError::Other(e)) => Err(e.into()),
            },
        }
    }

    pub async fn read(&self, address: &Address) -> RouterResult<Memo> {
        match address.audience {
            Audience::Local => self
                .notes
                .read(&address.slug)
                .await?
                .ok_or_else(|| RouterError::NotFound(address.clone())),
            Audience::Public => self
                .sphere
                .read(&address.slug)
                .await
                .map_err(|e| not_found_or(e, address)),
        }
    }

    /// Writes `memo` and returns it as the owning store now sees it.
    ///
    /// The caller's `modified` is discarded: it is stamped with the current
    /// time before dispatch, then replaced with the store's post-write value.
    pub async fn write(&self, address: &Address, mut memo: Memo) -> RouterResult<IndexEntry> {
        memo.modified = now_seconds();
        match address.audience {
            Audience::Local => {
                self.notes.write(&address.slug, &memo).await?;
                let stored = self
                    .notes
                    .info(&address.slug)
                    .await?
                    .ok_or_else(|| RouterError::NotFound(address.clone()))?;
                memo.modified = seconds_to_datetime(stored.modified);
                debug!(%address, modified = stored.modified, "wrote local note");
                Ok(IndexEntry::new(address.clone(), memo, stored.size))
            }
            Audience::Public => {
                self.sphere.write(&address.slug, &memo).await?;
                let version = self.sphere.save().await?;
                let mut stored = self
                    .sphere
                    .read(&address.slug)
                    .await
                    .map_err(|e| not_found_or(e, address))?;
                stored.modified = seconds_to_datetime(datetime_seconds(stored.modified));
                debug!(%address, %version, "wrote public note");
                let size = stored.body_size();
                Ok(IndexEntry::new(address.clone(), stored, size))
            }
        }
    }

    /// Deletes the note at `address`. Deleting a missing note is a no-op.
    pub async fn delete(&self, address: &Address) -> RouterResult<()> {
        match address.audience {
            Audience::Local => self.notes.remove(&address.slug).await?,
            Audience::Public => {
                self.sphere.remove(&address.slug).await?;
                self.sphere.save().await?;
            }
        }
        debug!(%address, "deleted note");
        Ok(())
    }

    /// Moves a note to another address: write the destination, then delete
    /// the source.
    ///
    /// Preconditions are checked before anything is written: the source
    /// must exist and the destination must not. A failure after the write
    /// leaves both copies in place.
    pub async fn move_note(&self, from: &Address, to: &Address) -> RouterResult<IndexEntry> {
        if from == to {
            return Err(RouterError::AlreadyExists(to.clone()));
        }
        let memo = self.read(from).await?;
        if self.exists(to).await? {
            return Err(RouterError::AlreadyExists(to.clone()));
        }

        let entry = self.write(to, memo).await?;
        self.delete(from).await?;
        info!(%from, %to, "moved note");
        Ok(entry)
    }

    /// Moves a note to the same slug under another audience.
    pub async fn update_audience(
        &self,
        address: &Address,
        audience: Audience,
    ) -> RouterResult<IndexEntry> {
        self.move_note(address, &address.with_audience(audience))
            .await
    }
}

fn not_found_or(err: StoreError, address: &Address) -> RouterError {
    match err {
        StoreError::NotFound(_) => RouterError::NotFound(address.clone()),
        StoreError::Other(e) => RouterError::Store(e),
    }
}
