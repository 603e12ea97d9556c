//! Leader-wins reconciliation.
//!
//! [`reconcile`] walks a change set from [`calc_changes`] and drives a
//! [`Follower`] toward the leader:
//!
//! - `Same` is skipped.
//! - `LeftOnly`, `LeftNewer`, `RightNewer` and `Conflict` re-read the
//!   leader's content and upsert it into the follower.
//! - `RightOnly` removes the key from the follower.
//!
//! The leader is never written. Each change is applied on its own: a failure
//! is recorded in the [`ReconcileReport`] and the walk continues, since
//! re-running a pass only reproduces the changes still outstanding.
//!
//! Two concrete passes are provided: [`index_local_notes`] (filesystem →
//! index) and [`index_sphere_changes`] (sphere → index).

use std::collections::HashSet;
use std::fmt::Debug;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::address::{Address, Audience};
use crate::change::{calc_changes, Change, ChangeStatus, ChangeSummary};
use crate::fingerprint::{collect_fingerprints, datetime_seconds, seconds_to_datetime, Fingerprint};
use crate::slug::Slug;
use crate::store::{IndexEntry, IndexStore, NoteStore, SphereStore, StoreError, Version};

/// The store being brought in line with a leader.
#[async_trait]
pub trait Follower<K>: Send + Sync {
    /// Copies the leader's current content for `key` into the follower.
    async fn upsert(&self, key: &K) -> Result<()>;

    /// Deletes `key` from the follower.
    async fn remove(&self, key: &K) -> Result<()>;
}

/// One change that could not be applied.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileFailure<K> {
    pub key: K,
    pub status: Option<ChangeStatus>,
    pub error: String,
}

/// Outcome of one reconciliation walk.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport<K> {
    pub upserted: usize,
    pub removed: usize,
    pub unchanged: usize,
    /// Keys where the follower was ahead of the leader and got overwritten.
    pub anomalies: Vec<K>,
    pub failures: Vec<ReconcileFailure<K>>,
    /// The walk stopped early because a newer request superseded it.
    pub interrupted: bool,
}

impl<K> Default for ReconcileReport<K> {
    fn default() -> Self {
        Self {
            upserted: 0,
            removed: 0,
            unchanged: 0,
            anomalies: Vec::new(),
            failures: Vec::new(),
            interrupted: false,
        }
    }
}

impl<K> ReconcileReport<K> {
    /// True when every change was applied and the walk ran to the end.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && !self.interrupted
    }
}

/// Applies `changes` to `follower` until done.
pub async fn reconcile<K, F>(changes: Vec<Change<K>>, follower: &F) -> ReconcileReport<K>
where
    K: Clone + PartialEq + Debug + Send + Sync,
    F: Follower<K> + ?Sized,
{
    reconcile_until(changes, follower, &|| false).await
}

/// Applies `changes` to `follower`, checking `superseded` before each change.
///
/// When `superseded` returns true the walk stops and the report is marked
/// interrupted. Changes already applied stay applied.
pub async fn reconcile_until<K, F>(
    changes: Vec<Change<K>>,
    follower: &F,
    superseded: &(dyn Fn() -> bool + Send + Sync),
) -> ReconcileReport<K>
where
    K: Clone + PartialEq + Debug + Send + Sync,
    F: Follower<K> + ?Sized,
{
    let mut report = ReconcileReport::default();

    for change in changes {
        let status = change.status();
        if status == ChangeStatus::Same {
            report.unchanged += 1;
            continue;
        }
        if superseded() {
            debug!("reconcile superseded; stopping early");
            report.interrupted = true;
            break;
        }

        let key = change.key();
        let result = match status {
            ChangeStatus::RightOnly => follower.remove(key).await.map(|_| {
                report.removed += 1;
            }),
            _ => {
                if status == ChangeStatus::RightNewer {
                    warn!(
                        key = ?key,
                        leader_modified = change.left().map(|fp| fp.modified),
                        follower_modified = change.right().map(|fp| fp.modified),
                        "follower ahead of leader; overwriting with leader content"
                    );
                    report.anomalies.push(key.clone());
                }
                follower.upsert(key).await.map(|_| {
                    report.upserted += 1;
                })
            }
        };

        if let Err(e) = result {
            warn!(key = ?key, status = ?status, error = %e, "failed to apply change");
            report.failures.push(ReconcileFailure {
                key: key.clone(),
                status: Some(status),
                error: format!("{e:#}"),
            });
        }
    }

    report
}

// ─── Filesystem → index ─────────────────────────────────────────────

/// Follower view of the index for local notes.
pub struct LocalIndexer<'a> {
    notes: &'a dyn NoteStore,
    index: &'a dyn IndexStore,
}

impl<'a> LocalIndexer<'a> {
    pub fn new(notes: &'a dyn NoteStore, index: &'a dyn IndexStore) -> Self {
        Self { notes, index }
    }
}

#[async_trait]
impl Follower<Slug> for LocalIndexer<'_> {
    async fn upsert(&self, slug: &Slug) -> Result<()> {
        let before = self.notes.info(slug).await?;
        let mut memo = self
            .notes
            .read(slug)
            .await?
            .ok_or_else(|| anyhow!("note disappeared before it could be read: {slug}"))?;
        let after = self
            .notes
            .info(slug)
            .await?
            .ok_or_else(|| anyhow!("note disappeared while being read: {slug}"))?;
        if before != Some(after) {
            // Content and metadata may disagree; leave it for the next pass.
            return Err(anyhow!("note changed while being read: {slug}"));
        }

        memo.modified = seconds_to_datetime(after.modified);
        let entry = IndexEntry::new(Address::local(slug.clone()), memo, after.size);
        self.index.upsert(&entry).await
    }

    async fn remove(&self, slug: &Slug) -> Result<()> {
        self.index.remove(&Address::local(slug.clone())).await
    }
}

/// Fingerprints every local note, omitting notes whose metadata is unreadable.
pub async fn local_fingerprints(notes: &dyn NoteStore) -> Result<Vec<Fingerprint<Slug>>> {
    let slugs = notes.list().await?;
    let mut scanned = Vec::with_capacity(slugs.len());
    for slug in slugs {
        let fingerprint = match notes.info(&slug).await {
            Ok(Some(info)) => Some(Fingerprint::new(slug, info.modified, info.size)),
            Ok(None) => {
                debug!(%slug, "note vanished during scan");
                None
            }
            Err(e) => {
                warn!(%slug, error = %e, "skipping unreadable note");
                None
            }
        };
        scanned.push(fingerprint);
    }
    Ok(collect_fingerprints(scanned).into_values().collect())
}

/// Reconciles local notes (leader) into the index (follower).
pub async fn index_local_notes(
    notes: &dyn NoteStore,
    index: &dyn IndexStore,
    superseded: &(dyn Fn() -> bool + Send + Sync),
) -> Result<ReconcileReport<Slug>> {
    let left = local_fingerprints(notes).await?;
    let right = index.fingerprints(Audience::Local).await?;
    let changes = calc_changes(left, right);
    let summary = ChangeSummary::of(&changes);
    debug!(?summary, "local changes classified");

    let report = reconcile_until(changes, &LocalIndexer::new(notes, index), superseded).await;
    info!(
        upserted = report.upserted,
        removed = report.removed,
        failed = report.failures.len(),
        interrupted = report.interrupted,
        "indexed local notes"
    );
    Ok(report)
}

// ─── Sphere → index ─────────────────────────────────────────────────

/// Follower view of the index for public notes.
pub struct SphereIndexer<'a> {
    sphere: &'a dyn SphereStore,
    index: &'a dyn IndexStore,
}

impl<'a> SphereIndexer<'a> {
    pub fn new(sphere: &'a dyn SphereStore, index: &'a dyn IndexStore) -> Self {
        Self { sphere, index }
    }
}

#[async_trait]
impl Follower<Slug> for SphereIndexer<'_> {
    async fn upsert(&self, slug: &Slug) -> Result<()> {
        let mut memo = self.sphere.read(slug).await.map_err(anyhow::Error::from)?;
        memo.modified = seconds_to_datetime(datetime_seconds(memo.modified));
        let size = memo.body_size();
        let entry = IndexEntry::new(Address::public(slug.clone()), memo, size);
        self.index.upsert(&entry).await
    }

    async fn remove(&self, slug: &Slug) -> Result<()> {
        self.index.remove(&Address::public(slug.clone())).await
    }
}

/// Result of one sphere → index pass.
#[derive(Debug, Clone, Serialize)]
pub struct SpherePass {
    /// Sphere version observed before the delta was requested.
    pub version: Version,
    pub report: ReconcileReport<Slug>,
}

/// Reconciles public notes touched since `since` (leader: sphere) into the
/// index.
///
/// `since = None` runs a full pass that also drops public index entries the
/// sphere no longer has. Slugs the sphere fails to read (other than
/// not-found) are reported and left out of both sides, so a transient read
/// error never deletes an indexed note.
pub async fn index_sphere_changes(
    sphere: &dyn SphereStore,
    index: &dyn IndexStore,
    since: Option<&str>,
    superseded: &(dyn Fn() -> bool + Send + Sync),
) -> Result<SpherePass> {
    let version = sphere.version().await?;
    let touched = sphere.changes(since).await?;

    let mut read_failures = Vec::new();
    let mut left = Vec::with_capacity(touched.len());
    let mut skipped = HashSet::new();
    for slug in &touched {
        match sphere.read(slug).await {
            Ok(memo) => left.push(Fingerprint::from_datetime(
                slug.clone(),
                memo.modified,
                memo.body_size(),
            )),
            Err(StoreError::NotFound(_)) => {}
            Err(StoreError::Other(e)) => {
                warn!(%slug, error = %e, "skipping unreadable sphere note");
                skipped.insert(slug.clone());
                read_failures.push(ReconcileFailure {
                    key: slug.clone(),
                    status: None,
                    error: format!("{e:#}"),
                });
            }
        }
    }

    let mut right = match since {
        None => index.fingerprints(Audience::Public).await?,
        Some(_) => {
            let mut fingerprints = Vec::new();
            for slug in &touched {
                if let Some(fp) = index.fingerprint(&Address::public(slug.clone())).await? {
                    fingerprints.push(fp);
                }
            }
            fingerprints
        }
    };
    right.retain(|fp| !skipped.contains(&fp.key));

    let changes = calc_changes(left, right);
    let summary = ChangeSummary::of(&changes);
    debug!(?summary, since, %version, "sphere changes classified");

    let mut report = reconcile_until(changes, &SphereIndexer::new(sphere, index), superseded).await;
    report.failures.splice(0..0, read_failures);
    info!(
        upserted = report.upserted,
        removed = report.removed,
        failed = report.failures.len(),
        interrupted = report.interrupted,
        %version,
        "indexed sphere changes"
    );
    Ok(SpherePass { version, report })
}
