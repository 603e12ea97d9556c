//! Sync orchestration.
//!
//! [`SyncOrchestrator`] owns the index lifecycle and sequences the passes
//! that bring it in line with its leaders:
//!
//! | Pass | Leader | Follower |
//! |------|--------|----------|
//! | [`sync_gateway`](SyncOrchestrator::sync_gateway) | remote gateway | sphere |
//! | [`index_sphere`](SyncOrchestrator::index_sphere) | sphere | index (public) |
//! | [`index_local`](SyncOrchestrator::index_local) | filesystem | index (local) |
//!
//! The index state moves `Unknown → MigratingIndex → Ready`. A failed
//! migration moves it to `Broken` and triggers exactly one destructive
//! rebuild; if that fails too the state stays `Broken` and the error is
//! returned.
//!
//! Each pass kind has a [`PassGate`]. Passes of the same kind run one at a
//! time, and a new request marks the one in flight as superseded so it
//! stops between changes instead of holding the newer request back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use notebook_sync_core::reconcile::{index_local_notes, index_sphere_changes, SpherePass};
use notebook_sync_core::store::{IndexStore, Migrator, NoteStore, SphereStore, Version};
use notebook_sync_core::{ReconcileReport, Slug};

use crate::config::Config;
use crate::fs_store::FsNoteStore;
use crate::index::SqliteIndex;

/// Metadata key holding the identity of the sphere the watermark belongs to.
pub const SPHERE_IDENTITY_KEY: &str = "sphere_identity";
/// Metadata key holding the last sphere version fully indexed.
pub const SPHERE_VERSION_KEY: &str = "sphere_version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Unknown,
    MigratingIndex,
    Ready,
    Broken,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("index is not ready (state: {0:?})")]
    NotReady(SyncState),
    #[error("index migration failed after rebuild: {0:#}")]
    Migration(anyhow::Error),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// The collaborators a sync run works against.
#[derive(Clone)]
pub struct Services {
    pub notes: Arc<dyn NoteStore>,
    pub sphere: Arc<dyn SphereStore>,
    pub index: Arc<dyn IndexStore>,
    pub migrator: Arc<dyn Migrator>,
}

impl Services {
    /// Filesystem notes and a SQLite index from `config`, plus the given
    /// sphere.
    pub async fn open(config: &Config, sphere: Arc<dyn SphereStore>) -> Result<Self> {
        let index = Arc::new(SqliteIndex::open(config).await?);
        Ok(Self {
            notes: Arc::new(FsNoteStore::from_config(config)?),
            sphere,
            index: index.clone(),
            migrator: index,
        })
    }
}

/// Serializes passes of one kind and lets newer requests supersede older
/// ones.
#[derive(Default)]
pub struct PassGate {
    generation: AtomicU64,
    lock: Mutex<()>,
}

impl PassGate {
    /// Registers a new request, then waits for the pass in flight to stop.
    pub async fn enter(&self) -> (u64, MutexGuard<'_, ()>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = self.lock.lock().await;
        (generation, guard)
    }

    /// True once a request newer than `generation` has arrived.
    pub fn is_superseded(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }
}

/// Outcome of [`SyncOrchestrator::sync_all`]. Pass errors are recorded
/// rather than returned so one failing pass never blocks the others.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    pub gateway_version: Option<Version>,
    pub gateway_error: Option<String>,
    pub sphere: Option<SpherePass>,
    pub sphere_error: Option<String>,
    pub local: Option<ReconcileReport<Slug>>,
    pub local_error: Option<String>,
}

impl SyncSummary {
    /// True when every pass ran to the end without failures.
    pub fn is_complete(&self) -> bool {
        self.gateway_error.is_none()
            && self.sphere_error.is_none()
            && self.local_error.is_none()
            && self.sphere.as_ref().map_or(false, |p| p.report.is_complete())
            && self.local.as_ref().map_or(false, ReconcileReport::is_complete)
    }
}

pub struct SyncOrchestrator {
    services: Services,
    gateway: bool,
    state: watch::Sender<SyncState>,
    gateway_lock: Mutex<()>,
    sphere_gate: PassGate,
    local_gate: PassGate,
}

impl SyncOrchestrator {
    pub fn new(services: Services) -> Self {
        let (state, _) = watch::channel(SyncState::Unknown);
        Self {
            services,
            gateway: true,
            state,
            gateway_lock: Mutex::new(()),
            sphere_gate: PassGate::default(),
            local_gate: PassGate::default(),
        }
    }

    /// Whether passes call the sphere gateway before indexing.
    pub fn with_gateway(mut self, enabled: bool) -> Self {
        self.gateway = enabled;
        self
    }

    /// Builds an orchestrator over the stores named in `config`.
    pub async fn open(config: &Config, sphere: Arc<dyn SphereStore>) -> Result<Self> {
        let services = Services::open(config, sphere).await?;
        Ok(Self::new(services).with_gateway(config.sync.gateway))
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Receives every state transition.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SyncState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "sync state changed");
        }
    }

    fn ensure_ready(&self) -> Result<(), SyncError> {
        match self.state() {
            SyncState::Ready => Ok(()),
            state => Err(SyncError::NotReady(state)),
        }
    }

    /// Migrates the index and then runs every pass.
    pub async fn start(&self) -> Result<SyncSummary, SyncError> {
        self.migrate_index().await?;
        self.sync_all().await
    }

    /// Brings the index schema up to date, rebuilding it once on failure.
    pub async fn migrate_index(&self) -> Result<u32, SyncError> {
        self.set_state(SyncState::MigratingIndex);

        let err = match self.services.migrator.migrate().await {
            Ok(version) => {
                info!(version, "index ready");
                self.set_state(SyncState::Ready);
                return Ok(version);
            }
            Err(e) => e,
        };

        error!(error = %format!("{err:#}"), "index migration failed; rebuilding");
        self.set_state(SyncState::Broken);

        match self.services.migrator.rebuild().await {
            Ok(version) => {
                warn!(version, "index rebuilt; notes will be re-indexed");
                self.set_state(SyncState::Ready);
                Ok(version)
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "index rebuild failed");
                Err(SyncError::Migration(e))
            }
        }
    }

    /// Runs the gateway, sphere, and local passes in order.
    ///
    /// Only a not-ready index is an error; a failing pass is recorded in
    /// the summary and the remaining passes still run.
    pub async fn sync_all(&self) -> Result<SyncSummary, SyncError> {
        self.ensure_ready()?;
        let mut summary = SyncSummary::default();

        if self.gateway {
            match self.sync_gateway().await {
                Ok(version) => summary.gateway_version = Some(version),
                Err(e) => summary.gateway_error = Some(format!("{e:#}")),
            }
        }

        match self.index_sphere().await {
            Ok(pass) => summary.sphere = Some(pass),
            Err(e) => {
                warn!(error = %e, "sphere index pass failed");
                summary.sphere_error = Some(e.to_string());
            }
        }

        match self.index_local().await {
            Ok(report) => summary.local = Some(report),
            Err(e) => {
                warn!(error = %e, "local index pass failed");
                summary.local_error = Some(e.to_string());
            }
        }

        info!(complete = summary.is_complete(), "sync finished");
        Ok(summary)
    }

    /// Pushes and pulls the sphere against its gateway.
    ///
    /// Failures are logged and returned; they never affect the index passes.
    pub async fn sync_gateway(&self) -> Result<Version> {
        let _guard = self.gateway_lock.lock().await;
        match self.services.sphere.sync().await {
            Ok(version) => {
                info!(%version, "sphere synced with gateway");
                Ok(version)
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "gateway sync failed; continuing with local state");
                Err(e)
            }
        }
    }

    /// Indexes public notes changed since the stored watermark.
    ///
    /// The watermark advances only when every change was applied, so an
    /// interrupted or partially failed pass re-requests the same delta.
    pub async fn index_sphere(&self) -> Result<SpherePass, SyncError> {
        self.ensure_ready()?;
        let (generation, _guard) = self.sphere_gate.enter().await;
        let superseded = || self.sphere_gate.is_superseded(generation);

        let sphere = self.services.sphere.as_ref();
        let index = self.services.index.as_ref();
        let identity = sphere.identity().await?;
        let since = self.watermark(&identity).await?;

        let pass = match index_sphere_changes(sphere, index, since.as_deref(), &superseded).await {
            Ok(pass) => pass,
            Err(e) if since.is_some() => {
                warn!(
                    error = %format!("{e:#}"),
                    since = since.as_deref(),
                    "delta request failed; falling back to a full pass"
                );
                index_sphere_changes(sphere, index, None, &superseded).await?
            }
            Err(e) => return Err(e.into()),
        };

        if pass.report.is_complete() {
            // Version before identity: a torn write reads as a foreign
            // watermark and forces a full pass.
            index
                .write_metadata_batch(&[
                    (SPHERE_VERSION_KEY, pass.version.as_str()),
                    (SPHERE_IDENTITY_KEY, identity.as_str()),
                ])
                .await?;
            debug!(version = %pass.version, "sphere watermark advanced");
        } else {
            debug!(
                failures = pass.report.failures.len(),
                interrupted = pass.report.interrupted,
                "sphere watermark kept"
            );
        }
        Ok(pass)
    }

    /// Indexes local notes from the filesystem.
    pub async fn index_local(&self) -> Result<ReconcileReport<Slug>, SyncError> {
        self.ensure_ready()?;
        let (generation, _guard) = self.local_gate.enter().await;
        let superseded = || self.local_gate.is_superseded(generation);

        let report = index_local_notes(
            self.services.notes.as_ref(),
            self.services.index.as_ref(),
            &superseded,
        )
        .await?;
        Ok(report)
    }

    /// The stored sphere version, if it belongs to the sphere `identity`.
    async fn watermark(&self, identity: &str) -> Result<Option<Version>> {
        let index = self.services.index.as_ref();
        let stored_identity = index.read_metadata(SPHERE_IDENTITY_KEY).await?;
        match stored_identity.as_deref() {
            Some(stored) if stored == identity => index.read_metadata(SPHERE_VERSION_KEY).await,
            Some(stored) => {
                info!(stored, current = identity, "sphere identity changed; reindexing");
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

/// Runs [`SyncOrchestrator::sync_all`] every `interval` until the handle is
/// aborted. The first run happens one interval after spawning. A zero
/// interval disables the timer and the task exits immediately.
pub fn spawn_periodic(orchestrator: Arc<SyncOrchestrator>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        if interval.is_zero() {
            debug!("periodic sync disabled");
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match orchestrator.sync_all().await {
                Ok(summary) => debug!(complete = summary.is_complete(), "periodic sync done"),
                Err(e) => warn!(error = %e, "periodic sync skipped"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use notebook_sync_core::store::memory::{MemoryIndex, MemoryNoteStore, MemorySphere};
    use std::sync::atomic::AtomicUsize;

    /// Fails `migrate` always and `rebuild` when `rebuild_fails` is set.
    struct FailingMigrator {
        rebuild_fails: bool,
        rebuilds: AtomicUsize,
    }

    #[async_trait]
    impl Migrator for FailingMigrator {
        async fn migrate(&self) -> Result<u32> {
            Err(anyhow!("schema is corrupt"))
        }

        async fn rebuild(&self) -> Result<u32> {
            self.rebuilds.fetch_add(1, Ordering::SeqCst);
            if self.rebuild_fails {
                Err(anyhow!("disk is read-only"))
            } else {
                Ok(2)
            }
        }
    }

    fn services(migrator: Arc<dyn Migrator>) -> Services {
        Services {
            notes: Arc::new(MemoryNoteStore::new()),
            sphere: Arc::new(MemorySphere::new("did:key:test")),
            index: Arc::new(MemoryIndex::new()),
            migrator,
        }
    }

    #[tokio::test]
    async fn test_migrate_reaches_ready() {
        let orchestrator = SyncOrchestrator::new(services(Arc::new(MemoryIndex::new())));
        let mut states = orchestrator.subscribe();
        assert_eq!(orchestrator.state(), SyncState::Unknown);

        orchestrator.migrate_index().await.unwrap();
        assert_eq!(orchestrator.state(), SyncState::Ready);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), SyncState::Ready);
    }

    #[tokio::test]
    async fn test_failed_migration_rebuilds_once() {
        let migrator = Arc::new(FailingMigrator {
            rebuild_fails: false,
            rebuilds: AtomicUsize::new(0),
        });
        let orchestrator = SyncOrchestrator::new(services(migrator.clone()));

        assert_eq!(orchestrator.migrate_index().await.unwrap(), 2);
        assert_eq!(orchestrator.state(), SyncState::Ready);
        assert_eq!(migrator.rebuilds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_rebuild_is_fatal() {
        let migrator = Arc::new(FailingMigrator {
            rebuild_fails: true,
            rebuilds: AtomicUsize::new(0),
        });
        let orchestrator = SyncOrchestrator::new(services(migrator.clone()));

        let err = orchestrator.migrate_index().await.unwrap_err();
        assert!(matches!(err, SyncError::Migration(_)));
        assert_eq!(orchestrator.state(), SyncState::Broken);
        assert_eq!(migrator.rebuilds.load(Ordering::SeqCst), 1);

        let err = orchestrator.sync_all().await.unwrap_err();
        assert!(matches!(err, SyncError::NotReady(SyncState::Broken)));
    }

    #[tokio::test]
    async fn test_passes_require_ready_index() {
        let orchestrator = SyncOrchestrator::new(services(Arc::new(MemoryIndex::new())));
        assert!(matches!(
            orchestrator.index_local().await,
            Err(SyncError::NotReady(SyncState::Unknown))
        ));
        assert!(matches!(
            orchestrator.index_sphere().await,
            Err(SyncError::NotReady(SyncState::Unknown))
        ));
    }

    #[tokio::test]
    async fn test_gate_supersedes_older_generation() {
        let gate = PassGate::default();
        let (first, guard) = gate.enter().await;
        assert!(!gate.is_superseded(first));
        drop(guard);
        let (second, _guard) = gate.enter().await;
        assert!(gate.is_superseded(first));
        assert!(!gate.is_superseded(second));
    }
}
