//! End-to-end sync against note files, a SQLite index, and an in-memory
//! sphere.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use notebook_sync::config::{Config, DbConfig, NotesConfig, SyncConfig};
use notebook_sync::sync::{SPHERE_IDENTITY_KEY, SPHERE_VERSION_KEY};
use notebook_sync::{
    db, spawn_periodic, FsNoteStore, NoteService, Services, SqliteIndex, SyncOrchestrator,
    SyncState,
};
use notebook_sync_core::store::memory::MemorySphere;
use notebook_sync_core::store::{
    IndexEntry, IndexStore, Migrator, SphereStore, StoreError, Version,
};
use notebook_sync_core::{Address, AddressRouter, Audience, Memo, Slug};

const IDENTITY: &str = "did:key:z6MkNotebook";

struct Harness {
    _tmp: TempDir,
    root: PathBuf,
    sphere: Arc<MemorySphere>,
    index: Arc<SqliteIndex>,
    orchestrator: SyncOrchestrator,
}

impl Harness {
    fn services(&self) -> &Services {
        self.orchestrator.services()
    }

    fn note_service(&self) -> NoteService {
        let services = self.services();
        NoteService::new(
            AddressRouter::new(services.notes.clone(), services.sphere.clone()),
            services.index.clone(),
        )
    }

    fn write_file(&self, rel: &str, title: &str, body: &str) -> PathBuf {
        let path = self.root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let memo = Memo::new(title, body, Utc::now());
        std::fs::write(&path, memo.to_file_string()).unwrap();
        path
    }
}

async fn harness() -> Harness {
    let sphere = Arc::new(MemorySphere::new(IDENTITY));
    harness_with(sphere.clone(), sphere).await
}

/// Harness whose orchestrator reads the sphere through `store`.
async fn harness_with(sphere: Arc<MemorySphere>, store: Arc<dyn SphereStore>) -> Harness {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("notes");
    std::fs::create_dir_all(&root).unwrap();

    let pool = db::connect_path(&tmp.path().join("index.sqlite"))
        .await
        .unwrap();
    let index = Arc::new(SqliteIndex::new(pool));
    let services = Services {
        notes: Arc::new(FsNoteStore::new(&root, "subtext", &[]).unwrap()),
        sphere: store,
        index: index.clone(),
        migrator: index.clone(),
    };

    Harness {
        _tmp: tmp,
        root,
        sphere,
        index,
        orchestrator: SyncOrchestrator::new(services),
    }
}

fn slug(s: &str) -> Slug {
    Slug::new(s).unwrap()
}

fn addr(s: &str) -> Address {
    s.parse().unwrap()
}

async fn publish(sphere: &MemorySphere, name: &str, body: &str) {
    sphere
        .write(&slug(name), &Memo::new(name, body, Utc::now()))
        .await
        .unwrap();
    sphere.save().await.unwrap();
}

fn set_mtime(path: &Path, secs_from_now: u64) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(secs_from_now))
        .unwrap();
}

fn addresses(entries: &[IndexEntry]) -> Vec<String> {
    entries.iter().map(|e| e.address.to_string()).collect()
}

/// Sphere that can be told to fail content reads for one slug.
struct FailingReads {
    inner: Arc<MemorySphere>,
    broken: Mutex<Option<Slug>>,
}

impl FailingReads {
    fn new(inner: Arc<MemorySphere>) -> Self {
        Self {
            inner,
            broken: Mutex::new(None),
        }
    }

    fn fail_reads_of(&self, slug: Option<Slug>) {
        *self.broken.lock().unwrap() = slug;
    }
}

#[async_trait]
impl SphereStore for FailingReads {
    async fn identity(&self) -> Result<String> {
        self.inner.identity().await
    }

    async fn version(&self) -> Result<Version> {
        self.inner.version().await
    }

    async fn changes(&self, since: Option<&str>) -> Result<Vec<Slug>> {
        self.inner.changes(since).await
    }

    async fn read(&self, slug: &Slug) -> Result<Memo, StoreError> {
        if self.broken.lock().unwrap().as_ref() == Some(slug) {
            return Err(StoreError::Other(anyhow!("block fetch timed out")));
        }
        self.inner.read(slug).await
    }

    async fn write(&self, slug: &Slug, memo: &Memo) -> Result<()> {
        self.inner.write(slug, memo).await
    }

    async fn remove(&self, slug: &Slug) -> Result<()> {
        self.inner.remove(slug).await
    }

    async fn save(&self) -> Result<Version> {
        self.inner.save().await
    }

    async fn sync(&self) -> Result<Version> {
        self.inner.sync().await
    }
}

#[tokio::test]
async fn test_start_indexes_both_audiences() {
    let h = harness().await;
    h.write_file("groceries.subtext", "Groceries", "Eggs and oat milk");
    h.write_file("ideas/rust.subtext", "Rust", "Ownership notes");
    publish(&h.sphere, "published", "A public essay about eggs").await;

    let summary = h.orchestrator.start().await.unwrap();
    assert!(summary.is_complete());
    assert_eq!(h.orchestrator.state(), SyncState::Ready);
    assert_eq!(summary.local.as_ref().unwrap().upserted, 2);
    assert_eq!(summary.sphere.as_ref().unwrap().report.upserted, 1);
    assert_eq!(h.index.count().await.unwrap(), 3);

    let mut hits = addresses(&h.index.search("eggs", 10).await.unwrap());
    hits.sort();
    assert_eq!(hits, vec!["local::groceries", "public::published"]);
    assert!(h
        .index
        .get(&addr("local::ideas/rust"))
        .await
        .unwrap()
        .is_some());

    assert_eq!(
        h.index.read_metadata(SPHERE_IDENTITY_KEY).await.unwrap().as_deref(),
        Some(IDENTITY)
    );
    let version = h.sphere.version().await.unwrap();
    assert_eq!(
        h.index.read_metadata(SPHERE_VERSION_KEY).await.unwrap(),
        Some(version)
    );

    // Nothing moved: the local pass sees only `Same`, the sphere delta is empty.
    let summary = h.orchestrator.sync_all().await.unwrap();
    let local = summary.local.unwrap();
    assert_eq!(local.upserted + local.removed, 0);
    assert_eq!(local.unchanged, 2);
    assert_eq!(summary.sphere.unwrap().report.upserted, 0);
}

#[tokio::test]
async fn test_sphere_delta_resumes_from_watermark() {
    let h = harness().await;
    publish(&h.sphere, "published", "first").await;
    publish(&h.sphere, "other", "second").await;
    h.orchestrator.start().await.unwrap();

    h.sphere
        .stage_remote(slug("remote-note"), Some(Memo::new("Remote", "from afar", Utc::now())))
        .unwrap();
    let summary = h.orchestrator.sync_all().await.unwrap();
    let pass = summary.sphere.unwrap();
    // Only the touched slug is compared.
    assert_eq!(pass.report.upserted, 1);
    assert_eq!(pass.report.unchanged, 0);
    assert_eq!(Some(pass.version.clone()), summary.gateway_version);
    assert_eq!(
        h.index.read_metadata(SPHERE_VERSION_KEY).await.unwrap(),
        Some(pass.version)
    );

    h.sphere.stage_remote(slug("published"), None).unwrap();
    let summary = h.orchestrator.sync_all().await.unwrap();
    assert_eq!(summary.sphere.unwrap().report.removed, 1);
    assert!(h
        .index
        .get(&addr("public::published"))
        .await
        .unwrap()
        .is_none());
    assert_eq!(h.index.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_gateway_failure_does_not_block_indexing() {
    let h = harness().await;
    h.sphere.set_offline(true).unwrap();
    h.write_file("offline.subtext", "Offline", "still indexed");
    publish(&h.sphere, "cached", "already in the sphere").await;

    let summary = h.orchestrator.start().await.unwrap();
    assert!(summary.gateway_error.is_some());
    assert!(summary.gateway_version.is_none());
    assert!(!summary.is_complete());
    assert_eq!(summary.local.unwrap().upserted, 1);
    assert_eq!(summary.sphere.unwrap().report.upserted, 1);
    assert_eq!(h.index.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_foreign_watermark_triggers_full_pass() {
    let h = harness().await;
    h.index.migrate().await.unwrap();
    h.index
        .write_metadata(SPHERE_IDENTITY_KEY, "did:key:someone-else")
        .await
        .unwrap();
    h.index.write_metadata(SPHERE_VERSION_KEY, "1").await.unwrap();
    let stale = IndexEntry::new(addr("public::stale"), Memo::new("Stale", "old", Utc::now()), 3);
    h.index.upsert(&stale).await.unwrap();
    publish(&h.sphere, "fresh", "new").await;

    let summary = h.orchestrator.start().await.unwrap();
    let report = summary.sphere.unwrap().report;
    assert_eq!(report.upserted, 1);
    assert_eq!(report.removed, 1);
    assert!(h.index.get(&addr("public::stale")).await.unwrap().is_none());
    assert_eq!(
        h.index.read_metadata(SPHERE_IDENTITY_KEY).await.unwrap().as_deref(),
        Some(IDENTITY)
    );
}

#[tokio::test]
async fn test_unusable_watermark_falls_back_to_full_pass() {
    let h = harness().await;
    h.index.migrate().await.unwrap();
    h.index
        .write_metadata(SPHERE_IDENTITY_KEY, IDENTITY)
        .await
        .unwrap();
    // Ahead of anything the sphere has produced.
    h.index.write_metadata(SPHERE_VERSION_KEY, "99").await.unwrap();
    publish(&h.sphere, "fresh", "new").await;

    let pass = h.orchestrator.start().await.unwrap().sphere.unwrap();
    assert_eq!(pass.report.upserted, 1);
    assert_eq!(
        h.index.read_metadata(SPHERE_VERSION_KEY).await.unwrap(),
        Some(pass.version)
    );
}

#[tokio::test]
async fn test_failed_watermark_write_keeps_old_watermark() {
    let h = harness().await;
    h.orchestrator.migrate_index().await.unwrap();
    h.index
        .write_metadata_batch(&[
            (SPHERE_VERSION_KEY, "50"),
            (SPHERE_IDENTITY_KEY, "did:key:someone-else"),
        ])
        .await
        .unwrap();
    publish(&h.sphere, "seen", "indexed before the failure").await;

    sqlx::raw_sql(
        r#"
        CREATE TRIGGER fail_identity_insert BEFORE INSERT ON metadata
        WHEN NEW.key = 'sphere_identity'
        BEGIN SELECT RAISE(ABORT, 'disk full'); END;
        CREATE TRIGGER fail_identity_update BEFORE UPDATE ON metadata
        WHEN NEW.key = 'sphere_identity'
        BEGIN SELECT RAISE(ABORT, 'disk full'); END;
        "#,
    )
    .execute(h.index.pool())
    .await
    .unwrap();

    assert!(h.orchestrator.index_sphere().await.is_err());
    assert_eq!(
        h.index.read_metadata(SPHERE_VERSION_KEY).await.unwrap().as_deref(),
        Some("50")
    );
    assert_eq!(
        h.index.read_metadata(SPHERE_IDENTITY_KEY).await.unwrap().as_deref(),
        Some("did:key:someone-else")
    );

    sqlx::raw_sql("DROP TRIGGER fail_identity_insert; DROP TRIGGER fail_identity_update;")
        .execute(h.index.pool())
        .await
        .unwrap();
    publish(&h.sphere, "missed", "published while the disk was full").await;

    // The foreign identity still forces a full pass.
    let pass = h.orchestrator.index_sphere().await.unwrap();
    assert!(pass.report.is_complete());
    assert_eq!((pass.report.upserted, pass.report.unchanged), (1, 1));
    assert!(h.index.get(&addr("public::missed")).await.unwrap().is_some());
    assert_eq!(
        h.index.read_metadata(SPHERE_IDENTITY_KEY).await.unwrap().as_deref(),
        Some(IDENTITY)
    );
    assert_eq!(
        h.index.read_metadata(SPHERE_VERSION_KEY).await.unwrap(),
        Some(h.sphere.version().await.unwrap())
    );
}

#[tokio::test]
async fn test_unreadable_sphere_note_keeps_entry_and_watermark() {
    let sphere = Arc::new(MemorySphere::new(IDENTITY));
    let flaky = Arc::new(FailingReads::new(sphere.clone()));
    let h = harness_with(sphere, flaky.clone()).await;
    publish(&h.sphere, "keep", "first draft").await;
    h.orchestrator.start().await.unwrap();
    let watermark = h.index.read_metadata(SPHERE_VERSION_KEY).await.unwrap();
    assert!(watermark.is_some());

    publish(&h.sphere, "keep", "second draft").await;
    publish(&h.sphere, "other", "a new note").await;
    flaky.fail_reads_of(Some(slug("keep")));

    let pass = h.orchestrator.index_sphere().await.unwrap();
    assert_eq!(pass.report.upserted, 1);
    assert_eq!(pass.report.removed, 0);
    assert_eq!(pass.report.failures.len(), 1);
    assert_eq!(pass.report.failures[0].key, slug("keep"));
    let kept = h.index.get(&addr("public::keep")).await.unwrap().unwrap();
    assert_eq!(kept.memo.body, "first draft");
    assert_eq!(h.index.read_metadata(SPHERE_VERSION_KEY).await.unwrap(), watermark);

    flaky.fail_reads_of(None);
    let pass = h.orchestrator.index_sphere().await.unwrap();
    assert!(pass.report.is_complete());
    assert_eq!((pass.report.upserted, pass.report.unchanged), (1, 1));
    let kept = h.index.get(&addr("public::keep")).await.unwrap().unwrap();
    assert_eq!(kept.memo.body, "second draft");
    assert_eq!(
        h.index.read_metadata(SPHERE_VERSION_KEY).await.unwrap(),
        Some(h.sphere.version().await.unwrap())
    );
}

#[tokio::test]
async fn test_corrupt_schema_is_rebuilt_on_start() {
    let h = harness().await;
    sqlx::query("CREATE TABLE metadata (x INTEGER)")
        .execute(h.index.pool())
        .await
        .unwrap();
    h.write_file("kept.subtext", "Kept", "survives the rebuild");

    let mut states = h.orchestrator.subscribe();
    let summary = h.orchestrator.start().await.unwrap();
    assert_eq!(*states.borrow_and_update(), SyncState::Ready);
    assert_eq!(summary.local.unwrap().upserted, 1);
    assert_eq!(h.index.search("survives", 5).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_external_edits_are_picked_up() {
    let h = harness().await;
    h.write_file("edited.subtext", "Edited", "before");
    let doomed = h.write_file("doomed.subtext", "Doomed", "bye");
    h.orchestrator.start().await.unwrap();

    let edited = h.write_file("edited.subtext", "Edited", "after the edit");
    set_mtime(&edited, 10);
    std::fs::remove_file(doomed).unwrap();

    let report = h.orchestrator.index_local().await.unwrap();
    assert_eq!(report.upserted, 1);
    assert_eq!(report.removed, 1);
    assert!(report.is_complete());
    assert_eq!(
        addresses(&h.index.search("after edit", 5).await.unwrap()),
        vec!["local::edited"]
    );
    assert!(h.index.search("before", 5).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_write_through_agrees_with_next_pass() {
    let h = harness().await;
    h.orchestrator.start().await.unwrap();
    let service = h.note_service();

    service
        .write_memo(&addr("local::journal"), Memo::new("Journal", "dear diary", Utc::now()))
        .await
        .unwrap();
    service
        .write_memo(&addr("public::essay"), Memo::new("Essay", "on notes", Utc::now()))
        .await
        .unwrap();
    assert!(h.root.join("journal.subtext").is_file());

    let summary = h.orchestrator.sync_all().await.unwrap();
    let local = summary.local.unwrap();
    assert_eq!((local.upserted, local.unchanged), (0, 1));
    let sphere = summary.sphere.unwrap().report;
    assert_eq!((sphere.upserted, sphere.unchanged), (0, 1));
    assert_eq!(service.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_read_after_write_reports_same_modified() {
    let h = harness().await;
    h.orchestrator.start().await.unwrap();
    let service = h.note_service();
    let address = addr("local::clock");

    for round in 0..8 {
        let body = format!("round {round}");
        let written = service
            .write_memo(&address, Memo::new("Clock", &body, Utc::now()))
            .await
            .unwrap();
        let read = service.read_memo(&address).await.unwrap();
        assert_eq!(read.body, body);
        assert_eq!(read.modified, written.memo.modified);
        tokio::time::sleep(Duration::from_millis(130)).await;
    }
}

#[tokio::test]
async fn test_audience_change_moves_file_into_sphere() {
    let h = harness().await;
    h.orchestrator.start().await.unwrap();
    let service = h.note_service();
    service
        .write_memo(&addr("local::draft"), Memo::new("Draft", "ready to share", Utc::now()))
        .await
        .unwrap();

    let entry = service
        .update_audience(&addr("local::draft"), Audience::Public)
        .await
        .unwrap();
    assert_eq!(entry.address, addr("public::draft"));
    assert!(!h.root.join("draft.subtext").exists());
    assert_eq!(
        h.sphere.read(&slug("draft")).await.unwrap().body,
        "ready to share"
    );

    let summary = h.orchestrator.sync_all().await.unwrap();
    assert_eq!(summary.local.unwrap().removed, 0);
    assert_eq!(summary.sphere.unwrap().report.upserted, 0);
    assert_eq!(
        addresses(&service.search("share", 5).await.unwrap()),
        vec!["public::draft"]
    );
}

#[tokio::test]
async fn test_open_from_config_without_gateway() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("notes");
    std::fs::create_dir_all(root.join("drafts")).unwrap();
    std::fs::write(root.join("a.subtext"), "plain a").unwrap();
    std::fs::write(root.join("drafts/b.subtext"), "plain b").unwrap();

    let config = Config {
        db: DbConfig {
            path: tmp.path().join("data/index.sqlite"),
        },
        notes: NotesConfig {
            root,
            extension: "subtext".to_string(),
            exclude_globs: vec!["drafts/**".to_string()],
        },
        sync: SyncConfig {
            interval_secs: 0,
            gateway: false,
        },
    };
    let sphere = Arc::new(MemorySphere::new(IDENTITY));
    sphere.set_offline(true).unwrap();

    let orchestrator = SyncOrchestrator::open(&config, sphere).await.unwrap();
    let summary = orchestrator.start().await.unwrap();
    assert!(summary.gateway_version.is_none());
    assert!(summary.gateway_error.is_none());
    assert!(summary.is_complete());
    assert_eq!(orchestrator.services().index.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_periodic_sync_picks_up_new_notes() {
    let h = harness().await;
    h.orchestrator.start().await.unwrap();
    let index = h.index.clone();
    h.write_file("later.subtext", "Later", "written after start");

    let Harness {
        _tmp: tmp,
        orchestrator,
        ..
    } = h;
    let orchestrator = Arc::new(orchestrator);
    let handle = spawn_periodic(orchestrator.clone(), Duration::from_millis(20));

    let mut indexed = false;
    for _ in 0..100 {
        if index.count().await.unwrap() == 1 {
            indexed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    handle.abort();
    assert!(indexed);
    drop(tmp);
}
