//! # Notebook Sync
//!
//! Keeps a notebook's three stores consistent: local note files, a
//! versioned public "sphere", and a SQLite full-text index derived from
//! both.
//!
//! The filesystem leads for local notes and the sphere leads for public
//! notes. The index follows and can always be rebuilt from them. Divergence
//! is detected with cheap `(key, modified, size)` fingerprints and resolved
//! leader-wins.
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────┐            ┌──────────┐   gateway
//!   │  notes/  │            │  sphere  │◀──────────▶ remote
//!   │  (files) │            │(versions)│
//!   └────┬─────┘            └────┬─────┘
//!        │ index_local           │ index_sphere (delta since watermark)
//!        ▼                       ▼
//!   ┌──────────────────────────────────┐
//!   │   SQLite index (memo + FTS5)     │
//!   └──────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`index`] | SQLite index store with full-text search |
//! | [`fs_store`] | Filesystem note store |
//! | [`service`] | Write-through note operations |
//! | [`sync`] | Index lifecycle and sync passes |
//! | [`logging`] | Tracing subscriber setup |
//!
//! Store-agnostic logic (fingerprints, change classification,
//! reconciliation, routing) lives in [`notebook_sync_core`].

pub mod config;
pub mod db;
pub mod fs_store;
pub mod index;
pub mod logging;
pub mod migrate;
pub mod service;
pub mod sync;

pub use notebook_sync_core;

pub use config::{load_config, Config};
pub use fs_store::FsNoteStore;
pub use index::SqliteIndex;
pub use service::NoteService;
pub use sync::{spawn_periodic, Services, SyncError, SyncOrchestrator, SyncState, SyncSummary};
