//! Filesystem-backed [`NoteStore`].
//!
//! Each local note is one file at `<root>/<slug>.<extension>`; slugs with
//! `/` map to nested directories. Files whose relative path is not a valid
//! slug, or that match an exclude glob, are invisible to the store.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};
use walkdir::WalkDir;

use notebook_sync_core::fingerprint::{seconds_to_datetime, unix_seconds};
use notebook_sync_core::store::{FileInfo, NoteStore};
use notebook_sync_core::{Memo, Slug};

use crate::config::Config;

/// Local notes stored as files under one root directory.
#[derive(Debug, Clone)]
pub struct FsNoteStore {
    root: PathBuf,
    extension: String,
    excludes: GlobSet,
}

impl FsNoteStore {
    pub fn new(root: impl Into<PathBuf>, extension: &str, exclude_globs: &[String]) -> Result<Self> {
        Ok(Self {
            root: root.into(),
            extension: extension.to_string(),
            excludes: build_globset(exclude_globs)?,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.notes.root,
            &config.notes.extension,
            &config.notes.exclude_globs,
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file backing `slug`.
    pub fn path(&self, slug: &Slug) -> PathBuf {
        self.root.join(format!("{}.{}", slug, self.extension))
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Walks `root` and returns the slug of every note file.
fn scan(root: &Path, extension: &str, excludes: &GlobSet) -> Result<Vec<Slug>> {
    if !root.is_dir() {
        bail!("notes root does not exist: {}", root.display());
    }

    let suffix = format!(".{extension}");
    let mut slugs = Vec::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if excludes.is_match(&rel_str) {
            continue;
        }
        let Some(stem) = rel_str.strip_suffix(&suffix) else {
            continue;
        };
        match Slug::new(stem) {
            Ok(slug) => slugs.push(slug),
            Err(e) => debug!(path = %rel_str, error = %e, "ignoring file without a valid slug"),
        }
    }

    slugs.sort();
    Ok(slugs)
}

#[async_trait]
impl NoteStore for FsNoteStore {
    async fn list(&self) -> Result<Vec<Slug>> {
        let root = self.root.clone();
        let extension = self.extension.clone();
        let excludes = self.excludes.clone();
        tokio::task::spawn_blocking(move || scan(&root, &extension, &excludes)).await?
    }

    async fn info(&self, slug: &Slug) -> Result<Option<FileInfo>> {
        let path = self.path(slug);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to stat {}", path.display()))
            }
        };
        if !metadata.is_file() {
            return Ok(None);
        }
        Ok(Some(FileInfo {
            modified: unix_seconds(metadata.modified()?),
            size: metadata.len(),
        }))
    }

    async fn read(&self, slug: &Slug) -> Result<Option<Memo>> {
        let path = self.path(slug);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        let mtime = tokio::fs::metadata(&path).await?.modified()?;
        let modified = seconds_to_datetime(unix_seconds(mtime));
        let mut memo = Memo::parse(&text, slug, modified)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        // The file's mtime wins over the `Modified` header, matching `info`.
        memo.modified = modified;
        Ok(Some(memo))
    }

    async fn write(&self, slug: &Slug, memo: &Memo) -> Result<()> {
        let path = self.path(slug);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write beside the target and rename so readers never see a torn file.
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(".{file_name}.tmp"));
        tokio::fs::write(&tmp, memo.to_file_string())
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to replace {}", path.display()))?;

        debug!(%slug, path = %path.display(), "wrote note file");
        Ok(())
    }

    async fn remove(&self, slug: &Slug) -> Result<()> {
        let path = self.path(slug);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(%slug, path = %path.display(), "removed note file");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
        }
    }
}
