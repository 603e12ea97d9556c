//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "data/notebook.sqlite"
//!
//! [notes]
//! root = "notes"
//! extension = "subtext"
//! exclude_globs = ["drafts/**"]
//!
//! [sync]
//! interval_secs = 300
//! gateway = true
//! ```

use anyhow::{Context, Result};
use globset::Glob;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub notes: NotesConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotesConfig {
    pub root: PathBuf,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_extension() -> String {
    notebook_sync_core::memo::DEFAULT_FILE_EXTENSION.to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Periodic sync interval. `0` disables the timer.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Whether passes call the sphere gateway before indexing.
    #[serde(default = "default_gateway")]
    pub gateway: bool,
}

impl SyncConfig {
    /// The periodic sync interval, or `None` when the timer is disabled.
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            gateway: default_gateway(),
        }
    }
}

fn default_interval_secs() -> u64 {
    300
}

fn default_gateway() -> bool {
    true
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let ext = &config.notes.extension;
    if ext.is_empty() {
        anyhow::bail!("notes.extension must not be empty");
    }
    if ext.contains('.') || ext.contains('/') {
        anyhow::bail!("notes.extension must be a bare extension without dots: '{}'", ext);
    }

    for pattern in &config.notes.exclude_globs {
        Glob::new(pattern)
            .with_context(|| format!("Invalid notes.exclude_globs pattern: '{}'", pattern))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Config {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(
            r#"
[db]
path = "/tmp/n.sqlite"

[notes]
root = "/tmp/notes"
"#,
        );
        assert_eq!(config.notes.extension, "subtext");
        assert!(config.notes.exclude_globs.is_empty());
        assert_eq!(config.sync.interval(), Some(Duration::from_secs(300)));
        assert!(config.sync.gateway);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_rejects_dotted_extension() {
        let config = parse(
            r#"
[db]
path = "/tmp/n.sqlite"

[notes]
root = "/tmp/notes"
extension = ".md"
"#,
        );
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_rejects_bad_glob() {
        let config = parse(
            r#"
[db]
path = "/tmp/n.sqlite"

[notes]
root = "/tmp/notes"
exclude_globs = ["a/[b"]
"#,
        );
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("notebook.toml");
        std::fs::write(
            &path,
            r#"
[db]
path = "/tmp/n.sqlite"

[notes]
root = "/tmp/notes"
extension = "md"

[sync]
interval_secs = 0
gateway = false
"#,
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.notes.extension, "md");
        assert_eq!(config.sync.interval(), None);
        assert!(!config.sync.gateway);
    }
}
