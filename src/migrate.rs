//! Index schema migrations.
//!
//! Migrations are registered in strictly increasing order and tracked via
//! `PRAGMA user_version`. All pending migrations run inside one transaction:
//! either the schema reaches the latest version or nothing changes.
//!
//! The index is a disposable projection of the note stores, so
//! [`rebuild`] may drop everything and start over.

use anyhow::{bail, Context, Result};
use sqlx::{Executor, SqlitePool};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
struct Migration {
    version: u32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: r#"
        CREATE TABLE memo (
            slug TEXT NOT NULL,
            audience TEXT NOT NULL CHECK (audience IN ('local', 'public')),
            content_type TEXT NOT NULL,
            created INTEGER NOT NULL,
            modified INTEGER NOT NULL,
            title TEXT NOT NULL,
            file_extension TEXT NOT NULL,
            headers_json TEXT NOT NULL DEFAULT '[]',
            body TEXT NOT NULL,
            excerpt TEXT NOT NULL DEFAULT '',
            size INTEGER NOT NULL,
            PRIMARY KEY (slug, audience)
        );

        CREATE VIRTUAL TABLE memo_fts USING fts5(
            slug UNINDEXED,
            audience UNINDEXED,
            title,
            body
        );

        CREATE TABLE metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    },
    Migration {
        version: 2,
        sql: r#"
        CREATE INDEX idx_memo_modified ON memo(modified DESC);
        CREATE INDEX idx_memo_audience ON memo(audience);
        "#,
    },
];

/// Tables dropped by [`rebuild`]. Dropping `memo_fts` also drops its
/// shadow tables.
const TABLES: &[&str] = &["memo_fts", "memo", "metadata"];

/// Returns the latest migration version known by this binary.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |migration| migration.version)
}

/// Returns the schema version recorded in the database.
pub async fn current_version(pool: &SqlitePool) -> Result<u32> {
    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await?;
    u32::try_from(version).with_context(|| format!("invalid user_version: {version}"))
}

/// Applies all pending migrations in one transaction and returns the
/// resulting schema version.
///
/// Fails without changes if the database is newer than this binary.
pub async fn run_migrations(pool: &SqlitePool) -> Result<u32> {
    let current = current_version(pool).await?;
    let latest = latest_version();

    if current > latest {
        bail!("index schema version {current} is newer than supported {latest}");
    }
    if current == latest {
        return Ok(current);
    }

    let mut tx = pool.begin().await?;
    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        tx.execute(sqlx::raw_sql(migration.sql))
            .await
            .with_context(|| format!("migration {} failed", migration.version))?;
        sqlx::query(&format!("PRAGMA user_version = {}", migration.version))
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    info!(from = current, to = latest, "index migrated");
    Ok(latest)
}

/// Drops every index table and migrates from scratch.
pub async fn rebuild(pool: &SqlitePool) -> Result<u32> {
    warn!("rebuilding index from scratch");
    let mut tx = pool.begin().await?;
    for table in TABLES {
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query("PRAGMA user_version = 0")
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    run_migrations(pool).await
}
