//! SQLite-backed [`IndexStore`] and [`Migrator`].
//!
//! Each indexed note is one `memo` row keyed by `(slug, audience)` plus a
//! mirror row in the `memo_fts` full-text table. Both are written in one
//! transaction so a reader never sees a body that disagrees with its
//! fingerprint fields.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use notebook_sync_core::fingerprint::{datetime_seconds, seconds_to_datetime};
use notebook_sync_core::memo::Header;
use notebook_sync_core::store::{IndexEntry, IndexStore, Migrator};
use notebook_sync_core::{Address, Audience, Fingerprint, Memo, Slug};

use crate::config::Config;
use crate::db;
use crate::migrate;

/// Characters of body text kept in the `excerpt` column.
const EXCERPT_CHARS: usize = 280;

const SELECT_ENTRY: &str = r#"
    SELECT m.slug, m.audience, m.content_type, m.created, m.modified, m.title,
           m.file_extension, m.headers_json, m.body, m.size
    FROM memo m
"#;

/// SQLite implementation of the search index.
#[derive(Clone)]
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens the configured database. The schema is not migrated here.
    pub async fn open(config: &Config) -> Result<Self> {
        Ok(Self::new(db::connect(config).await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Builds an FTS5 query that matches every whitespace-separated term.
///
/// Terms are quoted, so operators and punctuation in user input are
/// searched for literally instead of being parsed as FTS syntax.
pub fn fts_query(input: &str) -> Option<String> {
    let terms: Vec<String> = input
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

fn row_to_entry(row: &SqliteRow) -> Result<IndexEntry> {
    let slug: String = row.try_get("slug")?;
    let audience: String = row.try_get("audience")?;
    let headers_json: String = row.try_get("headers_json")?;
    let created: i64 = row.try_get("created")?;
    let modified: i64 = row.try_get("modified")?;
    let size: i64 = row.try_get("size")?;

    let additional_headers: Vec<Header> = serde_json::from_str(&headers_json)
        .with_context(|| format!("invalid headers_json for {audience}::{slug}"))?;
    let memo = Memo {
        content_type: row.try_get("content_type")?,
        created: seconds_to_datetime(created),
        modified: seconds_to_datetime(modified),
        title: row.try_get("title")?,
        file_extension: row.try_get("file_extension")?,
        additional_headers,
        body: row.try_get("body")?,
    };
    let address = Address::new(Slug::new(slug)?, audience.parse()?);
    Ok(IndexEntry::new(address, memo, u64::try_from(size)?))
}

fn rows_to_entries(rows: &[SqliteRow]) -> Result<Vec<IndexEntry>> {
    rows.iter().map(row_to_entry).collect()
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl IndexStore for SqliteIndex {
    async fn fingerprints(&self, audience: Audience) -> Result<Vec<Fingerprint<Slug>>> {
        let rows = sqlx::query("SELECT slug, modified, size FROM memo WHERE audience = ?")
            .bind(audience.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let slug: String = row.try_get("slug")?;
                let modified: i64 = row.try_get("modified")?;
                let size: i64 = row.try_get("size")?;
                Ok(Fingerprint::new(Slug::new(slug)?, modified, u64::try_from(size)?))
            })
            .collect()
    }

    async fn get(&self, address: &Address) -> Result<Option<IndexEntry>> {
        let row = sqlx::query(&format!("{SELECT_ENTRY} WHERE m.slug = ? AND m.audience = ?"))
            .bind(address.slug.as_str())
            .bind(address.audience.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_entry).transpose()
    }

    async fn upsert(&self, entry: &IndexEntry) -> Result<()> {
        let memo = &entry.memo;
        let slug = entry.address.slug.as_str();
        let audience = entry.address.audience.as_str();
        let headers_json = serde_json::to_string(&memo.additional_headers)?;
        let size = i64::try_from(entry.size)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO memo (slug, audience, content_type, created, modified, title,
                              file_extension, headers_json, body, excerpt, size)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(slug, audience) DO UPDATE SET
                content_type = excluded.content_type,
                created = excluded.created,
                modified = excluded.modified,
                title = excluded.title,
                file_extension = excluded.file_extension,
                headers_json = excluded.headers_json,
                body = excluded.body,
                excerpt = excluded.excerpt,
                size = excluded.size
            "#,
        )
        .bind(slug)
        .bind(audience)
        .bind(&memo.content_type)
        .bind(datetime_seconds(memo.created))
        .bind(datetime_seconds(memo.modified))
        .bind(&memo.title)
        .bind(&memo.file_extension)
        .bind(&headers_json)
        .bind(&memo.body)
        .bind(memo.excerpt(EXCERPT_CHARS))
        .bind(size)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM memo_fts WHERE slug = ? AND audience = ?")
            .bind(slug)
            .bind(audience)
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO memo_fts (slug, audience, title, body) VALUES (?, ?, ?, ?)")
            .bind(slug)
            .bind(audience)
            .bind(&memo.title)
            .bind(&memo.body)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn remove(&self, address: &Address) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM memo_fts WHERE slug = ? AND audience = ?")
            .bind(address.slug.as_str())
            .bind(address.audience.as_str())
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM memo WHERE slug = ? AND audience = ?")
            .bind(address.slug.as_str())
            .bind(address.audience.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<IndexEntry>> {
        let Some(fts) = fts_query(query) else {
            return self.recent(limit).await;
        };

        let rows = sqlx::query(&format!(
            r#"{SELECT_ENTRY}
            JOIN memo_fts ON memo_fts.slug = m.slug AND memo_fts.audience = m.audience
            WHERE memo_fts MATCH ?
            ORDER BY bm25(memo_fts), m.modified DESC
            LIMIT ?
            "#
        ))
        .bind(&fts)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;

        rows_to_entries(&rows)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<IndexEntry>> {
        let rows = sqlx::query(&format!(
            "{SELECT_ENTRY} ORDER BY m.modified DESC, m.audience, m.slug LIMIT ?"
        ))
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;

        rows_to_entries(&rows)
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM memo")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count)?)
    }

    async fn read_metadata(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn write_metadata_batch(&self, entries: &[(&str, &str)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for &(key, value) in entries {
            sqlx::query(
                r#"
                INSERT INTO metadata (key, value) VALUES (?, ?)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value
                "#,
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl Migrator for SqliteIndex {
    async fn migrate(&self) -> Result<u32> {
        migrate::run_migrations(&self.pool).await
    }

    async fn rebuild(&self) -> Result<u32> {
        migrate::rebuild(&self.pool).await
    }
}
