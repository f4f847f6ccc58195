// src/store/sqlite.rs
//! SQLite-backed store. Uniqueness is enforced by the schema; the number of
//! rows touched by `INSERT .. ON CONFLICT DO NOTHING` is the verdict.
//! Timestamps are stored as unix milliseconds so range deletes compare numbers.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use super::{
    ArticleStore, Fingerprint, MarkOutcome, NewArticle, RewrittenArticle, SaveOutcome,
    SourceStatus,
};
use crate::error::StoreError;
use crate::ingest::types::Item;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS processed_articles (
        fingerprint TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        link TEXT NOT NULL,
        published_at TEXT NOT NULL,
        marked_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rewritten_articles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        fingerprint TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL,
        link TEXT NOT NULL,
        content TEXT NOT NULL,
        published_at TEXT NOT NULL,
        category TEXT,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS feed_status (
        source_url TEXT PRIMARY KEY,
        last_checked_at INTEGER NOT NULL,
        ok INTEGER NOT NULL,
        reason TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_processed_marked_at ON processed_articles(marked_at)",
];

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `url` and applies the schema.
    /// Accepts `sqlite://path.db` and `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .journal_mode(if in_memory {
                SqliteJournalMode::Memory
            } else {
                SqliteJournalMode::Wal
            });

        // An in-memory database lives and dies with its single connection.
        let pool_opts = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_opts.connect_with(options).await?;
        let store = Self { pool };
        store.migrate().await?;
        debug!(target: "store", url, "sqlite store ready");
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn article_from_row(row: &SqliteRow) -> Result<RewrittenArticle, sqlx::Error> {
    Ok(RewrittenArticle {
        id: row.try_get("id")?,
        fingerprint: Fingerprint::from_hex(row.try_get::<String, _>("fingerprint")?),
        title: row.try_get("title")?,
        link: row.try_get("link")?,
        content: row.try_get("content")?,
        published_at: row.try_get("published_at")?,
        category: row.try_get("category")?,
        created_at: from_millis(row.try_get("created_at")?),
    })
}

#[async_trait]
impl ArticleStore for SqliteStore {
    async fn mark_processed(&self, item: &Item) -> Result<MarkOutcome, StoreError> {
        let fp = item.fingerprint();
        let res = sqlx::query(
            r#"
            INSERT INTO processed_articles (fingerprint, title, link, published_at, marked_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(fingerprint) DO NOTHING
            "#,
        )
        .bind(fp.as_str())
        .bind(&item.title)
        .bind(&item.link)
        .bind(&item.published_at)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(if res.rows_affected() == 1 {
            MarkOutcome::Accepted
        } else {
            MarkOutcome::AlreadyProcessed
        })
    }

    async fn release_processed(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        let res = sqlx::query(
            r#"
            DELETE FROM processed_articles
            WHERE fingerprint = ?
              AND NOT EXISTS (
                SELECT 1 FROM rewritten_articles r
                WHERE r.fingerprint = processed_articles.fingerprint
              )
            "#,
        )
        .bind(fingerprint.as_str())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn release_stranded(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let res = sqlx::query(
            r#"
            DELETE FROM processed_articles
            WHERE marked_at < ?
              AND NOT EXISTS (
                SELECT 1 FROM rewritten_articles r
                WHERE r.fingerprint = processed_articles.fingerprint
              )
            "#,
        )
        .bind(to_millis(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() as usize)
    }

    async fn get_rewritten(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<RewrittenArticle>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, fingerprint, title, link, content, published_at, category, created_at
            FROM rewritten_articles
            WHERE fingerprint = ?
            "#,
        )
        .bind(fingerprint.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(article_from_row).transpose()?)
    }

    async fn save_rewritten(&self, article: NewArticle) -> Result<SaveOutcome, StoreError> {
        let created_at = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO rewritten_articles
                (fingerprint, title, link, content, published_at, category, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(fingerprint) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(article.fingerprint.as_str())
        .bind(&article.title)
        .bind(&article.link)
        .bind(&article.content)
        .bind(&article.published_at)
        .bind(&article.category)
        .bind(to_millis(created_at))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(SaveOutcome::Duplicate);
        };
        Ok(SaveOutcome::Inserted(RewrittenArticle {
            id: row.try_get("id")?,
            fingerprint: article.fingerprint,
            title: article.title,
            link: article.link,
            content: article.content,
            published_at: article.published_at,
            category: article.category,
            created_at: from_millis(to_millis(created_at)),
        }))
    }

    async fn list_rewritten(&self, limit: usize) -> Result<Vec<RewrittenArticle>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, fingerprint, title, link, content, published_at, category, created_at
            FROM rewritten_articles
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| article_from_row(r).map_err(StoreError::from))
            .collect()
    }

    async fn record_status(&self, status: SourceStatus) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO feed_status (source_url, last_checked_at, ok, reason)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(source_url) DO UPDATE SET
                last_checked_at = excluded.last_checked_at,
                ok = excluded.ok,
                reason = excluded.reason
            "#,
        )
        .bind(&status.source_url)
        .bind(to_millis(status.last_checked_at))
        .bind(status.ok)
        .bind(&status.reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn statuses(&self) -> Result<Vec<SourceStatus>, StoreError> {
        let rows = sqlx::query(
            "SELECT source_url, last_checked_at, ok, reason FROM feed_status ORDER BY source_url",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            out.push(SourceStatus {
                source_url: r.try_get("source_url")?,
                last_checked_at: from_millis(r.try_get("last_checked_at")?),
                ok: r.try_get("ok")?,
                reason: r.try_get("reason")?,
            });
        }
        Ok(out)
    }
}
