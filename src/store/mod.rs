// src/store/mod.rs
//! Fingerprint ledger, rewritten-article storage and feed status table.
//!
//! Every mutation is a single unique insert or upsert. The uniqueness check of
//! `mark_processed` is what serializes concurrent pipeline runs: no caller
//! takes an in-process lock around it, so two processes sharing one database
//! get the same at-most-once guarantee as two tasks sharing one store object.

pub mod memory;
pub mod sqlite;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StoreError;
use crate::ingest::types::Item;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Identity of a logical article: hex SHA-256 over `title` followed by the
/// publication date string, with no separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(title: &str, published_at: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(title.as_bytes());
        hasher.update(published_at.as_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(64);
        for b in digest.iter() {
            use std::fmt::Write as _;
            let _ = write!(&mut out, "{:02x}", b);
        }
        Self(out)
    }

    /// Wraps an already computed digest (e.g. read back from the database).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Accepted,
    AlreadyProcessed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessedRecord {
    pub fingerprint: Fingerprint,
    pub title: String,
    pub link: String,
    pub published_at: String,
    pub marked_at: DateTime<Utc>,
}

impl ProcessedRecord {
    pub fn from_item(item: &Item, marked_at: DateTime<Utc>) -> Self {
        Self {
            fingerprint: item.fingerprint(),
            title: item.title.clone(),
            link: item.link.clone(),
            published_at: item.published_at.clone(),
            marked_at,
        }
    }
}

/// A rewrite ready to be persisted; the store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewArticle {
    pub fingerprint: Fingerprint,
    pub title: String,
    pub link: String,
    pub content: String,
    pub published_at: String,
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewrittenArticle {
    pub id: i64,
    pub fingerprint: Fingerprint,
    pub title: String,
    pub link: String,
    pub content: String,
    pub published_at: String,
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted(RewrittenArticle),
    /// Another writer stored this fingerprint first; the new article was dropped.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub source_url: String,
    pub last_checked_at: DateTime<Utc>,
    pub ok: bool,
    pub reason: String,
}

#[async_trait]
pub trait ArticleStore: Send + Sync {
    /// Unique insert of a `ProcessedRecord`. Exactly one concurrent caller per
    /// fingerprint observes `Accepted`.
    async fn mark_processed(&self, item: &Item) -> Result<MarkOutcome, StoreError>;

    /// Drops the processed mark if no rewritten article exists for it.
    /// Returns whether a mark was removed.
    async fn release_processed(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError>;

    /// Drops every mark older than `cutoff` that never produced an article.
    async fn release_stranded(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn get_rewritten(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<RewrittenArticle>, StoreError>;

    async fn save_rewritten(&self, article: NewArticle) -> Result<SaveOutcome, StoreError>;

    /// Newest first.
    async fn list_rewritten(&self, limit: usize) -> Result<Vec<RewrittenArticle>, StoreError>;

    /// Upsert keyed by `source_url`; the latest write wins.
    async fn record_status(&self, status: SourceStatus) -> Result<(), StoreError>;

    async fn statuses(&self) -> Result<Vec<SourceStatus>, StoreError>;
}
