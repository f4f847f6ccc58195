// src/ingest/types.rs
use async_trait::async_trait;

use crate::error::FetchError;
use crate::store::Fingerprint;

/// One entry of a syndication feed, as produced by a `FeedFetcher`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct Item {
    pub title: String,
    pub link: String,
    pub summary: String,
    /// Source-provided date string, kept verbatim. May be empty.
    pub published_at: String,
}

impl Item {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.title, &self.published_at)
    }
}

/// Outcome of a reachability + structure check on a feed URL.
/// A successful check carries the raw document so it is not downloaded twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub ok: bool,
    pub reason: String,
    pub payload: Option<String>,
}

impl Validation {
    pub fn passed(payload: String) -> Self {
        Self {
            ok: true,
            reason: "ok".to_string(),
            payload: Some(payload),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: reason.into(),
            payload: None,
        }
    }
}

#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn validate(&self, url: &str) -> Validation;

    /// Returns at most `limit` items. When `payload` is given it is parsed
    /// instead of downloading `url` again.
    async fn fetch(
        &self,
        url: &str,
        limit: usize,
        payload: Option<String>,
    ) -> Result<Vec<Item>, FetchError>;

    fn name(&self) -> &'static str;
}
