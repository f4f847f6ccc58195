// src/ingest/registry.rs
//! Feed source liveness. Statuses live in the shared store so every pipeline
//! instance sees the same view; a later successful check restores a source.
//! A failing source is left out of runs only until its last check is older
//! than the recheck cool-down, then it is tried again.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::store::{ArticleStore, SourceStatus};

const HEALTH_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct SourceRegistry {
    store: Arc<dyn ArticleStore>,
    health_tx: broadcast::Sender<SourceStatus>,
}

impl SourceRegistry {
    pub fn new(store: Arc<dyn ArticleStore>) -> Self {
        let (health_tx, _) = broadcast::channel(HEALTH_CHANNEL_CAPACITY);
        Self { store, health_tx }
    }

    /// Upserts the status and publishes it on the health channel.
    pub async fn record_status(
        &self,
        source_url: &str,
        ok: bool,
        reason: impl Into<String>,
    ) -> Result<SourceStatus, StoreError> {
        let status = SourceStatus {
            source_url: source_url.to_string(),
            last_checked_at: Utc::now(),
            ok,
            reason: reason.into(),
        };
        self.store.record_status(status.clone()).await?;
        // No receivers is fine.
        let _ = self.health_tx.send(status.clone());
        Ok(status)
    }

    pub async fn list_unhealthy(&self) -> Result<HashSet<String>, StoreError> {
        Ok(self
            .store
            .statuses()
            .await?
            .into_iter()
            .filter(|s| !s.ok)
            .map(|s| s.source_url)
            .collect())
    }

    /// Failing sources checked after `since`.
    pub async fn list_cooling_down(
        &self,
        since: DateTime<Utc>,
    ) -> Result<HashSet<String>, StoreError> {
        Ok(self
            .store
            .statuses()
            .await?
            .into_iter()
            .filter(|s| !s.ok && s.last_checked_at > since)
            .map(|s| s.source_url)
            .collect())
    }

    /// Splits `sources` into (live, skipped) keeping the configured order.
    /// Failing sources whose last check is older than `recheck_after` count as
    /// live so they get validated again.
    pub async fn partition(
        &self,
        sources: &[String],
        recheck_after: Duration,
    ) -> Result<(Vec<String>, Vec<String>), StoreError> {
        let since = TimeDelta::from_std(recheck_after)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let skipped = self.list_cooling_down(since).await?;
        Ok(sources
            .iter()
            .cloned()
            .partition(|s| !skipped.contains(s)))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SourceStatus> {
        self.health_tx.subscribe()
    }
}
