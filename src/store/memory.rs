// src/store/memory.rs
//! In-process store. Used by tests and dry runs; all state sits behind one
//! `Mutex` so every operation is atomic with respect to the others.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    ArticleStore, Fingerprint, MarkOutcome, NewArticle, ProcessedRecord, RewrittenArticle,
    SaveOutcome, SourceStatus,
};
use crate::error::StoreError;
use crate::ingest::types::Item;

#[derive(Default)]
struct Inner {
    processed: HashMap<Fingerprint, ProcessedRecord>,
    articles: HashMap<Fingerprint, RewrittenArticle>,
    statuses: BTreeMap<String, SourceStatus>,
    next_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of processed marks currently held.
    pub fn processed_count(&self) -> usize {
        self.lock().processed.len()
    }

    pub fn article_count(&self) -> usize {
        self.lock().articles.len()
    }

    pub fn is_marked(&self, fingerprint: &Fingerprint) -> bool {
        self.lock().processed.contains_key(fingerprint)
    }

    /// Inserts a mark with an explicit timestamp (simulates a crashed run).
    pub fn insert_mark_at(&self, item: &Item, marked_at: DateTime<Utc>) -> MarkOutcome {
        let mut g = self.lock();
        let record = ProcessedRecord::from_item(item, marked_at);
        if g.processed.contains_key(&record.fingerprint) {
            return MarkOutcome::AlreadyProcessed;
        }
        g.processed.insert(record.fingerprint.clone(), record);
        MarkOutcome::Accepted
    }
}

#[async_trait]
impl ArticleStore for MemoryStore {
    async fn mark_processed(&self, item: &Item) -> Result<MarkOutcome, StoreError> {
        Ok(self.insert_mark_at(item, Utc::now()))
    }

    async fn release_processed(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        let mut g = self.lock();
        if g.articles.contains_key(fingerprint) {
            return Ok(false);
        }
        Ok(g.processed.remove(fingerprint).is_some())
    }

    async fn release_stranded(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut g = self.lock();
        let Inner {
            processed, articles, ..
        } = &mut *g;
        let before = processed.len();
        processed.retain(|fp, rec| rec.marked_at >= cutoff || articles.contains_key(fp));
        Ok(before - processed.len())
    }

    async fn get_rewritten(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<RewrittenArticle>, StoreError> {
        Ok(self.lock().articles.get(fingerprint).cloned())
    }

    async fn save_rewritten(&self, article: NewArticle) -> Result<SaveOutcome, StoreError> {
        let mut g = self.lock();
        if g.articles.contains_key(&article.fingerprint) {
            return Ok(SaveOutcome::Duplicate);
        }
        g.next_id += 1;
        let stored = RewrittenArticle {
            id: g.next_id,
            fingerprint: article.fingerprint.clone(),
            title: article.title,
            link: article.link,
            content: article.content,
            published_at: article.published_at,
            category: article.category,
            created_at: Utc::now(),
        };
        g.articles.insert(article.fingerprint, stored.clone());
        Ok(SaveOutcome::Inserted(stored))
    }

    async fn list_rewritten(&self, limit: usize) -> Result<Vec<RewrittenArticle>, StoreError> {
        let g = self.lock();
        let mut out: Vec<RewrittenArticle> = g.articles.values().cloned().collect();
        out.sort_by(|a, b| b.id.cmp(&a.id));
        out.truncate(limit);
        Ok(out)
    }

    async fn record_status(&self, status: SourceStatus) -> Result<(), StoreError> {
        self.lock()
            .statuses
            .insert(status.source_url.clone(), status);
        Ok(())
    }

    async fn statuses(&self) -> Result<Vec<SourceStatus>, StoreError> {
        Ok(self.lock().statuses.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn item(title: &str, date: &str, link: &str) -> Item {
        Item {
            title: title.into(),
            link: link.into(),
            summary: String::new(),
            published_at: date.into(),
        }
    }

    fn article_for(it: &Item, content: &str) -> NewArticle {
        NewArticle {
            fingerprint: it.fingerprint(),
            title: it.title.clone(),
            link: it.link.clone(),
            content: content.into(),
            published_at: it.published_at.clone(),
            category: None,
        }
    }

    #[tokio::test]
    async fn same_title_and_date_is_accepted_once() {
        let store = MemoryStore::new();
        let a = item("A", "2024-01-01", "https://x/1");
        let b = item("A", "2024-01-01", "https://y/2");
        assert_eq!(store.mark_processed(&a).await.unwrap(), MarkOutcome::Accepted);
        assert_eq!(
            store.mark_processed(&b).await.unwrap(),
            MarkOutcome::AlreadyProcessed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_marks_accept_exactly_one() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let it = item("Race", "2024-02-02", &format!("https://src{i}/"));
                store.mark_processed(&it).await.unwrap()
            }));
        }
        let mut accepted = 0;
        for h in handles {
            if h.await.unwrap() == MarkOutcome::Accepted {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
    }

    #[tokio::test]
    async fn second_save_is_dropped() {
        let store = MemoryStore::new();
        let it = item("A", "d", "l");
        let first = store.save_rewritten(article_for(&it, "one")).await.unwrap();
        assert!(matches!(first, SaveOutcome::Inserted(_)));
        let second = store.save_rewritten(article_for(&it, "two")).await.unwrap();
        assert_eq!(second, SaveOutcome::Duplicate);
        let got = store.get_rewritten(&it.fingerprint()).await.unwrap().unwrap();
        assert_eq!(got.content, "one");
    }

    #[tokio::test]
    async fn release_keeps_marks_that_have_articles() {
        let store = MemoryStore::new();
        let done = item("done", "d", "l");
        let open = item("open", "d", "l");
        store.mark_processed(&done).await.unwrap();
        store.mark_processed(&open).await.unwrap();
        store.save_rewritten(article_for(&done, "c")).await.unwrap();

        assert!(!store.release_processed(&done.fingerprint()).await.unwrap());
        assert!(store.release_processed(&open.fingerprint()).await.unwrap());
        assert!(store.is_marked(&done.fingerprint()));
        assert!(!store.is_marked(&open.fingerprint()));
    }

    #[tokio::test]
    async fn stranded_marks_older_than_cutoff_are_released() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let old = item("old", "d", "l");
        let fresh = item("fresh", "d", "l");
        let old_done = item("old-done", "d", "l");
        store.insert_mark_at(&old, now - chrono::Duration::hours(2));
        store.insert_mark_at(&old_done, now - chrono::Duration::hours(2));
        store.insert_mark_at(&fresh, now);
        store
            .save_rewritten(article_for(&old_done, "c"))
            .await
            .unwrap();

        let released = store
            .release_stranded(now - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(released, 1);
        assert!(!store.is_marked(&old.fingerprint()));
        assert!(store.is_marked(&fresh.fingerprint()));
        assert!(store.is_marked(&old_done.fingerprint()));
    }

    #[tokio::test]
    async fn status_upsert_latest_wins() {
        let store = MemoryStore::new();
        let t = Utc::now();
        for (ok, reason) in [(false, "HTTP 500"), (true, "ok")] {
            store
                .record_status(SourceStatus {
                    source_url: "https://feed".into(),
                    last_checked_at: t,
                    ok,
                    reason: reason.into(),
                })
                .await
                .unwrap();
        }
        let all = store.statuses().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].ok);
    }
}
