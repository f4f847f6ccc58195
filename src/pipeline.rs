// src/pipeline.rs
//! Fetch → dedupe → rewrite.
//!
//! One run fans out over sources, and each source fans out over its items.
//! An item is rewritten only by the caller whose `mark_processed` came back
//! `Accepted`; every other caller serves the stored article or drops the item.
//! Failures stay inside the item or source that produced them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::generate::{Connector, GenerationClient, GenerationSettings};
use crate::ingest::cache::{FreshnessCache, DEFAULT_TTL};
use crate::ingest::rss::DEFAULT_LIMIT;
use crate::ingest::{FeedFetcher, Item, SourceRegistry};
use crate::prompt::PromptTemplate;
use crate::store::{
    ArticleStore, Fingerprint, MarkOutcome, NewArticle, RewrittenArticle, SaveOutcome,
    SourceStatus,
};

pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;
pub const DEFAULT_RECHECK_AFTER: Duration = Duration::from_secs(900);

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub fetch_limit: usize,
    pub cache_ttl: Duration,
    /// Upper bound on generation calls running at once, across all sources.
    pub max_in_flight: usize,
    /// How long a failing source sits out before it is validated again.
    pub recheck_after: Duration,
    pub generation: GenerationSettings,
    pub prompt: PromptTemplate,
}

impl PipelineSettings {
    pub fn new(generation: GenerationSettings) -> Self {
        Self {
            fetch_limit: DEFAULT_LIMIT,
            cache_ttl: DEFAULT_TTL,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            recheck_after: DEFAULT_RECHECK_AFTER,
            generation,
            prompt: PromptTemplate::default(),
        }
    }
}

/// What a report shows for one article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArticleView {
    pub title: String,
    pub link: String,
    pub content: String,
    pub published_at: String,
}

impl From<&RewrittenArticle> for ArticleView {
    fn from(a: &RewrittenArticle) -> Self {
        Self {
            title: a.title.clone(),
            link: a.link.clone(),
            content: a.content.clone(),
            published_at: a.published_at.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub articles: Vec<ArticleView>,
    /// Items rewritten during this run.
    pub rewritten: usize,
    /// Items already rewritten earlier, served from the store.
    pub served: usize,
    /// Items already in flight elsewhere, or marked without an article.
    pub skipped: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SourceReport {
    fn failed_source(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub sources: BTreeMap<String, SourceReport>,
    /// Configured sources left out because their last check failed recently.
    pub skipped_unhealthy: Vec<String>,
    /// Latest recorded status of every configured source.
    pub health: Vec<SourceStatus>,
}

impl RunReport {
    pub fn rewritten(&self) -> usize {
        self.sources.values().map(|s| s.rewritten).sum()
    }

    pub fn failed(&self) -> usize {
        self.sources.values().map(|s| s.failed).sum()
    }

    pub fn article_count(&self) -> usize {
        self.sources.values().map(|s| s.articles.len()).sum()
    }
}

#[derive(Debug)]
enum ItemOutcome {
    Rewritten(RewrittenArticle),
    Served(RewrittenArticle),
    Skipped,
    Failed,
}

impl ItemOutcome {
    fn label(&self) -> &'static str {
        match self {
            ItemOutcome::Rewritten(_) => "rewritten",
            ItemOutcome::Served(_) => "served",
            ItemOutcome::Skipped => "skipped",
            ItemOutcome::Failed => "failed",
        }
    }
}

/// An `Accepted` mark that has not produced an article yet. Dropping it while
/// still armed (task aborted, panic) hands the fingerprint back.
struct PendingMark {
    store: Option<Arc<dyn ArticleStore>>,
    fingerprint: Fingerprint,
}

impl PendingMark {
    fn new(store: Arc<dyn ArticleStore>, fingerprint: Fingerprint) -> Self {
        Self {
            store: Some(store),
            fingerprint,
        }
    }

    fn disarm(&mut self) {
        self.store = None;
    }

    async fn release(mut self) {
        if let Some(store) = self.store.take() {
            release_mark(store.as_ref(), &self.fingerprint).await;
        }
    }
}

impl Drop for PendingMark {
    fn drop(&mut self) {
        let Some(store) = self.store.take() else {
            return;
        };
        let fingerprint = self.fingerprint.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { release_mark(store.as_ref(), &fingerprint).await });
            }
            Err(_) => warn!(
                target: "pipeline",
                fingerprint = fingerprint.short(),
                "no runtime to release abandoned mark; left for reconciliation"
            ),
        }
    }
}

async fn release_mark(store: &dyn ArticleStore, fingerprint: &Fingerprint) {
    match store.release_processed(fingerprint).await {
        Ok(true) => debug!(target: "pipeline", fingerprint = fingerprint.short(), "mark released"),
        Ok(false) => {}
        Err(e) => warn!(
            target: "pipeline",
            fingerprint = fingerprint.short(),
            error = %e,
            "failed to release mark"
        ),
    }
}

struct Inner {
    store: Arc<dyn ArticleStore>,
    registry: SourceRegistry,
    cache: FreshnessCache,
    fetcher: Arc<dyn FeedFetcher>,
    connector: Arc<dyn Connector>,
    permits: Arc<Semaphore>,
    settings: PipelineSettings,
}

#[derive(Clone)]
pub struct RewritePipeline {
    inner: Arc<Inner>,
}

impl RewritePipeline {
    pub fn new(
        store: Arc<dyn ArticleStore>,
        fetcher: Arc<dyn FeedFetcher>,
        connector: Arc<dyn Connector>,
        settings: PipelineSettings,
    ) -> Self {
        let registry = SourceRegistry::new(store.clone());
        let cache = FreshnessCache::new(settings.cache_ttl);
        let permits = Arc::new(Semaphore::new(settings.max_in_flight.max(1)));
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                cache,
                fetcher,
                connector,
                permits,
                settings,
            }),
        }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.inner.registry
    }

    pub fn cache(&self) -> &FreshnessCache {
        &self.inner.cache
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.inner.settings
    }

    pub fn subscribe_health(&self) -> broadcast::Receiver<SourceStatus> {
        self.inner.registry.subscribe()
    }

    /// Hands back marks older than `older_than` that never produced an article.
    /// `older_than` must exceed the longest a single generation can take, or a
    /// mark still being generated elsewhere is handed back too.
    pub async fn reconcile(&self, older_than: Duration) -> Result<usize, StoreError> {
        let cutoff = TimeDelta::from_std(older_than)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let released = self.inner.store.release_stranded(cutoff).await?;
        if released > 0 {
            info!(target: "pipeline", released, "released stranded marks");
        }
        Ok(released)
    }

    /// Like `run`, but gives up after `limit`. In-flight tasks are aborted and
    /// their marks released.
    pub async fn run_with_timeout(&self, sources: &[String], limit: Duration) -> Option<RunReport> {
        match tokio::time::timeout(limit, self.run(sources)).await {
            Ok(report) => Some(report),
            Err(_) => {
                warn!(target: "pipeline", timeout_s = limit.as_secs_f64(), "run timed out, aborted");
                None
            }
        }
    }

    /// One pass over `sources`. Always completes; the report holds whatever
    /// succeeded.
    pub async fn run(&self, sources: &[String]) -> RunReport {
        counter!("pipeline_runs_total").increment(1);

        let (live, skipped) = match self
            .inner
            .registry
            .partition(sources, self.inner.settings.recheck_after)
            .await {
            Ok(split) => split,
            Err(e) => {
                warn!(target: "pipeline", error = %e, "could not read source statuses, trying all sources");
                (sources.to_vec(), Vec::new())
            }
        };
        for url in &skipped {
            info!(target: "pipeline", source = %url, "skipping unhealthy source");
        }

        let mut tasks = JoinSet::new();
        let mut urls = HashMap::new();
        for url in live {
            let this = self.clone();
            let u = url.clone();
            let handle = tasks.spawn(async move { this.process_source(&u).await });
            urls.insert(handle.id(), url);
        }

        let mut report = RunReport {
            skipped_unhealthy: skipped,
            ..RunReport::default()
        };
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, source_report)) => {
                    if let Some(url) = urls.remove(&id) {
                        report.sources.insert(url, source_report);
                    }
                }
                Err(e) => {
                    let url = urls.remove(&e.id()).unwrap_or_default();
                    error!(target: "pipeline", source = %url, error = %e, "source task crashed");
                    report
                        .sources
                        .insert(url, SourceReport::failed_source("source task crashed"));
                }
            }
        }

        let wanted: HashSet<&String> = sources.iter().collect();
        report.health = match self.inner.store.statuses().await {
            Ok(all) => all
                .into_iter()
                .filter(|s| wanted.contains(&s.source_url))
                .collect(),
            Err(e) => {
                warn!(target: "pipeline", error = %e, "could not read source statuses");
                Vec::new()
            }
        };

        info!(
            target: "pipeline",
            sources = report.sources.len(),
            skipped = report.skipped_unhealthy.len(),
            rewritten = report.rewritten(),
            failed = report.failed(),
            "run finished"
        );
        report
    }

    async fn resolve_items(&self, url: &str) -> Result<Vec<Item>, String> {
        let limit = self.inner.settings.fetch_limit;
        let key = FreshnessCache::key(url, Some(limit));
        if let Some(items) = self.inner.cache.get(&key) {
            debug!(target: "pipeline", source = url, items = items.len(), "cache hit");
            return Ok(items);
        }

        let check = self.inner.fetcher.validate(url).await;
        if let Err(e) = self
            .inner
            .registry
            .record_status(url, check.ok, check.reason.clone())
            .await
        {
            warn!(target: "pipeline", source = url, error = %e, "could not record source status");
        }
        if !check.ok {
            counter!("ingest_fetch_errors_total").increment(1);
            warn!(target: "ingest", source = url, reason = %check.reason, "feed failed validation");
            return Err(check.reason);
        }

        match self.inner.fetcher.fetch(url, limit, check.payload).await {
            Ok(items) => {
                if items.len() < limit {
                    warn!(
                        target: "ingest",
                        source = url,
                        got = items.len(),
                        limit,
                        "feed returned fewer items than requested"
                    );
                }
                self.inner
                    .cache
                    .set(key, items.clone(), self.inner.settings.cache_ttl);
                Ok(items)
            }
            Err(e) => {
                counter!("ingest_fetch_errors_total").increment(1);
                let reason = e.reason();
                warn!(target: "ingest", source = url, error = %e, "feed could not be parsed");
                if let Err(se) = self.inner.registry.record_status(url, false, reason.clone()).await {
                    warn!(target: "pipeline", source = url, error = %se, "could not record source status");
                }
                Err(reason)
            }
        }
    }

    async fn process_source(&self, url: &str) -> SourceReport {
        let items = match self.resolve_items(url).await {
            Ok(items) => items,
            Err(reason) => return SourceReport::failed_source(reason),
        };
        if items.is_empty() {
            return SourceReport::default();
        }

        // One session per source batch, shared by its item tasks and released
        // when the last of them finishes.
        let client = match GenerationClient::open(
            self.inner.connector.as_ref(),
            self.inner.settings.generation.clone(),
        ) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                error!(target: "pipeline", source = url, error = %e, "could not open generation session");
                return SourceReport::failed_source(e.to_string());
            }
        };

        let mut tasks = JoinSet::new();
        for item in items {
            let this = self.clone();
            let client = client.clone();
            let source = url.to_string();
            tasks.spawn(async move { this.process_item(&source, item, &client).await });
        }
        drop(client);

        let mut report = SourceReport::default();
        let mut seen = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.unwrap_or_else(|e| {
                error!(target: "pipeline", source = url, error = %e, "item task crashed");
                ItemOutcome::Failed
            });
            counter!("pipeline_items_total", "outcome" => outcome.label()).increment(1);
            match outcome {
                ItemOutcome::Rewritten(a) => {
                    report.rewritten += 1;
                    if seen.insert(a.fingerprint.clone()) {
                        report.articles.push(ArticleView::from(&a));
                    }
                }
                ItemOutcome::Served(a) => {
                    report.served += 1;
                    if seen.insert(a.fingerprint.clone()) {
                        report.articles.push(ArticleView::from(&a));
                    }
                }
                ItemOutcome::Skipped => report.skipped += 1,
                ItemOutcome::Failed => report.failed += 1,
            }
        }
        info!(
            target: "pipeline",
            source = url,
            rewritten = report.rewritten,
            served = report.served,
            skipped = report.skipped,
            failed = report.failed,
            "source processed"
        );
        report
    }

    async fn stored(&self, fingerprint: &Fingerprint) -> ItemOutcome {
        match self.inner.store.get_rewritten(fingerprint).await {
            Ok(Some(a)) => ItemOutcome::Served(a),
            Ok(None) => ItemOutcome::Skipped,
            Err(e) => {
                warn!(target: "pipeline", fingerprint = fingerprint.short(), error = %e, "lookup failed");
                ItemOutcome::Skipped
            }
        }
    }

    async fn process_item(
        &self,
        source: &str,
        item: Item,
        client: &GenerationClient,
    ) -> ItemOutcome {
        let fingerprint = item.fingerprint();

        // The permit is taken before the mark so a mark's age never includes
        // time spent queueing; reconciliation relies on that.
        let Ok(permit) = self.inner.permits.acquire().await else {
            return ItemOutcome::Failed;
        };
        match self.inner.store.mark_processed(&item).await {
            Ok(MarkOutcome::Accepted) => {}
            Ok(MarkOutcome::AlreadyProcessed) => {
                drop(permit);
                debug!(target: "pipeline", source, title = %item.title, "already processed");
                return self.stored(&fingerprint).await;
            }
            Err(e) => {
                error!(target: "pipeline", source, title = %item.title, error = %e, "could not mark item");
                return ItemOutcome::Failed;
            }
        }

        let mut mark = PendingMark::new(self.inner.store.clone(), fingerprint.clone());
        let prompt = self.inner.settings.prompt.render(&item.title, &item.summary);
        let generated = client.generate(&prompt).await;
        drop(permit);

        let content = match generated {
            Ok(text) if text.is_empty() => {
                error!(target: "pipeline", source, title = %item.title, "model returned an empty rewrite");
                mark.release().await;
                return ItemOutcome::Failed;
            }
            Ok(text) => text,
            Err(e) => {
                error!(target: "pipeline", source, title = %item.title, error = %e, "rewrite failed");
                mark.release().await;
                return ItemOutcome::Failed;
            }
        };

        let article = NewArticle {
            fingerprint: fingerprint.clone(),
            title: item.title,
            link: item.link,
            content,
            published_at: item.published_at,
            category: None,
        };
        match self.inner.store.save_rewritten(article).await {
            Ok(SaveOutcome::Inserted(a)) => {
                mark.disarm();
                info!(target: "pipeline", source, title = %a.title, id = a.id, "article rewritten");
                ItemOutcome::Rewritten(a)
            }
            Ok(SaveOutcome::Duplicate) => {
                mark.disarm();
                self.stored(&fingerprint).await
            }
            Err(e) => {
                error!(target: "pipeline", source, fingerprint = fingerprint.short(), error = %e, "could not save article");
                mark.release().await;
                ItemOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::{mock, BackendError, RetryPolicy, ScriptedConnector};
    use crate::ingest::mock::StaticFetcher;
    use crate::store::MemoryStore;

    const FEED: &str = "https://feed.example/rss";

    fn item(title: &str) -> Item {
        Item {
            title: title.to_string(),
            link: format!("https://feed.example/{}", title.replace(' ', "-")),
            summary: format!("summary of {title}"),
            published_at: "2024-01-01".to_string(),
        }
    }

    fn items(n: usize) -> Vec<Item> {
        (1..=n).map(|i| item(&format!("item {i}"))).collect()
    }

    fn settings(limit: usize, in_flight: usize) -> PipelineSettings {
        let generation = GenerationSettings::new("test-model").with_retry(RetryPolicy::new(
            2,
            Duration::from_secs(1),
            Duration::from_secs(10),
        ));
        PipelineSettings {
            fetch_limit: limit,
            max_in_flight: in_flight,
            prompt: PromptTemplate::parse("{title}").unwrap(),
            ..PipelineSettings::new(generation)
        }
    }

    fn pipeline(
        store: &Arc<MemoryStore>,
        fetcher: &Arc<StaticFetcher>,
        conn: &ScriptedConnector,
        settings: PipelineSettings,
    ) -> RewritePipeline {
        RewritePipeline::new(
            store.clone(),
            fetcher.clone(),
            Arc::new(conn.clone()),
            settings,
        )
    }

    fn sources() -> Vec<String> {
        vec![FEED.to_string()]
    }

    #[tokio::test]
    async fn one_failing_item_does_not_sink_the_batch() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(StaticFetcher::new().with_feed(FEED, items(5)));
        let conn = ScriptedConnector::new(|prompt, _| {
            if prompt == "item 3" {
                Err(BackendError::Permanent("model refused".into()))
            } else {
                Ok(mock::ndjson(&["Rewritten: ", prompt]))
            }
        });
        let p = pipeline(&store, &fetcher, &conn, settings(5, 4));

        let report = p.run(&sources()).await;
        let src = &report.sources[FEED];
        assert_eq!(src.rewritten, 4);
        assert_eq!(src.failed, 1);
        assert_eq!(src.articles.len(), 4);
        assert!(src.articles.iter().all(|a| a.title != "item 3"));
        assert!(src.articles.iter().any(|a| a.content == "Rewritten: item 1"));
        assert_eq!(store.article_count(), 4);
        // the failed item's mark was handed back
        assert!(!store.is_marked(&item("item 3").fingerprint()));
        assert_eq!(store.processed_count(), 4);
    }

    #[tokio::test]
    async fn second_run_serves_stored_articles_without_generating() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(StaticFetcher::new().with_feed(FEED, items(3)));
        let conn = ScriptedConnector::echo();
        let p = pipeline(&store, &fetcher, &conn, settings(5, 4));

        let first = p.run(&sources()).await;
        assert_eq!(first.rewritten(), 3);
        p.cache().invalidate(&FreshnessCache::key(FEED, Some(5)));

        let second = p.run(&sources()).await;
        let src = &second.sources[FEED];
        assert_eq!(src.rewritten, 0);
        assert_eq!(src.served, 3);
        let mut before: Vec<_> = first.sources[FEED].articles.iter().map(|a| &a.content).collect();
        let mut after: Vec<_> = src.articles.iter().map(|a| &a.content).collect();
        before.sort();
        after.sort();
        assert_eq!(before, after);
        assert_eq!(conn.calls(), 3);
        assert_eq!(store.article_count(), 3);
    }

    #[tokio::test]
    async fn duplicate_items_in_one_batch_produce_one_article() {
        let store = Arc::new(MemoryStore::new());
        let a = Item {
            title: "A".into(),
            link: "https://one.example/a".into(),
            summary: "first".into(),
            published_at: "2024-01-01".into(),
        };
        let b = Item {
            link: "https://two.example/a".into(),
            ..a.clone()
        };
        let fetcher = Arc::new(StaticFetcher::new().with_feed(FEED, vec![a, b]));
        let conn = ScriptedConnector::echo();
        let p = pipeline(&store, &fetcher, &conn, settings(5, 4));

        let report = p.run(&sources()).await;
        let src = &report.sources[FEED];
        assert_eq!(src.rewritten, 1);
        assert_eq!(src.articles.len(), 1);
        assert_eq!(src.articles[0].title, "A");
        assert_eq!(store.article_count(), 1);
        assert_eq!(conn.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn generation_calls_respect_in_flight_bound() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(StaticFetcher::new().with_feed(FEED, items(8)));
        let conn = ScriptedConnector::echo().with_latency(Duration::from_millis(50));
        let p = pipeline(&store, &fetcher, &conn, settings(8, 2));

        let report = p.run(&sources()).await;
        assert_eq!(report.rewritten(), 8);
        assert_eq!(conn.peak_in_flight(), 2);
    }

    #[tokio::test]
    async fn session_is_released_after_each_source() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(
            StaticFetcher::new()
                .with_feed(FEED, items(2))
                .with_feed("https://other.example/rss", vec![item("other")]),
        );
        let conn = ScriptedConnector::echo();
        let p = pipeline(&store, &fetcher, &conn, settings(5, 4));

        p.run(&[FEED.to_string(), "https://other.example/rss".to_string()])
            .await;
        assert_eq!(conn.sessions_opened(), 2);
        assert_eq!(conn.sessions_open(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_run_releases_its_marks() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(StaticFetcher::new().with_feed(FEED, items(3)));
        let conn = ScriptedConnector::echo().with_latency(Duration::from_secs(30));
        let p = pipeline(&store, &fetcher, &conn, settings(5, 4));

        let res = p.run_with_timeout(&sources(), Duration::from_secs(1)).await;
        assert!(res.is_none());
        for _ in 0..50 {
            if store.processed_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(store.processed_count(), 0);
        assert_eq!(store.article_count(), 0);
        assert_eq!(conn.sessions_open(), 0);
    }

    #[tokio::test]
    async fn panicking_item_is_contained() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(StaticFetcher::new().with_feed(FEED, items(3)));
        let conn = ScriptedConnector::new(|prompt, _| {
            if prompt == "item 2" {
                panic!("backend blew up");
            }
            Ok(mock::ndjson(&[prompt]))
        });
        let p = pipeline(&store, &fetcher, &conn, settings(5, 4));

        let report = p.run(&sources()).await;
        let src = &report.sources[FEED];
        assert_eq!(src.rewritten, 2);
        assert_eq!(src.failed, 1);
        for _ in 0..50 {
            if !store.is_marked(&item("item 2").fingerprint()) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!store.is_marked(&item("item 2").fingerprint()));
    }

    #[tokio::test]
    async fn unhealthy_sources_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(
            StaticFetcher::new()
                .with_feed(FEED, items(1))
                .with_unreachable("https://down.example/rss", "HTTP 503"),
        );
        let conn = ScriptedConnector::echo();
        let p = pipeline(&store, &fetcher, &conn, settings(5, 4));
        let all = vec![FEED.to_string(), "https://down.example/rss".to_string()];

        let first = p.run(&all).await;
        assert_eq!(
            first.sources["https://down.example/rss"].error.as_deref(),
            Some("HTTP 503")
        );
        assert_eq!(first.health.len(), 2);
        assert_eq!(fetcher.validation_calls(), 2);

        let second = p.run(&all).await;
        assert_eq!(second.skipped_unhealthy, vec!["https://down.example/rss".to_string()]);
        assert!(!second.sources.contains_key("https://down.example/rss"));
        // FEED was served from the cache, down was never contacted
        assert_eq!(fetcher.validation_calls(), 2);
    }

    #[tokio::test]
    async fn failing_source_is_retried_after_cool_down() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(StaticFetcher::new().with_unreachable(FEED, "HTTP 503"));
        let conn = ScriptedConnector::echo();
        let p = pipeline(&store, &fetcher, &conn, settings(5, 4));

        let first = p.run(&sources()).await;
        assert_eq!(first.sources[FEED].error.as_deref(), Some("HTTP 503"));

        // feed is back, but the failure is still recent
        fetcher.set_feed(FEED, items(2));
        let second = p.run(&sources()).await;
        assert_eq!(second.skipped_unhealthy, sources());
        assert_eq!(fetcher.validation_calls(), 1);

        // once the failed check is older than the cool-down it is tried again
        store
            .record_status(SourceStatus {
                source_url: FEED.into(),
                last_checked_at: Utc::now() - TimeDelta::hours(1),
                ok: false,
                reason: "HTTP 503".into(),
            })
            .await
            .unwrap();
        let third = p.run(&sources()).await;
        assert!(third.skipped_unhealthy.is_empty());
        assert_eq!(third.sources[FEED].rewritten, 2);
        assert_eq!(fetcher.validation_calls(), 2);
        assert!(p.registry().list_unhealthy().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bare_mark_without_article_is_dropped_silently() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(StaticFetcher::new().with_feed(FEED, vec![item("claimed")]));
        let conn = ScriptedConnector::echo();
        let p = pipeline(&store, &fetcher, &conn, settings(5, 4));
        store.insert_mark_at(&item("claimed"), Utc::now());

        let report = p.run(&sources()).await;
        let src = &report.sources[FEED];
        assert!(src.articles.is_empty());
        assert_eq!(src.skipped, 1);
        assert_eq!(src.failed, 0);
        assert_eq!(src.error, None);
        assert_eq!(conn.calls(), 0);
        assert!(store.is_marked(&item("claimed").fingerprint()));
    }

    // Wall-clock timing: mark ages come from `Utc::now`, not tokio time.
    #[tokio::test]
    async fn concurrent_reconcile_keeps_queued_marks() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(StaticFetcher::new().with_feed(FEED, items(2)));
        let conn = ScriptedConnector::echo().with_latency(Duration::from_millis(500));
        let a = pipeline(&store, &fetcher, &conn, settings(5, 1));
        let b = pipeline(&store, &fetcher, &conn, settings(5, 4));

        let run_a = tokio::spawn({
            let a = a.clone();
            async move { a.run(&sources()).await }
        });
        // item 2 of A has queued behind item 1 for 900ms; its generation has
        // been running for about 400ms
        tokio::time::sleep(Duration::from_millis(900)).await;
        let released = b.reconcile(Duration::from_millis(700)).await.unwrap();
        assert_eq!(released, 0);
        let rb = b.run(&sources()).await;
        let ra = run_a.await.unwrap();

        assert_eq!(conn.calls(), 2);
        assert_eq!(ra.rewritten(), 2);
        assert_eq!(rb.rewritten(), 0);
        assert_eq!(store.article_count(), 2);
    }

    #[tokio::test]
    async fn parse_failure_marks_source_unhealthy() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(StaticFetcher::new().with_unparsable(FEED, "no channel"));
        let conn = ScriptedConnector::echo();
        let p = pipeline(&store, &fetcher, &conn, settings(5, 4));

        let report = p.run(&sources()).await;
        let src = &report.sources[FEED];
        assert!(src.articles.is_empty());
        assert_eq!(src.error.as_deref(), Some("invalid feed document: no channel"));
        assert!(p.registry().list_unhealthy().await.unwrap().contains(FEED));
        assert_eq!(conn.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn health_updates_are_published() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(StaticFetcher::new().with_feed(FEED, items(1)));
        let conn = ScriptedConnector::echo();
        let p = pipeline(&store, &fetcher, &conn, settings(5, 4));
        let mut rx = p.subscribe_health();

        p.run(&sources()).await;
        let status = rx.recv().await.unwrap();
        assert_eq!(status.source_url, FEED);
        assert!(status.ok);
    }

    #[tokio::test]
    async fn reconcile_hands_back_old_marks_only() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(StaticFetcher::new());
        let conn = ScriptedConnector::echo();
        let p = pipeline(&store, &fetcher, &conn, settings(5, 4));

        store.insert_mark_at(&item("old"), Utc::now() - TimeDelta::hours(2));
        store.insert_mark_at(&item("fresh"), Utc::now());
        let released = p.reconcile(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(released, 1);
        assert!(store.is_marked(&item("fresh").fingerprint()));
    }

    #[tokio::test]
    async fn empty_feed_gives_empty_report() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(StaticFetcher::new().with_feed(FEED, Vec::new()));
        let conn = ScriptedConnector::echo();
        let p = pipeline(&store, &fetcher, &conn, settings(5, 4));

        let report = p.run(&sources()).await;
        assert_eq!(report.sources[FEED], SourceReport::default());
        assert_eq!(conn.sessions_opened(), 0);
    }
}
