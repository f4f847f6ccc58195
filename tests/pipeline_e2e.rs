// tests/pipeline_e2e.rs
//
// Whole pipeline: HTTP feed → SQLite store → HTTP generation endpoint.

use std::sync::Arc;
use std::time::Duration;

use feed_rewriter::generate::{
    mock::ndjson, GenerationSettings, HttpConnector, RetryPolicy, ScriptedConnector,
};
use feed_rewriter::ingest::mock::StaticFetcher;
use feed_rewriter::ingest::{HttpFeedFetcher, Item};
use feed_rewriter::prompt::PromptTemplate;
use feed_rewriter::store::{ArticleStore, SqliteStore};
use feed_rewriter::{PipelineSettings, RewritePipeline};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const RSS: &str = include_str!("fixtures/newsroom_rss.xml");

const DUPLICATED_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>dup</title>
  <item><title>A</title><link>https://one.example/a</link><description>x</description><pubDate>2024-01-01</pubDate></item>
  <item><title>A</title><link>https://two.example/a</link><description>y</description><pubDate>2024-01-01</pubDate></item>
</channel></rss>"#;

fn settings() -> PipelineSettings {
    PipelineSettings {
        prompt: PromptTemplate::parse("Rewrite this: {title}").unwrap(),
        ..PipelineSettings::new(GenerationSettings::new("llama3").with_retry(RetryPolicy::new(
            2,
            Duration::from_millis(10),
            Duration::from_millis(20),
        )))
    }
}

async fn feed_server(body: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rss"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;
    server
}

async fn llm_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(ndjson(&["<think>ok</think>", "A fresh take."]).concat()),
        )
        .mount(&server)
        .await;
    server
}

async fn http_pipeline(store: Arc<SqliteStore>, llm: &MockServer) -> RewritePipeline {
    let connector = HttpConnector::new(
        &format!("{}/api/generate", llm.uri()),
        Duration::from_secs(5),
    )
    .unwrap();
    RewritePipeline::new(
        store,
        Arc::new(HttpFeedFetcher::new(Duration::from_secs(5)).unwrap()),
        Arc::new(connector),
        settings(),
    )
}

#[tokio::test]
async fn feed_is_rewritten_and_persisted() {
    let feed = feed_server(RSS).await;
    let llm = llm_server().await;
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let pipeline = http_pipeline(store.clone(), &llm).await;
    let url = format!("{}/rss", feed.uri());

    let report = pipeline.run(&[url.clone()]).await;
    let src = &report.sources[&url];
    assert_eq!(src.error, None);
    assert_eq!(src.rewritten, 3);
    assert!(src.articles.iter().all(|a| a.content == "A fresh take."));
    assert_eq!(store.list_rewritten(10).await.unwrap().len(), 3);
    assert_eq!(llm.received_requests().await.unwrap().len(), 3);

    assert_eq!(report.health.len(), 1);
    assert!(report.health[0].ok);
}

#[tokio::test]
async fn duplicate_entries_in_one_fetch_give_one_article() {
    let feed = feed_server(DUPLICATED_RSS).await;
    let llm = llm_server().await;
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let pipeline = http_pipeline(store.clone(), &llm).await;
    let url = format!("{}/rss", feed.uri());

    let report = pipeline.run(&[url.clone()]).await;
    let stored = store.list_rewritten(10).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].title, "A");
    assert_eq!(report.sources[&url].articles.len(), 1);
    assert_eq!(llm.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn failing_endpoint_leaves_items_for_a_later_run() {
    let feed = feed_server(RSS).await;
    let llm = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&llm)
        .await;
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let url = format!("{}/rss", feed.uri());

    let report = http_pipeline(store.clone(), &llm).await.run(&[url.clone()]).await;
    assert_eq!(report.sources[&url].failed, 3);
    assert!(store.list_rewritten(10).await.unwrap().is_empty());

    // marks were released, so a healthy endpoint picks the items up
    let healthy = llm_server().await;
    let report = http_pipeline(store.clone(), &healthy).await.run(&[url.clone()]).await;
    assert_eq!(report.sources[&url].rewritten, 3);
}

#[tokio::test]
async fn overlapping_runs_generate_each_article_once() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let items: Vec<Item> = (0..4)
        .map(|i| Item {
            title: format!("story {i}"),
            link: format!("https://x/{i}"),
            summary: String::new(),
            published_at: "2024-05-05".into(),
        })
        .collect();
    let fetcher = Arc::new(StaticFetcher::new().with_feed("https://feed/rss", items));
    let conn = ScriptedConnector::echo().with_latency(Duration::from_millis(50));

    let a = RewritePipeline::new(store.clone(), fetcher.clone(), Arc::new(conn.clone()), settings());
    let b = RewritePipeline::new(store.clone(), fetcher.clone(), Arc::new(conn.clone()), settings());
    let sources = vec!["https://feed/rss".to_string()];

    let (ra, rb) = tokio::join!(a.run(&sources), b.run(&sources));
    assert_eq!(conn.calls(), 4);
    assert_eq!(ra.rewritten() + rb.rewritten(), 4);
    assert_eq!(store.list_rewritten(10).await.unwrap().len(), 4);
}
