// src/ingest/rss.rs
//! HTTP feed fetcher for RSS 2.0, RSS 1.0 (RDF) and Atom documents.

use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use quick_xml::de::from_str;
use quick_xml::events::Event;
use serde::Deserialize;

use crate::error::{ConfigError, FetchError};
use crate::ingest::normalize_text;
use crate::ingest::types::{FeedFetcher, Item, Validation};

/// Entries taken from the top of each feed.
pub const DEFAULT_LIMIT: usize = 5;

const SUMMARY_MAX_CHARS: usize = 4000;
const USER_AGENT: &str = "feed-rewriter/0.1";

#[derive(Debug, Deserialize)]
struct Rss {
    channel: RssChannel,
}

#[derive(Debug, Deserialize)]
struct RssChannel {
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

/// RSS 1.0 keeps items next to the channel, not inside it.
#[derive(Debug, Deserialize)]
struct Rdf {
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    title: Option<String>,
    link: Option<String>,
    description: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    #[serde(rename = "dc:date")]
    dc_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    title: Option<AtomText>,
    #[serde(rename = "link", default)]
    links: Vec<AtomLink>,
    summary: Option<AtomText>,
    published: Option<String>,
    updated: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomText {
    #[serde(rename = "$text", default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@rel")]
    rel: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFormat {
    Rss,
    Rdf,
    Atom,
}

/// Identifies the document by its root element.
pub fn detect_format(xml: &str) -> Option<FeedFormat> {
    let mut reader = quick_xml::Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase();
                return match name.as_str() {
                    "rss" => Some(FeedFormat::Rss),
                    "rdf" => Some(FeedFormat::Rdf),
                    "feed" => Some(FeedFormat::Atom),
                    _ => None,
                };
            }
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Parses up to `limit` items, in document order.
pub fn parse_feed(xml: &str, limit: usize) -> Result<Vec<Item>, FetchError> {
    let t0 = std::time::Instant::now();
    let xml_clean = scrub_html_entities_for_xml(xml);
    let format = detect_format(&xml_clean)
        .ok_or_else(|| FetchError::Parse("unrecognized root element".to_string()))?;

    let parse_err = |e: quick_xml::DeError| FetchError::Parse(e.to_string());
    let items: Vec<Item> = match format {
        FeedFormat::Rss => {
            let rss: Rss = from_str(&xml_clean).map_err(parse_err)?;
            rss.channel.items.into_iter().filter_map(from_rss).collect()
        }
        FeedFormat::Rdf => {
            let rdf: Rdf = from_str(&xml_clean).map_err(parse_err)?;
            rdf.items.into_iter().filter_map(from_rss).collect()
        }
        FeedFormat::Atom => {
            let feed: AtomFeed = from_str(&xml_clean).map_err(parse_err)?;
            feed.entries.into_iter().filter_map(from_atom).collect()
        }
    };
    let items: Vec<Item> = items.into_iter().take(limit).collect();

    histogram!("ingest_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
    counter!("ingest_items_total").increment(items.len() as u64);
    Ok(items)
}

fn from_rss(it: RssItem) -> Option<Item> {
    let title = normalize_text(it.title.as_deref().unwrap_or_default());
    let link = it.link.unwrap_or_default().trim().to_string();
    if title.is_empty() && link.is_empty() {
        return None;
    }
    Some(Item {
        title,
        link,
        summary: summary_text(it.description.as_deref().unwrap_or_default()),
        published_at: first_date([it.pub_date, it.dc_date]),
    })
}

fn from_atom(e: AtomEntry) -> Option<Item> {
    let title = normalize_text(e.title.as_ref().map(|t| t.value.as_str()).unwrap_or_default());
    let link = e
        .links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .or_else(|| e.links.first())
        .and_then(|l| l.href.clone())
        .unwrap_or_default();
    if title.is_empty() && link.is_empty() {
        return None;
    }
    Some(Item {
        title,
        link,
        summary: summary_text(e.summary.as_ref().map(|t| t.value.as_str()).unwrap_or_default()),
        published_at: first_date([e.published, e.updated]),
    })
}

fn first_date<const N: usize>(candidates: [Option<String>; N]) -> String {
    candidates
        .into_iter()
        .flatten()
        .map(|d| d.trim().to_string())
        .find(|d| !d.is_empty())
        .unwrap_or_default()
}

fn summary_text(raw: &str) -> String {
    let out = normalize_text(raw);
    if out.chars().count() > SUMMARY_MAX_CHARS {
        out.chars().take(SUMMARY_MAX_CHARS).collect()
    } else {
        out
    }
}

/// HTML entities that XML parsers reject.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&hellip;", "...")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}

pub struct HttpFeedFetcher {
    client: reqwest::Client,
}

impl HttpFeedFetcher {
    pub fn new(timeout: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10).min(timeout))
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::invalid("rss.timeout", e.to_string()))?;
        Ok(Self { client })
    }

    async fn download(&self, url: &str) -> Result<String, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        resp.text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn validate(&self, url: &str) -> Validation {
        let body = match self.download(url).await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(target: "ingest", source = url, error = %e, "feed validation failed");
                return Validation::failed(e.reason());
            }
        };
        if detect_format(&scrub_html_entities_for_xml(&body)).is_none() {
            return Validation::failed("not an RSS or Atom document");
        }
        Validation::passed(body)
    }

    async fn fetch(
        &self,
        url: &str,
        limit: usize,
        payload: Option<String>,
    ) -> Result<Vec<Item>, FetchError> {
        let body = match payload {
            Some(p) => p,
            None => self.download(url).await?,
        };
        parse_feed(&body, limit)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
