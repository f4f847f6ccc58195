// src/ingest/mod.rs
pub mod cache;
pub mod mock;
pub mod registry;
pub mod rss;
pub mod scheduler;
pub mod types;

use once_cell::sync::OnceCell;
use regex::Regex;

pub use cache::FreshnessCache;
pub use registry::SourceRegistry;
pub use rss::HttpFeedFetcher;
pub use types::{FeedFetcher, Item, Validation};

/// Feed text cleanup: decode entities, strip tags, straighten quotes and
/// collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").expect("static regex"));
    out = re_tags.replace_all(&out, " ").to_string();

    // 3) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace (including the NBSPs entity decoding produced)
    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"[\s\u{00A0}]+").expect("static regex"));
    out = re_ws.replace_all(&out, " ").to_string();

    // 5) No space before closing punctuation (left behind by stripped tags)
    static RE_PUNCT: OnceCell<Regex> = OnceCell::new();
    let re_punct = RE_PUNCT.get_or_init(|| Regex::new(r" ([.,;:!?)\]])").expect("static regex"));
    out = re_punct.replace_all(&out, "$1").to_string();
    out.trim().to_string()
}
