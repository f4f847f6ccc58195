// src/ingest/mock.rs
//! Canned fetcher for tests and offline runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::FetchError;
use crate::ingest::types::{FeedFetcher, Item, Validation};

enum Canned {
    Items(Vec<Item>),
    Unreachable(String),
    Unparsable(String),
}

#[derive(Default)]
pub struct StaticFetcher {
    feeds: Mutex<HashMap<String, Canned>>,
    validations: AtomicUsize,
    fetches: AtomicUsize,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_feed(self, url: &str, items: Vec<Item>) -> Self {
        self.set_feed(url, items);
        self
    }

    /// `validate` fails with `reason`.
    pub fn with_unreachable(self, url: &str, reason: &str) -> Self {
        self.put(url, Canned::Unreachable(reason.to_string()));
        self
    }

    /// `validate` passes but `fetch` fails to parse.
    pub fn with_unparsable(self, url: &str, reason: &str) -> Self {
        self.put(url, Canned::Unparsable(reason.to_string()));
        self
    }

    /// Replaces the items served for `url`.
    pub fn set_feed(&self, url: &str, items: Vec<Item>) {
        self.put(url, Canned::Items(items));
    }

    fn put(&self, url: &str, c: Canned) {
        self.feeds
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(url.to_string(), c);
    }

    pub fn validation_calls(&self) -> usize {
        self.validations.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedFetcher for StaticFetcher {
    async fn validate(&self, url: &str) -> Validation {
        self.validations.fetch_add(1, Ordering::SeqCst);
        let g = self.feeds.lock().unwrap_or_else(|p| p.into_inner());
        match g.get(url) {
            None => Validation::failed("HTTP 404"),
            Some(Canned::Unreachable(reason)) => Validation::failed(reason.clone()),
            Some(_) => Validation::passed(String::new()),
        }
    }

    async fn fetch(
        &self,
        url: &str,
        limit: usize,
        _payload: Option<String>,
    ) -> Result<Vec<Item>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let g = self.feeds.lock().unwrap_or_else(|p| p.into_inner());
        match g.get(url) {
            Some(Canned::Items(items)) => Ok(items.iter().take(limit).cloned().collect()),
            Some(Canned::Unparsable(reason)) => Err(FetchError::Parse(reason.clone())),
            Some(Canned::Unreachable(reason)) => Err(FetchError::Transport(reason.clone())),
            None => Err(FetchError::Status(404)),
        }
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
