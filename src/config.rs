// src/config.rs
//! TOML configuration.
//!
//! Lookup order:
//! 1) explicit path (`--config`)
//! 2) $FEED_REWRITER_CONFIG
//! 3) config/feed_rewriter.toml
//!
//! `FEED_REWRITER_LLM_URL` and `FEED_REWRITER_MODEL` override the `[llm]`
//! endpoint and model after the file is read.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::generate::{GenerationSettings, RetryPolicy};
use crate::pipeline::PipelineSettings;
use crate::prompt::{PromptTemplate, DEFAULT_TEMPLATE};

pub const ENV_CONFIG_PATH: &str = "FEED_REWRITER_CONFIG";
pub const ENV_LLM_URL: &str = "FEED_REWRITER_LLM_URL";
pub const ENV_MODEL: &str = "FEED_REWRITER_MODEL";
pub const DEFAULT_CONFIG_PATH: &str = "config/feed_rewriter.toml";

/// `feeds = ["a", "b"]` or `feeds = "a, b"` (commas and newlines both split).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum FeedList {
    List(Vec<String>),
    Text(String),
}

impl Default for FeedList {
    fn default() -> Self {
        FeedList::List(Vec::new())
    }
}

impl FeedList {
    /// Trimmed, non-empty, first occurrence kept.
    pub fn urls(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            FeedList::List(v) => v.iter().map(String::as_str).collect(),
            FeedList::Text(s) => s.split(['\n', ',']).collect(),
        };
        let mut out: Vec<String> = Vec::new();
        for r in raw {
            let t = r.trim();
            if !t.is_empty() && !out.iter().any(|o| o == t) {
                out.push(t.to_string());
            }
        }
        out
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RssConfig {
    pub feeds: FeedList,
    /// Seconds between scheduled runs.
    pub interval: u64,
    pub fetch_limit: usize,
    pub cache_ttl: u64,
    pub run_timeout: Option<u64>,
    /// Per-request timeout for feed downloads.
    pub timeout: u64,
    /// Seconds a failing source sits out before it is validated again.
    pub recheck_after: u64,
}

impl Default for RssConfig {
    fn default() -> Self {
        Self {
            feeds: FeedList::default(),
            interval: 3600,
            fetch_limit: 5,
            cache_ttl: 600,
            run_timeout: None,
            timeout: 30,
            recheck_after: 900,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub api_url: Option<String>,
    pub model_name: Option<String>,
    pub timeout: u64,
    pub max_retries: u32,
    pub backoff_base: u64,
    pub backoff_max: u64,
    pub jitter: bool,
    pub temperature: f32,
    pub max_in_flight: usize,
    pub rewrite_prompt: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            model_name: None,
            timeout: 60,
            max_retries: 3,
            backoff_base: 1,
            backoff_max: 10,
            jitter: false,
            temperature: 0.1,
            max_in_flight: 4,
            rewrite_prompt: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    pub database_url: String,
    /// Marks older than this without an article are handed back. Must exceed
    /// the longest a single generation can take (`AppConfig::max_generation_time`).
    pub stale_mark_after: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://articles.db".to_string(),
            stale_mark_after: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub rss: RssConfig,
    pub llm: LlmConfig,
    pub store: StoreConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    /// Parses TOML only; no env overrides, no validation.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Reads `path`, applies env overrides and validates.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg = Self::parse(&content)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// `load_from` on the first path of the lookup order.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_from(&resolve_path(explicit))
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(url) = non_empty_env(ENV_LLM_URL) {
            self.llm.api_url = Some(url);
        }
        if let Some(model) = non_empty_env(ENV_MODEL) {
            self.llm.model_name = Some(model);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let api_url = self
            .llm
            .api_url
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::Missing("llm.api_url"))?;
        reqwest::Url::parse(api_url).map_err(|e| ConfigError::invalid("llm.api_url", e.to_string()))?;
        if self
            .llm
            .model_name
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .is_none()
        {
            return Err(ConfigError::Missing("llm.model_name"));
        }

        positive("llm.max_retries", self.llm.max_retries as u64)?;
        positive("llm.timeout", self.llm.timeout)?;
        positive("llm.max_in_flight", self.llm.max_in_flight as u64)?;
        positive("rss.interval", self.rss.interval)?;
        positive("rss.fetch_limit", self.rss.fetch_limit as u64)?;
        positive("rss.timeout", self.rss.timeout)?;
        if self.rss.run_timeout == Some(0) {
            return Err(ConfigError::invalid("rss.run_timeout", "must be positive"));
        }
        if self.llm.backoff_max < self.llm.backoff_base {
            return Err(ConfigError::invalid(
                "llm.backoff_max",
                "must not be smaller than llm.backoff_base",
            ));
        }
        if !self.llm.temperature.is_finite() || self.llm.temperature < 0.0 {
            return Err(ConfigError::invalid("llm.temperature", "must be a non-negative number"));
        }
        if self.stale_mark_after() <= self.max_generation_time() {
            return Err(ConfigError::invalid(
                "store.stale_mark_after",
                format!(
                    "must exceed the longest generation ({}s: llm.timeout per attempt plus backoff)",
                    self.max_generation_time().as_secs()
                ),
            ));
        }
        PromptTemplate::parse(&self.llm.rewrite_prompt)?;
        Ok(())
    }

    /// Worst case for one item: every attempt hits `llm.timeout` and every
    /// backoff sleeps its full length.
    pub fn max_generation_time(&self) -> Duration {
        self.llm_timeout()
            .saturating_mul(self.llm.max_retries)
            .saturating_add(self.retry_policy().max_total_wait())
    }

    pub fn feeds(&self) -> Vec<String> {
        self.rss.feeds.urls()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.rss.interval)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.rss.run_timeout.map(Duration::from_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.rss.timeout)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.timeout)
    }

    pub fn stale_mark_after(&self) -> Duration {
        Duration::from_secs(self.store.stale_mark_after)
    }

    /// Empty when unset; `validate` rejects that.
    pub fn api_url(&self) -> &str {
        self.llm.api_url.as_deref().unwrap_or_default()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.llm.max_retries,
            Duration::from_secs(self.llm.backoff_base),
            Duration::from_secs(self.llm.backoff_max),
        )
        .with_jitter(self.llm.jitter)
    }

    pub fn generation_settings(&self) -> GenerationSettings {
        let mut s = GenerationSettings::new(self.llm.model_name.clone().unwrap_or_default())
            .with_retry(self.retry_policy());
        s.temperature = self.llm.temperature;
        s
    }

    pub fn pipeline_settings(&self) -> Result<PipelineSettings, ConfigError> {
        Ok(PipelineSettings {
            fetch_limit: self.rss.fetch_limit,
            cache_ttl: Duration::from_secs(self.rss.cache_ttl),
            max_in_flight: self.llm.max_in_flight,
            recheck_after: Duration::from_secs(self.rss.recheck_after),
            prompt: PromptTemplate::parse(&self.llm.rewrite_prompt)?,
            generation: self.generation_settings(),
        })
    }
}

pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    if let Some(p) = non_empty_env(ENV_CONFIG_PATH) {
        return PathBuf::from(p);
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn positive(field: &'static str, v: u64) -> Result<(), ConfigError> {
    if v == 0 {
        Err(ConfigError::invalid(field, "must be positive"))
    } else {
        Ok(())
    }
}
