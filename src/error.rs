// src/error.rs
//! Error taxonomy. Each error is scoped to the smallest unit it can fail:
//! a source (`FetchError`), an item (`GenerationError`), or the process
//! (`ConfigError`). Duplicate inserts are not errors; see `store::MarkOutcome`.

use std::path::PathBuf;

use thiserror::Error;

/// Transport or parse failure for one feed source.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("invalid feed document: {0}")]
    Parse(String),
}

impl FetchError {
    /// Short human-readable reason stored in the source registry.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

/// Item-scoped failure of the generation backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("generation failed after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: String },
    #[error("generation request rejected: {0}")]
    Rejected(String),
    #[error("could not open generation session: {0}")]
    Session(String),
}

/// Missing or invalid settings. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("reading config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Genuine I/O failure of the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store query failed: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
