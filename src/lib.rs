// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod config;
pub mod error;
pub mod generate;
pub mod ingest;
pub mod metrics;
pub mod pipeline;
pub mod prompt;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::config::AppConfig;
pub use crate::error::{ConfigError, FetchError, GenerationError, StoreError};
pub use crate::pipeline::{PipelineSettings, RewritePipeline, RunReport, SourceReport};
