// src/generate/mod.rs
//! Generation client: one prompt in, cleaned text out.
//!
//! The transport is split from the client the same way providers are split
//! from their wrappers elsewhere: a `Connector` opens a session (`Backend`)
//! that does the raw call, and `GenerationClient` owns retry, stream assembly
//! and cleanup around it. Dropping the client releases the session.

pub mod cleanup;
pub mod http;
pub mod mock;
pub mod retry;
pub mod stream;

use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::GenerationError;

pub use cleanup::{clean_output, strip_reasoning};
pub use http::HttpConnector;
pub use mock::ScriptedConnector;
pub use retry::RetryPolicy;
pub use stream::StreamAssembler;

/// Body POSTed to the generation endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: f32,
    pub stream: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Connection error, timeout, non-2xx status, broken body stream.
    Transient(String),
    /// The request itself is wrong; retrying cannot help.
    Permanent(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::Transient(m) => write!(f, "transient: {m}"),
            BackendError::Permanent(m) => write!(f, "permanent: {m}"),
        }
    }
}

/// An open session against the generation endpoint.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Performs one call, pushing raw response bytes into `sink` in arrival order.
    async fn send(
        &self,
        request: &GenerateRequest,
        sink: &mut StreamAssembler,
    ) -> Result<(), BackendError>;

    fn name(&self) -> &'static str;
}

pub trait Connector: Send + Sync {
    /// Opens a fresh session. It is closed when the returned backend is dropped.
    fn open(&self) -> Result<Box<dyn Backend>, GenerationError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSettings {
    pub model: String,
    pub temperature: f32,
    pub retry: RetryPolicy,
    pub strip_reasoning: bool,
}

impl GenerationSettings {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: 0.1,
            retry: RetryPolicy::default(),
            strip_reasoning: true,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

pub struct GenerationClient {
    backend: Box<dyn Backend>,
    settings: GenerationSettings,
}

impl GenerationClient {
    /// Opens a session through `connector`.
    pub fn open(
        connector: &dyn Connector,
        settings: GenerationSettings,
    ) -> Result<Self, GenerationError> {
        if settings.model.trim().is_empty() {
            return Err(GenerationError::Rejected("model name is empty".to_string()));
        }
        if settings.retry.max_attempts == 0 {
            return Err(GenerationError::Rejected(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        let backend = connector.open()?;
        debug!(target: "generate", backend = backend.name(), "generation session opened");
        Ok(Self { backend, settings })
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    /// Generates text for `prompt`, retrying transient failures with backoff.
    pub async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let request = GenerateRequest {
            model: self.settings.model.clone(),
            prompt: prompt.to_string(),
            temperature: self.settings.temperature,
            stream: true,
        };
        let policy = self.settings.retry;
        let t0 = Instant::now();

        let mut attempt: u32 = 0;
        let result = loop {
            attempt += 1;
            counter!("generation_attempts_total").increment(1);
            debug!(target: "generate", attempt, prompt_chars = prompt.len(), "sending prompt to model");

            let mut sink = StreamAssembler::new();
            match self.backend.send(&request, &mut sink).await {
                Ok(()) => {
                    let raw = sink.finish();
                    break Ok(if self.settings.strip_reasoning {
                        clean_output(&raw)
                    } else {
                        raw
                    });
                }
                Err(BackendError::Permanent(msg)) => {
                    break Err(GenerationError::Rejected(msg));
                }
                Err(BackendError::Transient(msg)) => {
                    if !policy.can_retry(attempt) {
                        break Err(GenerationError::Exhausted {
                            attempts: attempt,
                            last: msg,
                        });
                    }
                    let wait = policy.delay_for(attempt);
                    warn!(
                        target: "generate",
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %msg,
                        "transient generation failure, backing off"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        };

        let elapsed = t0.elapsed();
        histogram!("generation_latency_ms").record(elapsed.as_secs_f64() * 1_000.0);
        if result.is_err() {
            counter!("generation_failures_total").increment(1);
        }
        info!(
            target: "generate",
            attempts = attempt,
            ok = result.is_ok(),
            "generation request completed in {:.2}s",
            elapsed.as_secs_f64()
        );
        result
    }
}

impl Drop for GenerationClient {
    fn drop(&mut self) {
        debug!(target: "generate", backend = self.backend.name(), "generation session released");
    }
}
