// src/generate/http.rs
//! Streaming HTTP transport for Ollama-style `/api/generate` endpoints.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use tracing::debug;

use super::{Backend, BackendError, Connector, GenerateRequest, StreamAssembler};
use crate::error::{ConfigError, GenerationError};

const ERROR_BODY_MAX: usize = 200;

#[derive(Debug, Clone)]
pub struct HttpConnector {
    api_url: Url,
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(api_url: &str, timeout: Duration) -> Result<Self, ConfigError> {
        let api_url =
            Url::parse(api_url).map_err(|e| ConfigError::invalid("llm.api_url", e.to_string()))?;
        if !matches!(api_url.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                "llm.api_url",
                format!("unsupported scheme `{}`", api_url.scheme()),
            ));
        }
        if timeout.is_zero() {
            return Err(ConfigError::invalid("llm.timeout", "must be positive"));
        }
        Ok(Self { api_url, timeout })
    }

    pub fn api_url(&self) -> &Url {
        &self.api_url
    }
}

impl Connector for HttpConnector {
    fn open(&self) -> Result<Box<dyn Backend>, GenerationError> {
        let client = Client::builder()
            .user_agent("feed-rewriter/0.1")
            .timeout(self.timeout)
            .build()
            .map_err(|e| GenerationError::Session(e.to_string()))?;
        Ok(Box::new(HttpBackend {
            client,
            api_url: self.api_url.clone(),
        }))
    }
}

pub struct HttpBackend {
    client: Client,
    api_url: Url,
}

fn classify(e: reqwest::Error) -> BackendError {
    if e.is_builder() {
        BackendError::Permanent(e.to_string())
    } else {
        BackendError::Transient(e.to_string())
    }
}

fn truncate_body(body: &str) -> String {
    let mut out: String = body.chars().take(ERROR_BODY_MAX).collect();
    if body.chars().count() > ERROR_BODY_MAX {
        out.push_str("...");
    }
    out
}

#[async_trait]
impl Backend for HttpBackend {
    async fn send(
        &self,
        request: &GenerateRequest,
        sink: &mut StreamAssembler,
    ) -> Result<(), BackendError> {
        let mut resp = self
            .client
            .post(self.api_url.clone())
            .json(request)
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Transient(format!(
                "HTTP {}: {}",
                status.as_u16(),
                truncate_body(body.trim())
            )));
        }

        while let Some(chunk) = resp.chunk().await.map_err(classify)? {
            sink.push(&chunk);
        }
        debug!(target: "generate", tokens = sink.token_count(), "stream finished");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
