// src/generate/mock.rs
//! Scripted generation backend for tests and offline runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{Backend, BackendError, Connector, GenerateRequest, StreamAssembler};
use crate::error::GenerationError;

/// Decides the reply for `(prompt, attempt)`; `attempt` counts calls with the
/// same prompt, starting at 1. `Ok` carries the raw chunks to stream back.
pub type Script = dyn Fn(&str, u32) -> Result<Vec<String>, BackendError> + Send + Sync;

struct ScriptState {
    script: Box<Script>,
    attempts: Mutex<HashMap<String, u32>>,
    calls: AtomicUsize,
    opened: AtomicUsize,
    released: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

#[derive(Clone)]
pub struct ScriptedConnector {
    state: Arc<ScriptState>,
    latency: Duration,
}

impl ScriptedConnector {
    pub fn new(
        script: impl Fn(&str, u32) -> Result<Vec<String>, BackendError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            state: Arc::new(ScriptState {
                script: Box::new(script),
                attempts: Mutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
                opened: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }),
            latency: Duration::ZERO,
        }
    }

    /// Replies `Rewritten: <prompt>`, streamed as two tokens.
    pub fn echo() -> Self {
        Self::new(|prompt, _| Ok(ndjson(&["Rewritten: ", prompt])))
    }

    /// Every call sleeps `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn sessions_open(&self) -> usize {
        self.sessions_opened() - self.state.released.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::SeqCst)
    }
}

impl Connector for ScriptedConnector {
    fn open(&self) -> Result<Box<dyn Backend>, GenerationError> {
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedBackend {
            state: self.state.clone(),
            latency: self.latency,
        }))
    }
}

struct ScriptedBackend {
    state: Arc<ScriptState>,
    latency: Duration,
}

struct InFlight<'a>(&'a ScriptState);

impl<'a> InFlight<'a> {
    fn enter(state: &'a ScriptState) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn send(
        &self,
        request: &GenerateRequest,
        sink: &mut StreamAssembler,
    ) -> Result<(), BackendError> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight::enter(&self.state);
        let attempt = {
            let mut g = self
                .state
                .attempts
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            let n = g.entry(request.prompt.clone()).or_insert(0);
            *n += 1;
            *n
        };
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        for chunk in (self.state.script)(&request.prompt, attempt)? {
            sink.push(chunk.as_bytes());
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

impl Drop for ScriptedBackend {
    fn drop(&mut self) {
        self.state.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Encodes tokens the way a streaming endpoint sends them: one JSON object per line.
pub fn ndjson(tokens: &[&str]) -> Vec<String> {
    let mut out: Vec<String> = tokens
        .iter()
        .map(|t| format!("{}\n", serde_json::json!({ "response": t, "done": false })))
        .collect();
    out.push(format!("{}\n", serde_json::json!({ "response": "", "done": true })));
    out
}
