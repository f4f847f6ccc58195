// src/generate/stream.rs
//! Reassembles a newline-delimited token stream into one string.
//!
//! Each line is either a JSON object whose `response` field holds the next
//! token, or plain text appended as-is. Bytes are held back until a line is
//! complete, so a multi-byte character split across network chunks survives.

use serde_json::Value;

#[derive(Debug, Default)]
pub struct StreamAssembler {
    pending: Vec<u8>,
    tokens: Vec<String>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes in arrival order.
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.take_line(&line[..line.len() - 1]);
        }
    }

    fn take_line(&mut self, raw: &[u8]) {
        let decoded = String::from_utf8_lossy(raw);
        let line = decoded.trim_end_matches('\r');
        if line.is_empty() {
            return;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(obj)) => {
                if let Some(Value::String(token)) = obj.get("response") {
                    self.tokens.push(token.clone());
                }
            }
            _ => self.tokens.push(line.to_string()),
        }
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Flushes an unterminated last line and concatenates all tokens.
    pub fn finish(mut self) -> String {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.take_line(&rest);
        }
        self.tokens.concat()
    }
}
