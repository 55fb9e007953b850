//! Log sink types
//!
//! A log sink is the line-oriented target that image pull progress and
//! container output end up in. Every line carries a source label such as
//! `container "redis" STDOUT`.

use std::sync::{Arc, Mutex, PoisonError};

/// Line-oriented log target
pub trait LogSink: Send + Sync {
    /// Writes one complete line (without its trailing newline)
    fn write_line(&self, source: &str, line: &str);
}

/// Log sink forwarding every line to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn write_line(&self, source: &str, line: &str) {
        tracing::info!(target: "berth::logs", source = %source, "{}", line);
    }
}

/// Log sink keeping every line in memory
///
/// Clones share the same storage, so a test can hand one clone to the
/// orchestrator and inspect another.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogSink {
    lines: Arc<Mutex<Vec<(String, String)>>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all `(source, line)` pairs written so far
    pub fn lines(&self) -> Vec<(String, String)> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the lines written by one source
    pub fn lines_from(&self, source: &str) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(s, _)| s == source)
            .map(|(_, l)| l.clone())
            .collect()
    }
}

impl LogSink for MemoryLogSink {
    fn write_line(&self, source: &str, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((source.to_string(), line.to_string()));
    }
}

/// Splits a byte stream into lines
///
/// Bytes are held until their newline arrives. Empty lines are dropped and a
/// trailing `\r` is stripped.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `data` and returns every line it completed
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(data);

        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);

        complete
            .split(|b| *b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .filter(|line| !line.is_empty())
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }

    /// Number of bytes waiting for a newline
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drops the pending partial line, returning how many bytes were dropped
    pub fn discard(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }
}
