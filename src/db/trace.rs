//! Diagnostic sinks for statement tracing.
//!
//! While a tracing scope is active the pipeline writes the structured form of
//! each query (when there is one) and the compiled statement to a
//! [`TraceSink`]. Tracing only observes; it never changes what runs.

use std::io::Write;
use std::sync::{Arc, Mutex};

/// Receives human-readable trace lines.
pub trait TraceSink: Send + Sync {
    fn emit(&self, line: &str);
}

/// Writes trace lines to standard output.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutSink;

impl TraceSink for StdoutSink {
    fn emit(&self, line: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", line);
    }
}

/// Forwards trace lines to the `tracing` subscriber at INFO level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn emit(&self, line: &str) {
        tracing::info!(target: "modeldb::trace", "{}", line);
    }
}

/// Keeps trace lines in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines emitted so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.clear();
        }
    }
}

impl TraceSink for MemorySink {
    fn emit(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}
