//! Bounded capture of subprocess output.
//!
//! `ProcessLogger` is the sink for one subprocess's combined stdout/stderr.
//! Complete lines are sanitized, forwarded to `tracing`, and kept in a
//! fixed-capacity ring so the latest output can be reported upstream.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use strip_ansi_escapes::strip;
use tracing::info;

/// Default number of lines kept per process.
pub const DEFAULT_LOG_LINES: usize = 100;
/// Longest line kept in memory; longer output is split at this size.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

const REDACTED: &str = "***";

/// A fixed-capacity ring buffer of log lines; the oldest line is dropped first.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<String>,
}

impl LogBuffer {
    /// Creates a new `LogBuffer` with the specified maximum capacity.
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds a line, dropping the oldest ones beyond capacity.
    pub fn push(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    /// Returns an iterator over the lines, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.lines.iter()
    }
}

/// Line-oriented sink for one subprocess's output.
#[derive(Debug)]
pub struct ProcessLogger {
    agent_id: String,
    agent_type: String,
    redact_words: Vec<String>,
    inner: Mutex<LoggerState>,
}

#[derive(Debug)]
struct LoggerState {
    // Bytes of the current, not yet terminated line.
    partial: Vec<u8>,
    buffer: LogBuffer,
}

impl ProcessLogger {
    /// Creates a logger that keeps the last `max_lines` lines.
    pub fn new(agent_id: impl Into<String>, agent_type: impl Into<String>, max_lines: usize) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            redact_words: Vec::new(),
            inner: Mutex::new(LoggerState {
                partial: Vec::new(),
                buffer: LogBuffer::new(max_lines),
            }),
        }
    }

    /// Replaces every occurrence of the given words with `***` in stored and
    /// forwarded lines.
    pub fn with_redact_words(mut self, words: impl IntoIterator<Item = String>) -> Self {
        self.redact_words = words.into_iter().filter(|w| !w.is_empty()).collect();
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    /// Consumes a chunk of output. Partial lines are kept until their newline
    /// arrives in a later call, up to [`MAX_LINE_BYTES`].
    pub fn write(&self, data: &[u8]) {
        let mut state = self.lock();
        state.partial.extend_from_slice(data);
        while let Some(pos) = state.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = state.partial.drain(..=pos).collect();
            self.emit(&mut state, &raw[..pos]);
        }
        while state.partial.len() >= MAX_LINE_BYTES {
            let raw: Vec<u8> = state.partial.drain(..MAX_LINE_BYTES).collect();
            self.emit(&mut state, &raw);
        }
    }

    fn emit(&self, state: &mut LoggerState, raw: &[u8]) {
        let line = self.sanitize(raw);
        info!(
            agent_id = %self.agent_id,
            agent_type = %self.agent_type,
            "{}",
            line
        );
        state.buffer.push(line);
    }

    /// Returns up to the configured number of complete lines, oldest first.
    pub fn latest(&self) -> Vec<String> {
        self.lock().buffer.iter().cloned().collect()
    }

    fn sanitize(&self, raw: &[u8]) -> String {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let mut line = sanitize_text(raw);
        for word in &self.redact_words {
            if line.contains(word.as_str()) {
                line = line.replace(word.as_str(), REDACTED);
            }
        }
        line
    }

    fn lock(&self) -> MutexGuard<'_, LoggerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Strips ANSI escape codes; invalid UTF-8 sequences are replaced.
pub fn sanitize_text(raw: &[u8]) -> String {
    let stripped = strip(raw);
    String::from_utf8_lossy(&stripped).into_owned()
}
