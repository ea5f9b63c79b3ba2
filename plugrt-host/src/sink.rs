//! Log sinks for plugin lifecycle messages
//!
//! The runtime reports batch failures, compiler warnings and lifecycle
//! progress through a [`LogSink`]. Hosts pick where those messages go; the
//! default forwards them to `tracing`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::RwLock;

/// Category used for every message written by the runtime
pub const LOG_CATEGORY: &str = "PLUG";

/// Severity of a log message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// A recorded log message
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub category: String,
    pub text: String,
}

/// Destination for runtime log messages
pub trait LogSink: Send + Sync {
    /// Record a leveled message
    fn write_message(&self, level: LogLevel, category: &str, text: &str);

    /// Record a failure, with the full error chain appended to `context`
    fn write_error(&self, category: &str, context: &str, error: &dyn std::error::Error) {
        self.write_message(LogLevel::Error, category, &format_error(context, error));
    }
}

/// Render `context` followed by every error in the source chain
pub fn format_error(context: &str, error: &dyn std::error::Error) -> String {
    let mut text = format!("{}: {}", context, error);
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str(&format!(": {}", cause));
        source = cause.source();
    }
    text
}

// ============================================================================
// Default Implementations
// ============================================================================

/// Sink that forwards to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn write_message(&self, level: LogLevel, category: &str, text: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(category, "{}", text),
            LogLevel::Info => tracing::info!(category, "{}", text),
            LogLevel::Warning => tracing::warn!(category, "{}", text),
            LogLevel::Error => tracing::error!(category, "{}", text),
        }
    }
}

/// In-memory sink, mostly for tests
pub struct MemoryLogSink {
    entries: RwLock<VecDeque<LogEntry>>,
    max_entries: usize,
}

impl MemoryLogSink {
    /// Create a new memory sink with default capacity (1000 entries)
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    /// Create a new memory sink with specified capacity
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(max_entries.min(1000))),
            max_entries,
        }
    }

    /// Get all recorded entries, oldest first
    pub fn entries(&self) -> Vec<LogEntry> {
        match self.entries.read() {
            Ok(entries) => entries.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    pub fn count(&self) -> usize {
        self.entries().len()
    }

    /// Entries at exactly `level`
    pub fn find_by_level(&self, level: LogLevel) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.level == level)
            .collect()
    }

    /// Entries whose text mentions `needle`
    pub fn find_containing(&self, needle: &str) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.text.contains(needle))
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }
}

impl Default for MemoryLogSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for MemoryLogSink {
    fn write_message(&self, level: LogLevel, category: &str, text: &str) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            category: category.to_string(),
            text: text.to_string(),
        };
        let mut entries = match self.entries.write() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.max_entries == 0 {
            return;
        }
        if entries.len() >= self.max_entries {
            entries.pop_front(); // FIFO eviction
        }
        entries.push_back(entry);
    }
}

impl fmt::Debug for MemoryLogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLogSink")
            .field("count", &self.count())
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLogSink;

impl LogSink for NullLogSink {
    fn write_message(&self, _level: LogLevel, _category: &str, _text: &str) {}
}
