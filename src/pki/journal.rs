use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for JournalLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JournalLevel::Info => f.write_str("I"),
            JournalLevel::Warn => f.write_str("W"),
            JournalLevel::Error => f.write_str("E"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub level: JournalLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Write-only sink for operator-facing events.
pub trait Journal: Send + Sync {
    fn log(&self, level: JournalLevel, message: &str);

    fn info(&self, message: &str) {
        self.log(JournalLevel::Info, message);
    }

    fn warn(&self, message: &str) {
        self.log(JournalLevel::Warn, message);
    }

    fn error(&self, message: &str) {
        self.log(JournalLevel::Error, message);
    }
}

/// Forwards journal entries to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingJournal;

impl Journal for TracingJournal {
    fn log(&self, level: JournalLevel, message: &str) {
        match level {
            JournalLevel::Info => tracing::info!(target: "pkiman::journal", "{message}"),
            JournalLevel::Warn => tracing::warn!(target: "pkiman::journal", "{message}"),
            JournalLevel::Error => tracing::error!(target: "pkiman::journal", "{message}"),
        }
    }
}

/// Keeps entries in memory, newest last.
#[derive(Debug, Default, Clone)]
pub struct MemoryJournal {
    entries: Arc<Mutex<VecDeque<JournalEntry>>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// The newest `n` entries, newest first.
    pub fn last(&self, n: usize) -> Vec<JournalEntry> {
        self.entries.lock().iter().rev().take(n).cloned().collect()
    }

    /// Drop entries older than `retention`. Returns how many were removed.
    pub fn clean(&self, retention: Duration) -> usize {
        let cutoff = Utc::now() - retention;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| entry.created_at >= cutoff);
        before - entries.len()
    }

    fn push(&self, entry: JournalEntry) {
        self.entries.lock().push_back(entry);
    }
}

impl Journal for MemoryJournal {
    fn log(&self, level: JournalLevel, message: &str) {
        self.push(JournalEntry {
            level,
            message: message.to_string(),
            created_at: Utc::now(),
        });
    }
}

/// Records to memory and forwards to `tracing`.
#[derive(Debug, Default, Clone)]
pub struct TeeJournal {
    pub memory: MemoryJournal,
}

impl Journal for TeeJournal {
    fn log(&self, level: JournalLevel, message: &str) {
        self.memory.log(level, message);
        TracingJournal.log(level, message);
    }
}
