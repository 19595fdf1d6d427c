use anyhow::Context;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::session::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
    Command,
}

impl LogLevel {
    pub fn to_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Success => "SUCCESS",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Command => "COMMAND",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            level,
            message: message.into(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] [{}] {}",
            self.timestamp.format("%H:%M:%S"),
            self.level,
            self.message
        )
    }
}

/// Everything a presentation layer needs, in emission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Log(LogEntry),
    Build { in_progress: bool },
    Emulator { state: SessionState },
}

#[derive(Default)]
struct LogInner {
    entries: Vec<LogEntry>,
    subscribers: Vec<mpsc::UnboundedSender<Event>>,
}

/// Append-only sink shared by every producer. Entries are recorded and
/// broadcast under one lock so subscribers observe the recording order.
#[derive(Clone, Default)]
pub struct StageLog {
    inner: Arc<Mutex<LogInner>>,
}

impl StageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push(tx);
        rx
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry::new(level, message);
        let mut inner = self.inner.lock();
        inner.entries.push(entry.clone());
        inner
            .subscribers
            .retain(|tx| tx.send(Event::Log(entry.clone())).is_ok());
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.log(LogLevel::Success, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    pub fn command(&self, message: impl Into<String>) {
        self.log(LogLevel::Command, message);
    }

    /// Broadcasts a state change without recording it as an entry.
    pub fn publish(&self, event: Event) {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
        self.info("Log cleared");
    }

    /// Writes one line per entry, oldest first.
    pub fn export(&self, path: &Path) -> anyhow::Result<()> {
        let entries = self.entries();

        let mut file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create log file: {}", path.display()))?;

        for entry in &entries {
            writeln!(file, "{}", entry)
                .with_context(|| format!("Failed to write log file: {}", path.display()))?;
        }

        Ok(())
    }
}
