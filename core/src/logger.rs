use crate::log::{Event, LogEntry, LogLevel};
use std::io::Write;

/// Terminal renderer for the event stream.
pub struct Logger {
    use_colors: bool,
    json: bool,
}

impl Logger {
    pub fn new() -> Self {
        Self {
            use_colors: atty::is(atty::Stream::Stdout),
            json: false,
        }
    }

    pub fn json() -> Self {
        Self {
            use_colors: false,
            json: true,
        }
    }

    pub fn event(&self, event: &Event) {
        if self.json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{}", line),
                Err(err) => eprintln!("Failed to encode event: {}", err),
            }
            let _ = std::io::stdout().flush();
            return;
        }

        match event {
            Event::Log(entry) => self.log_entry(entry),
            // Progress and session state are shown through their log entries.
            Event::Build { .. } | Event::Emulator { .. } => {}
        }
    }

    pub fn log_entry(&self, entry: &LogEntry) {
        println!("{}", self.format_entry(entry));
        let _ = std::io::stdout().flush();
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        self.log_entry(&LogEntry::new(level, message));
    }

    fn format_entry(&self, entry: &LogEntry) -> String {
        if !self.use_colors {
            return entry.to_string();
        }

        let color = match entry.level {
            LogLevel::Info => "\x1b[37m",
            LogLevel::Success => "\x1b[32m",
            LogLevel::Warning => "\x1b[33m",
            LogLevel::Error => "\x1b[31;1m",
            LogLevel::Command => "\x1b[36m",
        };

        format!(
            "\x1b[90m[{}]\x1b[0m {}[{}] {}\x1b[0m",
            entry.timestamp.format("%H:%M:%S"),
            color,
            entry.level,
            entry.message
        )
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}
