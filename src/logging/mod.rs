//! Logging and output control
//!
//! This module provides the [`Logger`] used by the extraction pipeline and the image
//! store for their diagnostics. A logger carries its destination ([`LogSink`]),
//! verbosity switches and a set of key/value fields that are attached to every
//! line it writes, so the pipeline can hand the store a logger already annotated
//! with the directory being populated.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Severity of a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// A single line recorded by a capturing logger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: Level,
    pub message: String,
    pub fields: Vec<(String, String)>,
}

impl LogRecord {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Where a logger's output goes
#[derive(Debug, Clone, Default)]
pub enum LogSink {
    /// Drop everything
    #[default]
    Discard,
    /// Print to standard output (errors go to standard error)
    Stdout,
    /// Keep records in memory, shared between clones
    Capture(Arc<Mutex<Vec<LogRecord>>>),
}

/// Logger responsible for all diagnostic output
#[derive(Debug, Clone)]
pub struct Logger {
    pub verbose: bool,
    pub quiet: bool,
    pub start_time: Option<Instant>,
    sink: LogSink,
    fields: Vec<(String, String)>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::discard()
    }
}

impl Logger {
    /// Standard output logger; `verbose` enables trace/debug/detail lines
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            quiet: false,
            start_time: Some(Instant::now()),
            sink: LogSink::Stdout,
            fields: Vec::new(),
        }
    }

    /// Standard output logger that only reports errors
    pub fn new_quiet() -> Self {
        Self {
            quiet: true,
            ..Self::new(false)
        }
    }

    /// Logger that writes nothing; used when the caller doesn't supply one
    pub fn discard() -> Self {
        Self {
            sink: LogSink::Discard,
            ..Self::new(false)
        }
    }

    /// Standard output logger at the default verbosity
    pub fn stdout() -> Self {
        Self::new(false)
    }

    /// Logger that records every line in memory, for tests and embedding callers
    pub fn capture() -> Self {
        Self {
            sink: LogSink::Capture(Arc::new(Mutex::new(Vec::new()))),
            ..Self::new(true)
        }
    }

    /// Returns a copy of this logger that annotates every line with `key=value`.
    /// An existing field with the same key is replaced.
    pub fn with_field(&self, key: &str, value: impl fmt::Display) -> Self {
        let mut logger = self.clone();
        let value = value.to_string();
        match logger.fields.iter_mut().find(|(k, _)| k == key) {
            Some(existing) => existing.1 = value,
            None => logger.fields.push((key.to_string(), value)),
        }
        logger
    }

    /// Shorthand for annotating the line with an `error` field
    pub fn with_error(&self, err: &dyn std::error::Error) -> Self {
        self.with_field("error", err)
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Records kept by a capturing logger; empty for other sinks
    pub fn records(&self) -> Vec<LogRecord> {
        match &self.sink {
            LogSink::Capture(records) => records
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
            _ => Vec::new(),
        }
    }

    /// Main section heading
    pub fn section(&self, title: &str) {
        if !self.quiet {
            self.emit(Level::Info, &format!("\n=== {} ===", title), "");
        }
    }

    // Structured logging levels
    pub fn trace(&self, message: &str) {
        if self.verbose && !self.quiet {
            self.emit(Level::Trace, message, "🔍 TRACE: ");
        }
    }

    pub fn debug(&self, message: &str) {
        if self.verbose && !self.quiet {
            self.emit(Level::Debug, message, "🐛 DEBUG: ");
        }
    }

    /// Information message
    pub fn info(&self, message: &str) {
        if !self.quiet {
            self.emit(Level::Info, message, "ℹ️  ");
        }
    }

    /// Success message
    pub fn success(&self, message: &str) {
        if !self.quiet {
            self.emit(Level::Info, message, "✅ ");
        }
    }

    /// Warning message
    pub fn warning(&self, message: &str) {
        if !self.quiet {
            self.emit(Level::Warn, message, "⚠️  WARNING: ");
        }
    }

    /// Error message
    pub fn error(&self, message: &str) {
        self.emit(Level::Error, message, "❌ ERROR: ");
    }

    /// Step information
    pub fn step(&self, message: &str) {
        if !self.quiet {
            self.emit(Level::Info, message, "▶️  ");
        }
    }

    /// Detailed information (only shown in verbose mode)
    pub fn detail(&self, message: &str) {
        if self.verbose && !self.quiet {
            self.emit(Level::Debug, message, "   ");
        }
    }

    fn emit(&self, level: Level, message: &str, prefix: &str) {
        match &self.sink {
            LogSink::Discard => {}
            LogSink::Stdout => {
                let line = format!("{}{}{}", prefix, message, self.render_fields());
                if level == Level::Error {
                    eprintln!("{}", line);
                } else {
                    let mut stdout = io::stdout().lock();
                    let _ = writeln!(stdout, "{}", line);
                }
            }
            LogSink::Capture(records) => {
                records
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(LogRecord {
                        level,
                        message: message.to_string(),
                        fields: self.fields.clone(),
                    });
            }
        }
    }

    fn render_fields(&self) -> String {
        let mut rendered = String::new();
        for (key, value) in &self.fields {
            if value.contains(char::is_whitespace) {
                rendered.push_str(&format!(" {}={:?}", key, value));
            } else {
                rendered.push_str(&format!(" {}={}", key, value));
            }
        }
        rendered
    }

    /// Format file size in human-readable units
    pub fn format_size(&self, bytes: u64) -> String {
        if bytes < 1024 {
            format!("{} B", bytes)
        } else if bytes < 1024 * 1024 {
            format!("{:.1} KB", bytes as f64 / 1024.0)
        } else if bytes < 1024 * 1024 * 1024 {
            format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
        } else {
            format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
        }
    }

    /// Format duration in human-readable format
    pub fn format_duration(&self, duration: Duration) -> String {
        let secs = duration.as_secs();
        if secs < 60 {
            format!("{:.1}s", duration.as_secs_f64())
        } else if secs < 3600 {
            format!("{}m{}s", secs / 60, secs % 60)
        } else {
            format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
        }
    }

    /// Time since this logger (or the logger it was derived from) was created
    pub fn elapsed(&self) -> Duration {
        self.start_time
            .map(|start| start.elapsed())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_keeps_fields_on_every_line() {
        let logger = Logger::capture();
        let annotated = logger.with_field("dir", "image-abc");
        annotated.info("pulling");
        annotated.with_field("dir", "image-def").warning("replaced");
        logger.info("plain");

        let records = logger.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].field("dir"), Some("image-abc"));
        assert_eq!(records[1].level, Level::Warn);
        assert_eq!(records[1].field("dir"), Some("image-def"));
        assert!(records[2].fields.is_empty());
    }

    #[test]
    fn discard_records_nothing() {
        let logger = Logger::discard().with_field("dir", "x");
        logger.info("hello");
        logger.error("boom");
        assert!(logger.records().is_empty());
    }

    #[test]
    fn quiet_suppresses_everything_but_errors() {
        let logger = Logger::capture();
        let quiet = Logger {
            quiet: true,
            ..logger.clone()
        };
        quiet.info("hidden");
        quiet.warning("hidden");
        quiet.detail("hidden");
        quiet.error("shown");

        let records = logger.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, Level::Error);
    }

    #[test]
    fn detail_needs_verbose() {
        let logger = Logger::capture();
        let terse = Logger {
            verbose: false,
            ..logger.clone()
        };
        terse.detail("hidden");
        terse.debug("hidden");
        logger.detail("shown");
        assert_eq!(logger.records().len(), 1);
    }

    #[test]
    fn fields_render_quoted_when_needed() {
        let logger = Logger::discard()
            .with_field("dir", "image-1")
            .with_field("error", "no such file");
        assert_eq!(logger.render_fields(), " dir=image-1 error=\"no such file\"");
    }

    #[test]
    fn test_format_size() {
        let logger = Logger::discard();
        assert_eq!(logger.format_size(512), "512 B");
        assert_eq!(logger.format_size(2048), "2.0 KB");
        assert_eq!(logger.format_size(5 * 1024 * 1024), "5.0 MB");
    }
}
