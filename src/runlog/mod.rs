//! Run log: structured logging for session trees.
//!
//! Sessions, the sandbox executor and the facade emit [`LogEntry`] values into
//! a single [`RunLogger`], which fans each entry out to its sinks.
//!
//! ```text
//! Orchestrator / Session / Dispatcher
//!           │
//!           ▼
//!    RunLogger::log(entry)
//!           │
//!      ┌────┼─────┐
//!      ▼    ▼     ▼
//!  tracing memory callback
//! ```
//!
//! The facade's default logger carries a [`TracingSink`], so an application
//! that installs a `tracing` subscriber sees run events without extra wiring.

use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// Emitting component, e.g. "session", "sandbox", "dispatcher".
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Depth of the emitting session in its tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<usize>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            source: source.into(),
            session_id: None,
            depth: None,
            message: message.into(),
            payload: None,
        }
    }

    pub fn with_session(mut self, session_id: &SessionId, depth: usize) -> Self {
        self.session_id = Some(session_id.to_string());
        self.depth = Some(depth);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Single-line rendering: `<ts> <LEVEL> <source> [<session>@<depth>] <message>`.
    pub fn format_line(&self) -> String {
        let ts = self.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ");
        let session = match (&self.session_id, self.depth) {
            (Some(id), Some(depth)) => format!(" [{id}@{depth}]"),
            (Some(id), None) => format!(" [{id}]"),
            _ => String::new(),
        };
        format!("{ts} {} {}{} {}", self.level, self.source, session, self.message)
    }
}

/// Destination for log entries. Must not block for long: sessions log inline.
pub trait LogSink: Send + Sync {
    fn write(&self, entry: &LogEntry);

    fn flush(&self) {}
}

/// Fans entries out to every attached sink above a minimum level.
pub struct RunLogger {
    sinks: Vec<Arc<dyn LogSink>>,
    min_level: LogLevel,
}

impl RunLogger {
    pub fn new() -> Self {
        Self {
            sinks: Vec::new(),
            min_level: LogLevel::Trace,
        }
    }

    /// Logger that forwards everything at `Debug` and above to `tracing`.
    pub fn tracing() -> Self {
        Self::new()
            .with_level(LogLevel::Debug)
            .with_sink(Arc::new(TracingSink))
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn add_sink(&mut self, sink: Arc<dyn LogSink>) {
        self.sinks.push(sink);
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level && !self.sinks.is_empty()
    }

    pub fn log(&self, entry: &LogEntry) {
        if !self.enabled(entry.level) {
            return;
        }
        for sink in &self.sinks {
            sink.write(entry);
        }
    }

    pub fn info(&self, source: &str, message: &str) {
        self.log(&LogEntry::new(LogLevel::Info, source, message));
    }

    pub fn warn(&self, source: &str, message: &str) {
        self.log(&LogEntry::new(LogLevel::Warn, source, message));
    }

    pub fn error(&self, source: &str, message: &str) {
        self.log(&LogEntry::new(LogLevel::Error, source, message));
    }

    pub fn debug(&self, source: &str, message: &str) {
        self.log(&LogEntry::new(LogLevel::Debug, source, message));
    }

    pub fn flush(&self) {
        for sink in &self.sinks {
            sink.flush();
        }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

impl Default for RunLogger {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Built-in Sinks ────────────────────────────────────────────────────────

/// Forwards entries to the `tracing` macros at the matching level.
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, entry: &LogEntry) {
        let session = entry.session_id.as_deref().unwrap_or("-");
        let depth = entry.depth.unwrap_or(0);
        let payload = entry
            .payload
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_default();
        match entry.level {
            LogLevel::Trace => {
                tracing::trace!(source = %entry.source, session = %session, depth, payload = %payload, "{}", entry.message)
            }
            LogLevel::Debug => {
                tracing::debug!(source = %entry.source, session = %session, depth, payload = %payload, "{}", entry.message)
            }
            LogLevel::Info => {
                tracing::info!(source = %entry.source, session = %session, depth, payload = %payload, "{}", entry.message)
            }
            LogLevel::Warn => {
                tracing::warn!(source = %entry.source, session = %session, depth, payload = %payload, "{}", entry.message)
            }
            LogLevel::Error => {
                tracing::error!(source = %entry.source, session = %session, depth, payload = %payload, "{}", entry.message)
            }
        }
    }
}

/// Writes formatted lines to stdout, or to the writer it was built with.
pub struct StdoutSink {
    out: Mutex<Box<dyn Write + Send>>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self::with_writer(std::io::stdout())
    }

    pub fn with_writer(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for StdoutSink {
    fn write(&self, entry: &LogEntry) {
        let mut out = self.out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // A failed log write must not fail the session.
        let _ = writeln!(out, "{}", entry.format_line());
    }

    fn flush(&self) {
        let mut out = self.out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let _ = out.flush();
    }
}

/// Collects entries in memory.
#[derive(Default)]
pub struct MemorySink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, Vec<LogEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.guard().clone()
    }

    /// Entries whose message contains `needle`.
    pub fn matching(&self, needle: &str) -> Vec<LogEntry> {
        self.guard()
            .iter()
            .filter(|e| e.message.contains(needle))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn clear(&self) {
        self.guard().clear();
    }
}

impl LogSink for MemorySink {
    fn write(&self, entry: &LogEntry) {
        self.guard().push(entry.clone());
    }
}

/// Hands each entry to a closure.
pub struct CallbackSink {
    callback: Box<dyn Fn(&LogEntry) + Send + Sync>,
}

impl CallbackSink {
    pub fn new(callback: impl Fn(&LogEntry) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl LogSink for CallbackSink {
    fn write(&self, entry: &LogEntry) {
        (self.callback)(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entry_carries_session_and_depth() {
        let id = SessionId::new();
        let entry = LogEntry::new(LogLevel::Info, "session", "started").with_session(&id, 2);
        assert_eq!(entry.session_id.as_deref(), Some(id.as_str()));
        assert_eq!(entry.depth, Some(2));
        let line = entry.format_line();
        assert!(line.contains(&format!("[{id}@2]")));
        assert!(line.contains("INFO session"));
    }

    #[test]
    fn entry_serializes_without_empty_fields() {
        let entry = LogEntry::new(LogLevel::Warn, "sandbox", "rejected")
            .with_payload(json!({"category": "filesystem"}));
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["level"], "warn");
        assert_eq!(value["payload"]["category"], "filesystem");
        assert!(value.get("session_id").is_none());
        assert!(value.get("depth").is_none());

        let back: LogEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back.message, "rejected");
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn stdout_sink_writes_formatted_lines() {
        let buf = SharedBuf::default();
        let logger = RunLogger::new()
            .with_level(LogLevel::Info)
            .with_sink(Arc::new(StdoutSink::with_writer(buf.clone())));
        let id = SessionId::new();
        logger.log(&LogEntry::new(LogLevel::Debug, "session", "hidden").with_session(&id, 0));
        logger.log(&LogEntry::new(LogLevel::Warn, "session", "program rejected").with_session(&id, 1));
        logger.flush();

        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains(&format!("[{id}@1] program rejected")), "{text}");
    }

    #[test]
    fn level_ordering() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn logger_filters_by_level() {
        let sink = Arc::new(MemorySink::new());
        let logger = RunLogger::new()
            .with_level(LogLevel::Warn)
            .with_sink(sink.clone());

        logger.debug("test", "hidden");
        logger.info("test", "hidden");
        logger.warn("test", "shown");
        logger.error("test", "shown");

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.matching("shown").len(), 2);
    }

    #[test]
    fn logger_fans_out() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let mut logger = RunLogger::new();
        logger.add_sink(a.clone());
        logger.add_sink(b.clone());
        logger.info("test", "hello");
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(logger.sink_count(), 2);
    }

    #[test]
    fn logger_without_sinks_is_disabled() {
        let logger = RunLogger::new();
        assert!(!logger.enabled(LogLevel::Error));
        logger.error("test", "dropped");
    }

    #[test]
    fn tracing_logger_has_one_sink() {
        let logger = RunLogger::tracing();
        assert_eq!(logger.sink_count(), 1);
        assert!(!logger.enabled(LogLevel::Trace));
        assert!(logger.enabled(LogLevel::Debug));
        // No subscriber installed; forwarding must still be harmless.
        logger.info("test", "to tracing");
    }

    #[test]
    fn callback_sink_invokes() {
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = counter.clone();
        let sink = CallbackSink::new(move |_| {
            c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        sink.write(&LogEntry::new(LogLevel::Info, "test", "msg"));
        sink.write(&LogEntry::new(LogLevel::Info, "test", "msg"));
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn memory_sink_clear() {
        let sink = MemorySink::new();
        sink.write(&LogEntry::new(LogLevel::Info, "test", "msg"));
        assert!(!sink.is_empty());
        sink.clear();
        assert!(sink.is_empty());
    }
}
