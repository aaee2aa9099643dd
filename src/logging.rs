//! Logging facade for controllers
//!
//! Controllers never talk to a concrete sink. They hold an injected [`Logger`]
//! plus explicit verbosity flags, and emit through the severity helpers on
//! [`ControllerLog`]. The default sink forwards everything to `tracing`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Severity attached to every log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimal capability a log sink has to provide
///
/// `fields` are key/value pairs attached to the record (cluster name,
/// namespace, worker name, ...).
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, msg: &str, fields: &[(&str, &str)]);
}

pub type SharedLogger = Arc<dyn Logger>;

/// Sink that forwards records to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, msg: &str, fields: &[(&str, &str)]) {
        let fields = format_fields(fields);
        match level {
            LogLevel::Trace => tracing::trace!(fields = %fields, "{}", msg),
            LogLevel::Debug => tracing::debug!(fields = %fields, "{}", msg),
            LogLevel::Info => tracing::info!(fields = %fields, "{}", msg),
            LogLevel::Error => tracing::error!(fields = %fields, "{}", msg),
            // tracing has no level above error
            LogLevel::Fatal => tracing::error!(fatal = true, fields = %fields, "{}", msg),
        }
    }
}

/// Sink that discards every record
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogger;

impl Logger for NullLogger {
    fn log(&self, _level: LogLevel, _msg: &str, _fields: &[(&str, &str)]) {}
}

fn format_fields(fields: &[(&str, &str)]) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Verbosity flags held by a controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOptions {
    /// Emit debug-level records
    #[serde(default)]
    pub debug: bool,

    /// Emit trace-level records (requests sent to the orchestration API)
    #[serde(default)]
    pub trace: bool,
}

/// Per-controller logging handle
///
/// Every record carries the cluster identity so that several controllers can
/// share one sink.
#[derive(Clone)]
pub struct ControllerLog {
    sink: SharedLogger,
    options: LogOptions,
    namespace: String,
    cluster: String,
}

impl ControllerLog {
    pub fn new(
        sink: SharedLogger,
        options: LogOptions,
        namespace: impl Into<String>,
        cluster: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            options,
            namespace: namespace.into(),
            cluster: cluster.into(),
        }
    }

    fn emit(&self, level: LogLevel, msg: &str) {
        self.sink.log(
            level,
            msg,
            &[("namespace", &self.namespace), ("cluster", &self.cluster)],
        );
    }

    /// Informational events
    pub fn notice(&self, msg: impl AsRef<str>) {
        self.emit(LogLevel::Info, msg.as_ref());
    }

    /// Errors and warnings
    pub fn error(&self, msg: impl AsRef<str>) {
        self.emit(LogLevel::Error, msg.as_ref());
    }

    /// Conditions after which the controller cannot continue
    pub fn fatal(&self, msg: impl AsRef<str>) {
        self.emit(LogLevel::Fatal, msg.as_ref());
    }

    pub fn debug(&self, msg: impl AsRef<str>) {
        if self.options.debug {
            self.emit(LogLevel::Debug, msg.as_ref());
        }
    }

    pub fn trace(&self, msg: impl AsRef<str>) {
        if self.options.trace {
            self.emit(LogLevel::Trace, msg.as_ref());
        }
    }
}

impl fmt::Debug for ControllerLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerLog")
            .field("options", &self.options)
            .field("namespace", &self.namespace)
            .field("cluster", &self.cluster)
            .finish()
    }
}

/// Sink that keeps every record in memory
///
/// Used by tests to assert on what a controller reported.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    records: std::sync::Mutex<Vec<LogRecord>>,
}

/// A captured log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub msg: String,
    pub fields: Vec<(String, String)>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Records at exactly the given level
    pub fn at_level(&self, level: LogLevel) -> Vec<LogRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.level == level)
            .collect()
    }
}

impl Logger for MemoryLogger {
    fn log(&self, level: LogLevel, msg: &str, fields: &[(&str, &str)]) {
        let record = LogRecord {
            level,
            msg: msg.to_string(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}
