// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The scoped run-logging fabric.
//!
//! Every scoped operation (fixture callback, test, RPC) gets a [`Logger`]
//! handle whose writes reach both its own sink and, by default, every sink
//! up the attachment chain. This is what lets a fixture's log line land in
//! the per-entity log file and the run-level console at the same time,
//! without threading writers through every call.
//!
//! A `Logger` is a capability handle, not a global: concurrent runs never
//! share sinks. Cloning is cheap, and the absence of a logger
//! ([`Logger::none`]) turns every call into a silent no-op.

use chrono::{DateTime, Utc};
use std::{
    fmt,
    io::Write,
    sync::{Arc, Mutex},
};

/// Severity of a run log message.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    /// Messages shown to the user by default.
    Info,
    /// Verbose messages.
    Debug,
}

/// A destination for run log messages.
pub trait LogSink: Send + Sync {
    /// Writes one log message.
    fn write_log(&self, level: LogLevel, time: DateTime<Utc>, message: &str);
}

struct LoggerNode {
    sink: Box<dyn LogSink>,
    parent: Option<Arc<LoggerNode>>,
}

/// A cloneable handle to a chain of log sinks.
#[derive(Clone, Default)]
pub struct Logger {
    node: Option<Arc<LoggerNode>>,
}

impl Logger {
    /// A logger that discards everything.
    pub fn none() -> Self {
        Self { node: None }
    }

    /// Creates a root logger writing to `sink`.
    pub fn new(sink: impl LogSink + 'static) -> Self {
        Self {
            node: Some(Arc::new(LoggerNode {
                sink: Box::new(sink),
                parent: None,
            })),
        }
    }

    /// Returns a logger writing to `sink` and, transitively, to every sink
    /// this logger writes to.
    pub fn attach(&self, sink: impl LogSink + 'static) -> Logger {
        Self {
            node: Some(Arc::new(LoggerNode {
                sink: Box::new(sink),
                parent: self.node.clone(),
            })),
        }
    }

    /// Returns a logger writing to `sink` only, severing propagation to this
    /// logger's sinks.
    pub fn attach_no_propagation(&self, sink: impl LogSink + 'static) -> Logger {
        Self::new(sink)
    }

    /// Logs an info-level message.
    pub fn info(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Info, message.as_ref());
    }

    /// Logs a debug-level message.
    pub fn debug(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Debug, message.as_ref());
    }

    fn emit(&self, level: LogLevel, message: &str) {
        let time = Utc::now();
        let mut node = self.node.as_deref();
        while let Some(current) = node {
            current.sink.write_log(level, time, message);
            node = current.parent.as_deref();
        }
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut depth = 0;
        let mut node = self.node.as_deref();
        while let Some(current) = node {
            depth += 1;
            node = current.parent.as_deref();
        }
        f.debug_struct("Logger").field("sinks", &depth).finish()
    }
}

/// A sink writing `[<time>] <message>` lines to a writer.
pub struct WriterSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl WriterSink {
    /// Creates a sink around the given writer.
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }
}

impl LogSink for WriterSink {
    fn write_log(&self, _level: LogLevel, time: DateTime<Utc>, message: &str) {
        let mut writer = self.writer.lock().unwrap();
        // Ignore write errors: losing a log line must not fail the run.
        let _ = writeln!(writer, "[{}] {message}", time.format("%Y-%m-%dT%H:%M:%S%.3fZ"));
    }
}

/// A sink invoking a function for every message.
pub struct FnSink<F> {
    f: F,
}

impl<F> FnSink<F>
where
    F: Fn(LogLevel, DateTime<Utc>, &str) + Send + Sync,
{
    /// Creates a sink around the given function.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> LogSink for FnSink<F>
where
    F: Fn(LogLevel, DateTime<Utc>, &str) + Send + Sync,
{
    fn write_log(&self, level: LogLevel, time: DateTime<Utc>, message: &str) {
        (self.f)(level, time, message);
    }
}

/// A sink capturing messages in memory, for assertions in tests.
#[derive(Clone, Default)]
pub struct CaptureSink {
    entries: Arc<Mutex<Vec<(LogLevel, String)>>>,
}

impl CaptureSink {
    /// Creates an empty capture sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the captured messages so far.
    pub fn entries(&self) -> Vec<(LogLevel, String)> {
        self.entries.lock().unwrap().clone()
    }

    /// Returns the captured message texts so far.
    pub fn messages(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(_, message)| message.clone())
            .collect()
    }
}

impl LogSink for CaptureSink {
    fn write_log(&self, level: LogLevel, _time: DateTime<Utc>, message: &str) {
        self.entries
            .lock()
            .unwrap()
            .push((level, message.to_owned()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn attach_propagates_to_parent() {
        let root = CaptureSink::new();
        let child = CaptureSink::new();

        let root_logger = Logger::new(root.clone());
        let child_logger = root_logger.attach(child.clone());

        child_logger.info("hello");

        assert_eq!(child.messages(), ["hello"]);
        assert_eq!(root.messages(), ["hello"], "propagation is on by default");
    }

    #[test]
    fn attach_no_propagation_isolates() {
        let root = CaptureSink::new();
        let child = CaptureSink::new();

        let root_logger = Logger::new(root.clone());
        let child_logger = root_logger.attach_no_propagation(child.clone());

        child_logger.info("quiet");

        assert_eq!(child.messages(), ["quiet"]);
        assert_eq!(root.messages(), Vec::<String>::new());
    }

    #[test]
    fn absent_logger_is_a_noop() {
        let logger = Logger::none();
        logger.info("into the void");
        logger.debug("also into the void");
    }

    #[test]
    fn levels_are_recorded() {
        let sink = CaptureSink::new();
        let logger = Logger::new(sink.clone());
        logger.info("a");
        logger.debug("b");
        assert_eq!(
            sink.entries(),
            vec![
                (LogLevel::Info, "a".to_string()),
                (LogLevel::Debug, "b".to_string())
            ]
        );
    }
}
