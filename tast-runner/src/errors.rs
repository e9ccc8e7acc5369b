// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by the tast runner.

use crate::target::ForwardKind;
use camino::Utf8PathBuf;
use std::{io, process::ExitStatus, time::Duration};
use thiserror::Error;

/// An error that occurred while parsing a target endpoint string.
#[derive(Clone, Debug, Error)]
#[error("invalid target endpoint `{input}`: {message}")]
pub struct EndpointParseError {
    input: String,
    message: &'static str,
}

impl EndpointParseError {
    pub(crate) fn new(input: impl Into<String>, message: &'static str) -> Self {
        Self {
            input: input.into(),
            message,
        }
    }
}

/// An error produced while establishing or using an SSH connection to the
/// target.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The ssh client binary could not be spawned.
    #[error("failed to spawn ssh")]
    SpawnSsh(#[source] io::Error),

    /// The control master exited before the connection was usable.
    #[error("ssh control master exited early with {status}")]
    MasterExited {
        /// The exit status of the master process.
        status: ExitStatus,
    },

    /// The target could not be reached within the connect budget.
    #[error("failed to connect to {endpoint} after {attempts} attempts")]
    ConnectTimeout {
        /// The endpoint that was dialed.
        endpoint: String,
        /// The number of connection attempts made.
        attempts: usize,
    },

    /// A remote command did not complete in time.
    #[error("remote command `{command}` did not complete within {}", humantime::format_duration(*.timeout))]
    CommandTimeout {
        /// The command that was run.
        command: String,
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// A remote command failed to run.
    #[error("remote command `{command}` failed")]
    Command {
        /// The command that was run.
        command: String,
        #[source]
        error: io::Error,
    },

    /// A remote command exited with a non-zero status.
    #[error("remote command `{command}` exited with {status}")]
    CommandFailed {
        /// The command that was run.
        command: String,
        /// The exit status.
        status: ExitStatus,
    },

    /// The connection cache is closed; no further connections will be made.
    #[error("connection cache is closed")]
    Closed,
}

/// An error produced while creating or releasing a port forward.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The forward could not be established.
    #[error("failed to establish {kind:?} forward `{spec}`")]
    Establish {
        /// Which service the forward belongs to.
        kind: ForwardKind,
        /// The ssh forward specification.
        spec: String,
        #[source]
        error: io::Error,
    },

    /// ssh did not report the port allocated for a reverse forward.
    #[error("no allocated port reported for reverse forward `{spec}`")]
    NoAllocatedPort {
        /// The ssh forward specification.
        spec: String,
    },
}

/// A failure reported by a fixture callback.
///
/// This is the error type fixtures themselves return; the stack wraps it
/// into entity errors and status transitions.
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct FixtureFailure {
    message: String,
}

impl FixtureFailure {
    /// Creates a new fixture failure with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// An error produced while reading or writing the bundle event stream.
#[derive(Debug, Error)]
pub enum EventStreamError {
    /// An I/O error occurred on the stream.
    #[error("event stream I/O error")]
    Io(#[from] io::Error),

    /// An event frame could not be decoded.
    #[error("malformed event frame")]
    Decode(#[source] serde_json::Error),

    /// A frame exceeded the maximum permitted size.
    #[error("event frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// The advertised frame length.
        len: usize,
        /// The maximum permitted frame length.
        max: usize,
    },
}

/// An error produced by the event stream processor.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The bundle violated the event protocol.
    #[error("event protocol violation: {message}")]
    Protocol {
        /// Description of the violation.
        message: String,
    },

    /// A result record could not be written.
    #[error("failed to write results under `{path}`")]
    WriteResults {
        /// The file or directory being written.
        path: Utf8PathBuf,
        #[source]
        error: io::Error,
    },
}

/// An error produced by one handler in the processor pipeline.
///
/// Handler errors are recoverable: the processor records them as run-level
/// errors and keeps dispatching, per the rule that local handlers never
/// abort the event loop.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Creates a new handler error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<io::Error> for HandlerError {
    fn from(error: io::Error) -> Self {
        Self::new(error.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(error.to_string())
    }
}

impl From<ProcessorError> for HandlerError {
    fn from(error: ProcessorError) -> Self {
        Self::new(error.to_string())
    }
}

impl From<ConnectionError> for HandlerError {
    fn from(error: ConnectionError) -> Self {
        Self::new(error.to_string())
    }
}

impl From<FixtureFailure> for HandlerError {
    fn from(error: FixtureFailure) -> Self {
        Self::new(error.to_string())
    }
}

impl From<ReportsError> for HandlerError {
    fn from(error: ReportsError) -> Self {
        Self::new(error.to_string())
    }
}

/// An error produced while supervising the bundle process.
#[derive(Debug, Error)]
pub enum BundleError {
    /// The bundle process could not be spawned.
    #[error("failed to spawn bundle `{bundle}`")]
    Spawn {
        /// The bundle that was launched.
        bundle: String,
        #[source]
        error: io::Error,
    },

    /// The serialized run config could not be written to the bundle's stdin.
    #[error("failed to write run config to bundle stdin")]
    StdinWrite(#[source] io::Error),

    /// The event stream broke before `RunEnd` was observed.
    #[error("event stream ended before the run completed")]
    StreamBroken(#[source] EventStreamError),

    /// The bundle exited with a non-zero status before `RunEnd`.
    #[error("bundle exited with {status} before the run completed{}", format_stderr_tail(.stderr_tail))]
    EarlyExit {
        /// The exit status.
        status: ExitStatus,
        /// The last few lines of the bundle's stderr.
        stderr_tail: Vec<String>,
    },

    /// No event was received within the stall budget.
    #[error("no message received from bundle in {}", humantime::format_duration(*.budget))]
    Stalled {
        /// The stall budget that was exceeded.
        budget: Duration,
    },

    /// A process that is not a debugger is listening on the debug port.
    #[error("process `{process}` (not a debugger) is listening on port {port}")]
    DebugPortBusy {
        /// The configured debug port.
        port: u16,
        /// The name of the offending process.
        process: String,
    },

    /// The debug port could not be inspected or cleared.
    #[error("failed to clear debug port {port}")]
    DebugPortCheck {
        /// The configured debug port.
        port: u16,
        #[source]
        error: ConnectionError,
    },
}

/// An error produced by the reports server or the upstream progress sink
/// bridge.
#[derive(Debug, Error)]
pub enum ReportsError {
    /// A report referenced a test with no request-name mapping.
    #[error("test `{name}` has no request name mapping")]
    UnknownTest {
        /// The unmapped test name.
        name: String,
    },

    /// An upstream RPC failed.
    #[error("progress sink call failed")]
    Upstream(#[source] tonic::Status),

    /// The transport to the upstream sink failed.
    #[error("progress sink transport failed")]
    Transport(#[source] tonic::transport::Error),

    /// The local listener could not be bound.
    #[error("failed to bind reports server listener")]
    Bind(#[source] io::Error),
}

/// The error returned when a retry attempt produced no results at all.
///
/// Without this guard an empty attempt would loop forever.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("no test ran in the last attempt")]
pub struct NoTestRanInLastAttempt;

/// A fatal, run-terminating failure.
///
/// The run returns whatever results were accumulated together with one of
/// these as the reason.
#[derive(Debug, Error)]
pub enum RunFailure {
    /// The target could not be (re)connected within the full budget.
    #[error("target connection lost and could not be recovered")]
    Connection(#[source] ConnectionError),

    /// A port forward required by the run could not be established.
    #[error("port forwarding failed")]
    Forward(#[source] ForwardError),

    /// The bundle failed in a way that is not attributable to a single test.
    #[error("test bundle failed")]
    Bundle(#[source] BundleError),

    /// The event stream processor hit a protocol violation.
    #[error("event stream processing failed")]
    Processor(#[source] ProcessorError),

    /// The reports server failed.
    #[error("reports server failed")]
    Reports(#[source] ReportsError),

    /// The maximum-failures threshold was reached.
    #[error("maximum failure threshold ({threshold}) reached")]
    MaxFailReached {
        /// The configured threshold.
        threshold: usize,
    },

    /// The run was cancelled.
    #[error("{reason}")]
    Cancelled {
        /// Why the run was cancelled.
        reason: crate::cancel::CancelReason,
    },

    /// A retry attempt produced no results.
    #[error(transparent)]
    NoTestRan(#[from] NoTestRanInLastAttempt),
}

fn format_stderr_tail(tail: &[String]) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!("; last stderr lines:\n  {}", tail.join("\n  "))
    }
}
