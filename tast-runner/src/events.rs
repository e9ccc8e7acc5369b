// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The typed event stream produced by a test bundle.
//!
//! A bundle writes a finite sequence of events to its stdout as
//! length-prefixed JSON frames: a big-endian `u32` length followed by that
//! many bytes of a serialized [`Event`]. The host reads the stream with
//! [`read_event`] and feeds each event to the processor.

use crate::errors::EventStreamError;
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The largest frame the host will accept. Larger frames indicate a corrupt
/// stream rather than a legitimately huge message.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A shared callback receiving locally generated events (e.g. from the
/// fixture stack) for injection into the processing pipeline.
pub type EventSink = std::sync::Arc<dyn Fn(Event) + Send + Sync>;

/// A structured error attached to a run, test, or fixture.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ErrorReport {
    /// The time at which the error occurred.
    pub time: DateTime<Utc>,
    /// A human-readable reason.
    pub reason: String,
    /// The source file the error was raised from, if known.
    #[serde(default)]
    pub file: String,
    /// The line number within `file`, or 0.
    #[serde(default)]
    pub line: u32,
    /// A stack trace, if one was captured.
    #[serde(default)]
    pub stack: String,
}

impl ErrorReport {
    /// Creates an error report with just a reason, stamped with the given
    /// time.
    pub fn new(time: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            time,
            reason: reason.into(),
            file: String::new(),
            line: 0,
            stack: String::new(),
        }
    }
}

/// Static metadata for a single test, as declared by the bundle.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TestMetadata {
    /// The test's unique name.
    pub name: String,

    /// The per-test execution timeout.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Data files the test depends on.
    #[serde(default)]
    pub data_deps: Vec<String>,

    /// Software features the target must have.
    #[serde(default)]
    pub software_deps: Vec<String>,

    /// Hardware features the target must have.
    #[serde(default)]
    pub hardware_deps: Vec<String>,

    /// Free-form attributes used for test selection.
    #[serde(default)]
    pub attrs: Vec<String>,

    /// The name of the fixture this test runs under, if any.
    #[serde(default)]
    pub fixture: Option<String>,
}

impl TestMetadata {
    /// Creates metadata with just a name, for tests and callers that don't
    /// need the rest.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: None,
            data_deps: Vec::new(),
            software_deps: Vec::new(),
            hardware_deps: Vec::new(),
            attrs: Vec::new(),
            fixture: None,
        }
    }
}

/// Static metadata for a fixture.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FixtureMetadata {
    /// The fixture's unique name.
    pub name: String,
}

/// A fixture stack operation requested by an intermediate bundle.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum StackOperation {
    /// Push the named fixture onto the host-side stack.
    Push {
        /// The fixture to push.
        name: String,
    },
    /// Pop the top entry off the host-side stack.
    Pop,
    /// Reset every entry on the host-side stack.
    Reset,
}

/// One event in the bundle's output stream.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    /// The run started; `num_tests` tests will follow.
    RunStart {
        time: DateTime<Utc>,
        num_tests: usize,
    },

    /// A run-scoped log line. The bundle also uses this as its heartbeat,
    /// with the literal text `heartbeat`.
    RunLog { time: DateTime<Utc>, text: String },

    /// A run-scoped error not attributable to a single test.
    RunError {
        time: DateTime<Utc>,
        error: ErrorReport,
    },

    /// The run finished. No further events follow.
    RunEnd {
        time: DateTime<Utc>,
        log_dir: Utf8PathBuf,
        out_dir: Utf8PathBuf,
    },

    /// A test started.
    TestStart {
        time: DateTime<Utc>,
        test: TestMetadata,
    },

    /// A log line from a running test.
    TestLog {
        time: DateTime<Utc>,
        name: String,
        text: String,
    },

    /// An error raised by a running test.
    TestError {
        time: DateTime<Utc>,
        name: String,
        error: ErrorReport,
    },

    /// A test finished.
    TestEnd {
        time: DateTime<Utc>,
        name: String,
        /// Reasons the test was skipped; empty if it actually ran.
        #[serde(default)]
        skip_reasons: Vec<String>,
    },

    /// A fixture's set-up started.
    FixtureStart {
        time: DateTime<Utc>,
        fixture: FixtureMetadata,
    },

    /// A log line from a fixture callback.
    FixtureLog {
        time: DateTime<Utc>,
        name: String,
        text: String,
    },

    /// An error raised by a fixture callback.
    FixtureError {
        time: DateTime<Utc>,
        name: String,
        error: ErrorReport,
    },

    /// A fixture was torn down.
    FixtureEnd { time: DateTime<Utc>, name: String },

    /// A fixture stack operation request.
    StackOperation {
        time: DateTime<Utc>,
        op: StackOperation,
    },
}

impl Event {
    /// Returns the timestamp carried by this event.
    pub fn time(&self) -> DateTime<Utc> {
        match self {
            Event::RunStart { time, .. }
            | Event::RunLog { time, .. }
            | Event::RunError { time, .. }
            | Event::RunEnd { time, .. }
            | Event::TestStart { time, .. }
            | Event::TestLog { time, .. }
            | Event::TestError { time, .. }
            | Event::TestEnd { time, .. }
            | Event::FixtureStart { time, .. }
            | Event::FixtureLog { time, .. }
            | Event::FixtureError { time, .. }
            | Event::FixtureEnd { time, .. }
            | Event::StackOperation { time, .. } => *time,
        }
    }

    /// Returns true if this is the bundle's liveness heartbeat.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Event::RunLog { text, .. } if text == "heartbeat")
    }
}

/// Reads one event frame from `reader`.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary. EOF in the middle
/// of a frame is an I/O error.
pub async fn read_event<R>(reader: &mut R) -> Result<Option<Event>, EventStreamError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(error) => return Err(error.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(EventStreamError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let event = serde_json::from_slice(&payload).map_err(EventStreamError::Decode)?;
    Ok(Some(event))
}

/// Writes one event frame to `writer`.
pub async fn write_event<W>(writer: &mut W, event: &Event) -> Result<(), EventStreamError>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(event).map_err(EventStreamError::Decode)?;
    let len = u32::try_from(payload.len()).expect("event frame fits in u32");
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}
