// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The event stream processor.
//!
//! The processor consumes the finite sequence of typed events a bundle
//! writes and dispatches each one to an ordered pipeline of [`Handler`]s.
//! Events are delivered in FIFO order and handlers run sequentially per
//! event; the log-file handler depends on that ordering to produce
//! well-ordered output.
//!
//! The processor is also where the exactly-one-start/end invariant is
//! enforced: if the bundle crashes mid-test, [`EventProcessor::finalize`]
//! synthesizes a terminal error and an end event for every in-flight entity
//! so downstream consumers never see a dangling start.

pub mod handlers;

use crate::{
    errors::{HandlerError, ProcessorError},
    events::{ErrorReport, Event, StackOperation, TestMetadata},
    logging::Logger,
    results::{self, TestResult},
};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::{
    any::Any,
    collections::{BTreeMap, BTreeSet},
    panic::AssertUnwindSafe,
};
use tokio::time::Instant;
use tracing::debug;

/// Dispatches one handler call across the pipeline, sequentially, recording
/// (but not propagating) per-handler failures. A panicking handler is
/// recovered: the panic becomes an error on the innermost open test and the
/// remaining handlers still see the event.
macro_rules! dispatch {
    ($self:ident, $method:ident($($arg:expr),*)) => {{
        let mut failures = Vec::new();
        let mut panics = Vec::new();
        for handler in &mut $self.handlers {
            let call = AssertUnwindSafe(handler.$method(&$self.cx, $($arg),*));
            match call.catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => failures.push(error),
                Err(payload) => panics.push(panic_payload_to_string(payload)),
            }
        }
        for error in failures {
            $self.record_handler_error(error);
        }
        for message in panics {
            $self.record_handler_panic(message);
        }
    }};
}

/// Extracts a string message from a panic payload.
fn panic_payload_to_string(payload: Box<dyn Any + Send + 'static>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Whether an entity is a test or a fixture.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntityKind {
    /// A test.
    Test,
    /// A fixture.
    Fixture,
}

/// The live state of a started-but-not-ended entity.
#[derive(Clone, Debug)]
pub struct EntityState {
    /// Test or fixture.
    pub kind: EntityKind,

    /// The entity's name.
    pub name: String,

    /// Full metadata, for tests.
    pub test: Option<TestMetadata>,

    /// When the entity started, as reported by the bundle.
    pub start_time: DateTime<Utc>,

    /// Errors recorded so far.
    pub errors: Vec<ErrorReport>,

    /// The local log file for the entity.
    pub log_path: Utf8PathBuf,

    /// The local directory artifacts are copied into.
    pub out_dir: Utf8PathBuf,

    /// The instant at which the entity's timeout fires, if it has one.
    pub deadline: Option<Instant>,
}

/// Shared context passed to every handler call.
#[derive(Clone, Debug)]
pub struct HandlerContext {
    /// The run's results directory.
    pub results_dir: Utf8PathBuf,

    /// The run-level logger.
    pub logger: Logger,
}

/// One stage in the processing pipeline.
///
/// Every method has a no-op default so handlers implement only what they
/// care about. Errors are recorded as run-level errors and do not stop the
/// pipeline.
#[async_trait]
pub trait Handler: Send {
    /// The run started.
    async fn run_start(
        &mut self,
        _cx: &HandlerContext,
        _num_tests: usize,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    /// A run-scoped log line arrived.
    async fn run_log(
        &mut self,
        _cx: &HandlerContext,
        _time: DateTime<Utc>,
        _text: &str,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    /// A run-scoped error arrived.
    async fn run_error(
        &mut self,
        _cx: &HandlerContext,
        _error: &ErrorReport,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    /// The run finished.
    async fn run_end(
        &mut self,
        _cx: &HandlerContext,
        _log_dir: &Utf8Path,
        _out_dir: &Utf8Path,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    /// An entity started.
    async fn entity_start(
        &mut self,
        _cx: &HandlerContext,
        _entity: &EntityState,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    /// An entity logged a line.
    async fn entity_log(
        &mut self,
        _cx: &HandlerContext,
        _entity: &EntityState,
        _time: DateTime<Utc>,
        _text: &str,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    /// An entity recorded an error.
    async fn entity_error(
        &mut self,
        _cx: &HandlerContext,
        _entity: &EntityState,
        _error: &ErrorReport,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    /// An entity ended. For tests, `result` carries the completed record.
    async fn entity_end(
        &mut self,
        _cx: &HandlerContext,
        _entity: &EntityState,
        _result: Option<&TestResult>,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    /// An intermediate bundle requested a fixture stack operation.
    async fn stack_operation(
        &mut self,
        _cx: &HandlerContext,
        _op: &StackOperation,
    ) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Drives a pipeline of handlers over a bundle's event stream.
pub struct EventProcessor {
    cx: HandlerContext,
    handlers: Vec<Box<dyn Handler>>,
    /// Open entities in start order. The bundle runs entities sequentially,
    /// so this is the fixture spine plus at most one test.
    open: Vec<EntityState>,
    /// Names of entities that have already ended.
    ended: BTreeSet<String>,
    /// Errors that arrived before their entity's start.
    pending_errors: BTreeMap<String, Vec<ErrorReport>>,
    results: Vec<TestResult>,
    run_errors: Vec<ErrorReport>,
    run_started: bool,
    run_ended: bool,
}

impl EventProcessor {
    /// Creates a processor with an empty pipeline.
    pub fn new(results_dir: Utf8PathBuf, logger: Logger) -> Self {
        Self {
            cx: HandlerContext {
                results_dir,
                logger,
            },
            handlers: Vec::new(),
            open: Vec::new(),
            ended: BTreeSet::new(),
            pending_errors: BTreeMap::new(),
            results: Vec::new(),
            run_errors: Vec::new(),
            run_started: false,
            run_ended: false,
        }
    }

    /// Appends a handler to the pipeline. Handlers see each event in the
    /// order they were added.
    pub fn add_handler(&mut self, handler: Box<dyn Handler>) {
        self.handlers.push(handler);
    }

    /// Returns true once `RunEnd` has been observed.
    pub fn run_ended(&self) -> bool {
        self.run_ended
    }

    /// The completed test results so far, in completion order.
    pub fn results(&self) -> &[TestResult] {
        &self.results
    }

    /// Takes the completed test results, leaving the processor empty.
    pub fn take_results(&mut self) -> Vec<TestResult> {
        std::mem::take(&mut self.results)
    }

    /// Run-level errors recorded so far.
    pub fn run_errors(&self) -> &[ErrorReport] {
        &self.run_errors
    }

    /// The deadline of the currently open test, if one is open and has a
    /// timeout. Used by the supervisor's stall detector.
    pub fn open_test_deadline(&self) -> Option<Instant> {
        self.open
            .iter()
            .rev()
            .find(|e| e.kind == EntityKind::Test)
            .and_then(|e| e.deadline)
    }

    /// Processes one event, dispatching it through the pipeline.
    ///
    /// Heartbeats are consumed silently: they exist to feed the stall
    /// detector, which observes them upstream of this call.
    pub async fn process(&mut self, event: Event) -> Result<(), ProcessorError> {
        if event.is_heartbeat() {
            return Ok(());
        }

        match event {
            Event::RunStart { num_tests, .. } => {
                if self.run_started {
                    return Err(self.protocol("duplicate run start"));
                }
                self.run_started = true;
                dispatch!(self, run_start(num_tests));
            }
            Event::RunLog { time, text } => {
                dispatch!(self, run_log(time, &text));
            }
            Event::RunError { error, .. } => {
                self.run_errors.push(error.clone());
                dispatch!(self, run_error(&error));
            }
            Event::RunEnd {
                log_dir, out_dir, ..
            } => {
                if !self.open.is_empty() {
                    let names: Vec<_> = self.open.iter().map(|e| e.name.as_str()).collect();
                    return Err(
                        self.protocol(format!("run ended with open entities: {names:?}"))
                    );
                }
                self.run_ended = true;
                dispatch!(self, run_end(&log_dir, &out_dir));
            }
            Event::TestStart { time, test } => {
                let name = test.name.clone();
                let deadline = test.timeout.map(|timeout| Instant::now() + timeout);
                self.start_entity(EntityState {
                    kind: EntityKind::Test,
                    name: name.clone(),
                    log_path: results::test_log_path(&self.cx.results_dir, &name),
                    out_dir: results::test_out_dir(&self.cx.results_dir, &name),
                    test: Some(test),
                    start_time: time,
                    errors: Vec::new(),
                    deadline,
                })
                .await?;
            }
            Event::TestLog { time, name, text } => {
                self.entity_log(&name, time, &text).await?;
            }
            Event::TestError { name, error, .. } => {
                self.entity_error(name, error).await?;
            }
            Event::TestEnd {
                time,
                name,
                skip_reasons,
            } => {
                self.end_entity(EntityKind::Test, &name, time, skip_reasons)
                    .await?;
            }
            Event::FixtureStart { time, fixture } => {
                let name = fixture.name;
                self.start_entity(EntityState {
                    kind: EntityKind::Fixture,
                    log_path: results::test_log_path(&self.cx.results_dir, &name),
                    out_dir: results::test_out_dir(&self.cx.results_dir, &name),
                    name,
                    test: None,
                    start_time: time,
                    errors: Vec::new(),
                    deadline: None,
                })
                .await?;
            }
            Event::FixtureLog { time, name, text } => {
                self.entity_log(&name, time, &text).await?;
            }
            Event::FixtureError { name, error, .. } => {
                self.entity_error(name, error).await?;
            }
            Event::FixtureEnd { time, name } => {
                self.end_entity(EntityKind::Fixture, &name, time, Vec::new())
                    .await?;
            }
            Event::StackOperation { op, .. } => {
                dispatch!(self, stack_operation(&op));
            }
        }
        Ok(())
    }

    /// Synthesizes a terminal error and an end for every in-flight entity,
    /// innermost first, then records a run-level error if the run never
    /// ended.
    ///
    /// `reason` describes what went wrong ("Lost SSH connection", "Test
    /// timed out", ...); `diagnosis` carries extra detail from the pluggable
    /// diagnosis function, if it produced any.
    pub async fn finalize(
        &mut self,
        reason: &str,
        diagnosis: Option<&str>,
    ) -> Result<(), ProcessorError> {
        let message = match diagnosis {
            Some(diagnosis) => format!("{reason}: {diagnosis}"),
            None => reason.to_owned(),
        };

        while let Some(entity) = self.open.last() {
            let name = entity.name.clone();
            let time = Utc::now();
            debug!(name = %name, "synthesizing terminal error for in-flight entity");
            self.entity_error(name.clone(), ErrorReport::new(time, message.clone()))
                .await?;
            let kind = self
                .open
                .last()
                .expect("entity still open after error")
                .kind;
            self.end_entity(kind, &name, time, Vec::new()).await?;
        }

        if self.run_started && !self.run_ended {
            let error = ErrorReport::new(Utc::now(), message);
            self.run_errors.push(error.clone());
            dispatch!(self, run_error(&error));
        }
        Ok(())
    }

    async fn start_entity(&mut self, mut entity: EntityState) -> Result<(), ProcessorError> {
        if self.open.iter().any(|e| e.name == entity.name) {
            return Err(self.protocol(format!(
                "entity `{}` started while already open",
                entity.name
            )));
        }

        // Errors may legitimately precede the start; surface them right
        // after it.
        let pending = self.pending_errors.remove(&entity.name).unwrap_or_default();
        entity.errors.extend(pending.iter().cloned());

        dispatch!(self, entity_start(&entity));
        for error in &pending {
            dispatch!(self, entity_error(&entity, error));
        }
        self.open.push(entity);
        Ok(())
    }

    async fn entity_log(
        &mut self,
        name: &str,
        time: DateTime<Utc>,
        text: &str,
    ) -> Result<(), ProcessorError> {
        let Some(index) = self.open.iter().position(|e| e.name == name) else {
            // Logs for entities not currently open (e.g. fixture chatter
            // between invocations) fall through to the run log.
            let text = format!("[{name}] {text}");
            dispatch!(self, run_log(time, &text));
            return Ok(());
        };
        let entity = self.open[index].clone();
        dispatch!(self, entity_log(&entity, time, text));
        Ok(())
    }

    async fn entity_error(
        &mut self,
        name: String,
        error: ErrorReport,
    ) -> Result<(), ProcessorError> {
        if let Some(index) = self.open.iter().position(|e| e.name == name) {
            self.open[index].errors.push(error.clone());
            let entity = self.open[index].clone();
            dispatch!(self, entity_error(&entity, &error));
        } else if self.ended.contains(&name) {
            // An error arriving after the entity's end attaches at run
            // level; the entity's record is already sealed.
            let mut error = error;
            error.reason = format!("late error from `{name}`: {}", error.reason);
            self.run_errors.push(error.clone());
            dispatch!(self, run_error(&error));
        } else {
            self.pending_errors.entry(name).or_default().push(error);
        }
        Ok(())
    }

    async fn end_entity(
        &mut self,
        kind: EntityKind,
        name: &str,
        time: DateTime<Utc>,
        skip_reasons: Vec<String>,
    ) -> Result<(), ProcessorError> {
        let Some(index) = self.open.iter().position(|e| e.name == name) else {
            return Err(self.protocol(format!("end for unopened entity `{name}`")));
        };
        let entity = self.open.remove(index);
        if entity.kind != kind {
            return Err(self.protocol(format!(
                "entity `{name}` started as {:?} but ended as {kind:?}",
                entity.kind
            )));
        }

        let result = entity.test.clone().map(|test| TestResult {
            test,
            start_time: entity.start_time,
            end_time: time,
            errors: entity.errors.clone(),
            skip_reason: if skip_reasons.is_empty() {
                None
            } else {
                Some(skip_reasons.join("; "))
            },
            out_dir: entity.out_dir.clone(),
            log_path: entity.log_path.clone(),
        });

        dispatch!(self, entity_end(&entity, result.as_ref()));

        self.ended.insert(entity.name);
        if let Some(result) = result {
            self.results.push(result);
        }
        Ok(())
    }

    fn protocol(&self, message: impl Into<String>) -> ProcessorError {
        ProcessorError::Protocol {
            message: message.into(),
        }
    }

    /// Records a handler failure as a run-level error without re-dispatching
    /// it (which could recurse).
    fn record_handler_error(&mut self, error: HandlerError) {
        self.cx
            .logger
            .info(format!("Result handler failed: {error}"));
        self.run_errors
            .push(ErrorReport::new(Utc::now(), error.to_string()));
    }

    /// Recovers a handler panic: it becomes an error on the innermost open
    /// test (or a run-level error when none is open) and never unwinds past
    /// the processor.
    fn record_handler_panic(&mut self, message: String) {
        self.cx
            .logger
            .info(format!("Result handler panicked: {message}"));
        let error = ErrorReport::new(Utc::now(), format!("panic: {message}"));
        match self
            .open
            .iter_mut()
            .rev()
            .find(|e| e.kind == EntityKind::Test)
        {
            Some(entity) => entity.errors.push(error),
            None => self.run_errors.push(error),
        }
    }
}

impl std::fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProcessor")
            .field("handlers", &self.handlers.len())
            .field(
                "open",
                &self.open.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            )
            .field("results", &self.results.len())
            .field("run_started", &self.run_started)
            .field("run_ended", &self.run_ended)
            .finish()
    }
}
