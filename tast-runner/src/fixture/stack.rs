// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The fixture stack: the setup/teardown pyramid around tests.

use crate::{
    errors::FixtureFailure,
    events::{ErrorReport, Event, EventSink, FixtureMetadata},
    fixture::{Fixture, FixtureContext, FixtureValue},
    logging::{FnSink, Logger},
};
use chrono::Utc;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

/// The scalar health of a fixture stack: the least green across entries.
///
/// Green means every entry is set up and reset-healthy. Yellow means at
/// least one entry's reset failed since the last rebuild; the stack still
/// serves values and can back a test, but should be torn down and rebuilt
/// before the next one. Red means at least one entry's set-up failed.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum StackStatus {
    /// Every entry set up and healthy.
    Green,
    /// At least one reset failure; rebuild before the next test.
    Yellow,
    /// At least one set-up failure; tests under this stack cannot run.
    Red,
}

struct StackEntry {
    fixture: Arc<dyn Fixture>,
    status: StackStatus,
    value: Option<FixtureValue>,
    set_up: bool,
}

/// The active fixture instantiation for the test about to run.
///
/// Single-threaded: all operations serialize on the run thread. Each
/// operation emits structured entity events through the sink so fixture
/// lifecycles appear in the result stream exactly like test lifecycles.
pub struct FixtureStack {
    entries: Vec<StackEntry>,
    sink: EventSink,
    logger: Logger,
    run_deadline: Option<Instant>,
}

impl FixtureStack {
    /// Creates an empty stack emitting events into `sink`.
    pub fn new(logger: Logger, sink: EventSink) -> Self {
        Self {
            entries: Vec::new(),
            sink,
            logger,
            run_deadline: None,
        }
    }

    /// Bounds every callback by the run's overall deadline.
    pub fn with_run_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.run_deadline = deadline;
        self
    }

    /// The number of entries on the stack.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the stack has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The scalar status: the maximum across entries.
    pub fn status(&self) -> StackStatus {
        self.entries
            .iter()
            .map(|e| e.status)
            .max()
            .unwrap_or(StackStatus::Green)
    }

    /// The name of the first red entry, if any.
    pub fn red_fixture_name(&self) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.status == StackStatus::Red)
            .map(|e| e.fixture.name())
    }

    /// The top entry's value. A yellow stack still serves values.
    pub fn val(&self) -> Option<&FixtureValue> {
        self.entries.last().and_then(|e| e.value.as_ref())
    }

    /// Pushes `fixture`, running its set-up unless the stack is already red.
    ///
    /// Once any entry is red, later pushes are recorded but not executed:
    /// they enter red immediately without their set-up running.
    pub async fn push(&mut self, fixture: Arc<dyn Fixture>) -> StackStatus {
        self.emit(Event::FixtureStart {
            time: Utc::now(),
            fixture: FixtureMetadata {
                name: fixture.name().to_owned(),
            },
        });

        if self.status() == StackStatus::Red {
            debug!(fixture = fixture.name(), "stack is red; recording without set-up");
            self.entries.push(StackEntry {
                fixture,
                status: StackStatus::Red,
                value: None,
                set_up: false,
            });
            return self.status();
        }

        let cx = self.context(&fixture, None);
        let name = fixture.name().to_owned();
        let entry = match self.call(&name, fixture.set_up(&cx), cx.deadline, "set up").await {
            Ok(value) => StackEntry {
                fixture,
                status: StackStatus::Green,
                value: Some(value),
                set_up: true,
            },
            Err(failure) => {
                self.emit_error(&name, &failure);
                StackEntry {
                    fixture,
                    status: StackStatus::Red,
                    value: None,
                    set_up: true,
                }
            }
        };
        self.entries.push(entry);
        self.status()
    }

    /// Pops the top entry, tearing it down if its set-up actually ran.
    ///
    /// Popping the highest red entry clears red (the scalar is recomputed
    /// over the remaining entries).
    pub async fn pop(&mut self) -> StackStatus {
        let Some(entry) = self.entries.pop() else {
            return StackStatus::Green;
        };

        let name = entry.fixture.name().to_owned();
        if entry.set_up && entry.status != StackStatus::Red {
            let cx = self.context(&entry.fixture, None);
            if let Err(failure) = self
                .call(&name, entry.fixture.tear_down(&cx), cx.deadline, "tear down")
                .await
            {
                self.emit_error(&name, &failure);
            }
        }

        self.emit(Event::FixtureEnd {
            time: Utc::now(),
            name,
        });
        self.status()
    }

    /// Resets every entry in stack order.
    ///
    /// A reset failure marks that entry yellow; the stack stays usable but
    /// the scheduler should rebuild it before the next test.
    pub async fn reset(&mut self) -> StackStatus {
        for index in 0..self.entries.len() {
            if !self.entries[index].set_up || self.entries[index].status == StackStatus::Red {
                continue;
            }
            let fixture = self.entries[index].fixture.clone();
            let cx = self.context(&fixture, None);
            let name = fixture.name().to_owned();
            if let Err(failure) = self
                .call(&name, fixture.reset(&cx), cx.deadline, "reset")
                .await
            {
                self.logger
                    .info(format!("Fixture failed to reset: {failure}; recovering"));
                self.entries[index].status = StackStatus::Yellow;
            }
        }
        self.status()
    }

    /// Runs every entry's pre-test callback, bottom up.
    pub async fn pre_test(&mut self, test_deadline: Option<Instant>) -> Result<(), FixtureFailure> {
        for index in 0..self.entries.len() {
            if !self.entries[index].set_up || self.entries[index].status == StackStatus::Red {
                continue;
            }
            let fixture = self.entries[index].fixture.clone();
            let cx = self.context(&fixture, test_deadline);
            let name = fixture.name().to_owned();
            self.call(&name, fixture.pre_test(&cx), cx.deadline, "run pre-test")
                .await?;
        }
        Ok(())
    }

    /// Runs every entry's post-test callback, top down. All callbacks run
    /// even if an earlier one fails; the first failure is returned.
    pub async fn post_test(&mut self, test_deadline: Option<Instant>) -> Result<(), FixtureFailure> {
        let mut first_failure = None;
        for index in (0..self.entries.len()).rev() {
            if !self.entries[index].set_up || self.entries[index].status == StackStatus::Red {
                continue;
            }
            let fixture = self.entries[index].fixture.clone();
            let cx = self.context(&fixture, test_deadline);
            let name = fixture.name().to_owned();
            if let Err(failure) = self
                .call(&name, fixture.post_test(&cx), cx.deadline, "run post-test")
                .await
            {
                self.emit_error(&name, &failure);
                first_failure.get_or_insert(failure);
            }
        }
        match first_failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    fn context(&self, fixture: &Arc<dyn Fixture>, test_deadline: Option<Instant>) -> FixtureContext {
        let mut deadline = Instant::now() + fixture.timeout();
        if let Some(run_deadline) = self.run_deadline {
            deadline = deadline.min(run_deadline);
        }
        if let Some(test_deadline) = test_deadline {
            deadline = deadline.min(test_deadline);
        }

        let sink = self.sink.clone();
        let name = fixture.name().to_owned();
        let logger = self.logger.attach(FnSink::new(move |_level, time, message| {
            sink(Event::FixtureLog {
                time,
                name: name.clone(),
                text: message.to_owned(),
            });
        }));

        FixtureContext {
            logger,
            deadline: Some(deadline),
            parent_value: self.val().cloned(),
        }
    }

    async fn call<T>(
        &self,
        name: &str,
        fut: impl Future<Output = Result<T, FixtureFailure>>,
        deadline: Option<Instant>,
        phase: &str,
    ) -> Result<T, FixtureFailure> {
        match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, fut).await {
                Ok(result) => result,
                Err(_) => Err(FixtureFailure::new(format!(
                    "fixture `{name}` did not {phase} in time"
                ))),
            },
            None => fut.await,
        }
    }

    fn emit(&self, event: Event) {
        (self.sink)(event);
    }

    fn emit_error(&self, name: &str, failure: &FixtureFailure) {
        self.emit(Event::FixtureError {
            time: Utc::now(),
            name: name.to_owned(),
            error: ErrorReport::new(Utc::now(), failure.to_string()),
        });
    }
}

impl std::fmt::Debug for FixtureStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixtureStack")
            .field(
                "entries",
                &self
                    .entries
                    .iter()
                    .map(|e| (e.fixture.name(), e.status))
                    .collect::<Vec<_>>(),
            )
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::test_support::ScriptedFixture;
    use crate::logging::CaptureSink;
    use pretty_assertions::assert_eq;
    use std::sync::{Mutex, atomic::Ordering};

    fn collecting_sink() -> (EventSink, Arc<Mutex<Vec<Event>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let captured = events.clone();
        let sink: EventSink = Arc::new(move |event| {
            captured.lock().unwrap().push(event);
        });
        (sink, events)
    }

    fn fixture_names(events: &[Event]) -> Vec<(String, &'static str)> {
        events
            .iter()
            .filter_map(|event| match event {
                Event::FixtureStart { fixture, .. } => Some((fixture.name.clone(), "start")),
                Event::FixtureError { name, .. } => Some((name.clone(), "error")),
                Event::FixtureEnd { name, .. } => Some((name.clone(), "end")),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn push_pop_green_round_trip() {
        let (sink, events) = collecting_sink();
        let mut stack = FixtureStack::new(Logger::none(), sink);

        let f1 = Arc::new(ScriptedFixture::named("f1"));
        assert_eq!(stack.push(f1.clone()).await, StackStatus::Green);
        assert_eq!(stack.val(), Some(&FixtureValue::String("f1-value".into())));

        assert_eq!(stack.pop().await, StackStatus::Green);
        assert!(stack.is_empty());
        assert_eq!(f1.tear_down_calls.load(Ordering::SeqCst), 1);

        assert_eq!(
            fixture_names(&events.lock().unwrap()),
            [("f1".to_string(), "start"), ("f1".to_string(), "end")]
        );
    }

    #[tokio::test]
    async fn set_up_failure_reddens_and_short_circuits() {
        let (sink, events) = collecting_sink();
        let mut stack = FixtureStack::new(Logger::none(), sink);

        let f1 = Arc::new(ScriptedFixture::named("f1"));
        let f2 = Arc::new(ScriptedFixture::named("f2").failing_set_up());
        let f3 = Arc::new(ScriptedFixture::named("f3"));

        assert_eq!(stack.push(f1.clone()).await, StackStatus::Green);
        assert_eq!(stack.push(f2.clone()).await, StackStatus::Red);
        assert_eq!(stack.push(f3.clone()).await, StackStatus::Red);
        assert_eq!(stack.red_fixture_name(), Some("f2"));
        // f3's set-up is recorded but never executed.
        assert_eq!(f3.set_up_calls.load(Ordering::SeqCst), 0);

        // Pops tear down in reverse order and clear red once the highest red
        // entry is gone.
        assert_eq!(stack.pop().await, StackStatus::Red);
        assert_eq!(stack.pop().await, StackStatus::Green);
        assert_eq!(stack.pop().await, StackStatus::Green);
        // Only f1 was actually set up, so only f1 is torn down.
        assert_eq!(f1.tear_down_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f2.tear_down_calls.load(Ordering::SeqCst), 0);
        assert_eq!(f3.tear_down_calls.load(Ordering::SeqCst), 0);

        assert_eq!(
            fixture_names(&events.lock().unwrap()),
            [
                ("f1".to_string(), "start"),
                ("f2".to_string(), "start"),
                ("f2".to_string(), "error"),
                ("f3".to_string(), "start"),
                ("f3".to_string(), "end"),
                ("f2".to_string(), "end"),
                ("f1".to_string(), "end"),
            ]
        );
    }

    #[tokio::test]
    async fn reset_failure_yellows_but_still_serves_values() {
        let (sink, _events) = collecting_sink();
        let capture = CaptureSink::new();
        let mut stack = FixtureStack::new(Logger::new(capture.clone()), sink);

        let f1 = Arc::new(ScriptedFixture::named("f1").failing_reset());
        let f2 = Arc::new(ScriptedFixture::named("f2"));
        stack.push(f1.clone()).await;
        stack.push(f2.clone()).await;

        assert_eq!(stack.reset().await, StackStatus::Yellow);
        assert!(
            capture
                .messages()
                .iter()
                .any(|m| m == "Fixture failed to reset: failure; recovering"),
            "got {:?}",
            capture.messages()
        );
        // Both resets ran despite the first failing.
        assert_eq!(f2.reset_calls.load(Ordering::SeqCst), 1);
        // A yellow stack still serves the top value.
        assert_eq!(stack.val(), Some(&FixtureValue::String("f2-value".into())));
    }

    #[tokio::test]
    async fn red_stack_serves_no_value_and_skips_pre_test() {
        let (sink, _events) = collecting_sink();
        let mut stack = FixtureStack::new(Logger::none(), sink);

        let f1 = Arc::new(ScriptedFixture::named("f1").failing_set_up());
        stack.push(f1).await;
        assert_eq!(stack.val(), None);
        // Pre-test on a red entry is skipped rather than run against a
        // half-set-up fixture.
        stack.pre_test(None).await.unwrap();
    }
}
