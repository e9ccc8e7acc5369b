// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixtures and the fixture stack.
//!
//! A fixture is a named, reusable setup routine bracketing one or more
//! tests. Fixtures form a DAG by naming their parents; the active
//! instantiation at any moment is a single stack, the spine from the root to
//! the current leaf. Fixtures are stored in a name-keyed registry and the
//! spine is linearized per run, so no parent pointers (and no ownership
//! cycles) exist.

mod stack;

pub use stack::*;

use crate::{errors::FixtureFailure, logging::Logger};
use async_trait::async_trait;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::time::Instant;

/// The opaque value a fixture exposes to its children and tests.
pub type FixtureValue = serde_json::Value;

/// Context passed to every fixture callback.
#[derive(Clone, Debug)]
pub struct FixtureContext {
    /// Scoped logger; writes reach the fixture's entity log and the run
    /// console.
    pub logger: Logger,

    /// The callback's effective deadline: the smallest of the run deadline,
    /// the fixture timeout, and (for pre/post callbacks) the enclosing
    /// test's deadline.
    pub deadline: Option<Instant>,

    /// The parent fixture's value, if any.
    pub parent_value: Option<FixtureValue>,
}

/// A named reusable setup routine.
#[async_trait]
pub trait Fixture: Send + Sync + std::fmt::Debug {
    /// The fixture's unique name.
    fn name(&self) -> &str;

    /// The name of this fixture's parent, if any.
    fn parent(&self) -> Option<&str> {
        None
    }

    /// The per-callback timeout.
    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Prepares the fixture and returns its value. Called once when the
    /// fixture is pushed.
    async fn set_up(&self, cx: &FixtureContext) -> Result<FixtureValue, FixtureFailure>;

    /// Restores the fixture to a pristine state between tests. An error
    /// marks the stack yellow: still usable, but rebuilt before the next
    /// test.
    async fn reset(&self, _cx: &FixtureContext) -> Result<(), FixtureFailure> {
        Ok(())
    }

    /// Runs immediately before each test.
    async fn pre_test(&self, _cx: &FixtureContext) -> Result<(), FixtureFailure> {
        Ok(())
    }

    /// Runs immediately after each test.
    async fn post_test(&self, _cx: &FixtureContext) -> Result<(), FixtureFailure> {
        Ok(())
    }

    /// Releases the fixture's resources. Called when the fixture is popped,
    /// but only if `set_up` actually ran.
    async fn tear_down(&self, _cx: &FixtureContext) -> Result<(), FixtureFailure> {
        Ok(())
    }
}

/// A name-keyed store of fixtures.
#[derive(Clone, Default)]
pub struct FixtureRegistry {
    fixtures: BTreeMap<String, Arc<dyn Fixture>>,
}

impl FixtureRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a fixture. A later registration under the same name replaces the
    /// earlier one.
    pub fn register(&mut self, fixture: Arc<dyn Fixture>) {
        self.fixtures.insert(fixture.name().to_owned(), fixture);
    }

    /// Looks up a fixture by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Fixture>> {
        self.fixtures.get(name)
    }

    /// Computes the spine from the root ancestor down to `leaf`, in push
    /// order.
    ///
    /// Fails on an unknown name or a parent cycle.
    pub fn spine(&self, leaf: &str) -> Result<Vec<Arc<dyn Fixture>>, FixtureFailure> {
        let mut spine = Vec::new();
        let mut current = Some(leaf.to_owned());
        while let Some(name) = current {
            let fixture = self
                .get(&name)
                .ok_or_else(|| FixtureFailure::new(format!("unknown fixture `{name}`")))?;
            if spine.iter().any(|f: &Arc<dyn Fixture>| f.name() == name) {
                return Err(FixtureFailure::new(format!(
                    "fixture parent cycle through `{name}`"
                )));
            }
            spine.push(fixture.clone());
            current = fixture.parent().map(str::to_owned);
        }
        spine.reverse();
        Ok(spine)
    }
}

impl std::fmt::Debug for FixtureRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixtureRegistry")
            .field("fixtures", &self.fixtures.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_support::ScriptedFixture;

    #[test]
    fn spine_linearizes_from_root() {
        let mut registry = FixtureRegistry::new();
        registry.register(Arc::new(ScriptedFixture::named("root")));
        registry.register(Arc::new(ScriptedFixture::named("mid").with_parent("root")));
        registry.register(Arc::new(ScriptedFixture::named("leaf").with_parent("mid")));

        let spine = registry.spine("leaf").unwrap();
        let names: Vec<_> = spine.iter().map(|f| f.name().to_owned()).collect();
        assert_eq!(names, ["root", "mid", "leaf"]);
    }

    #[test]
    fn spine_detects_cycles() {
        let mut registry = FixtureRegistry::new();
        registry.register(Arc::new(ScriptedFixture::named("a").with_parent("b")));
        registry.register(Arc::new(ScriptedFixture::named("b").with_parent("a")));
        let err = registry.spine("a").unwrap_err();
        assert!(err.to_string().contains("cycle"), "got {err}");
    }

    #[test]
    fn spine_rejects_unknown_names() {
        let registry = FixtureRegistry::new();
        assert!(registry.spine("nope").is_err());
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A fixture whose behavior is scripted per callback, for stack tests.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedFixture {
        name: String,
        parent: Option<String>,
        pub(crate) fail_set_up: bool,
        pub(crate) fail_reset: bool,
        pub(crate) set_up_calls: AtomicUsize,
        pub(crate) reset_calls: AtomicUsize,
        pub(crate) tear_down_calls: AtomicUsize,
    }

    impl ScriptedFixture {
        pub(crate) fn named(name: &str) -> Self {
            Self {
                name: name.to_owned(),
                ..Self::default()
            }
        }

        pub(crate) fn with_parent(mut self, parent: &str) -> Self {
            self.parent = Some(parent.to_owned());
            self
        }

        pub(crate) fn failing_set_up(mut self) -> Self {
            self.fail_set_up = true;
            self
        }

        pub(crate) fn failing_reset(mut self) -> Self {
            self.fail_reset = true;
            self
        }
    }

    #[async_trait]
    impl Fixture for ScriptedFixture {
        fn name(&self) -> &str {
            &self.name
        }

        fn parent(&self) -> Option<&str> {
            self.parent.as_deref()
        }

        async fn set_up(&self, _cx: &FixtureContext) -> Result<FixtureValue, FixtureFailure> {
            self.set_up_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_set_up {
                Err(FixtureFailure::new("failure"))
            } else {
                Ok(FixtureValue::String(format!("{}-value", self.name)))
            }
        }

        async fn reset(&self, _cx: &FixtureContext) -> Result<(), FixtureFailure> {
            self.reset_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_reset {
                Err(FixtureFailure::new("failure"))
            } else {
                Ok(())
            }
        }

        async fn tear_down(&self, _cx: &FixtureContext) -> Result<(), FixtureFailure> {
            self.tear_down_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
