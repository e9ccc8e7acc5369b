// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The stack-operation handler: fixture operations on behalf of bundles.
//!
//! An intermediate bundle cannot run host-side fixtures itself; it emits
//! stack-operation events and this handler applies them to the host's
//! fixture stack. The stack is behind a mutex only because the handler and
//! the run thread touch it at different times; operations never overlap.

use crate::{
    errors::HandlerError,
    events::StackOperation,
    fixture::{FixtureRegistry, FixtureStack},
    processor::{EntityKind, EntityState, Handler, HandlerContext},
    results::TestResult,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Applies push/pop/reset requests from the event stream to the host-side
/// fixture stack, and brackets each test with the stack's pre/post-test
/// callbacks.
pub struct StackOperationHandler {
    registry: FixtureRegistry,
    stack: Arc<Mutex<FixtureStack>>,
}

impl StackOperationHandler {
    /// Creates a handler operating on `stack`, resolving fixture names
    /// through `registry`.
    pub fn new(registry: FixtureRegistry, stack: Arc<Mutex<FixtureStack>>) -> Self {
        Self { registry, stack }
    }
}

#[async_trait]
impl Handler for StackOperationHandler {
    async fn entity_start(
        &mut self,
        _cx: &HandlerContext,
        entity: &EntityState,
    ) -> Result<(), HandlerError> {
        if entity.kind != EntityKind::Test {
            return Ok(());
        }
        let mut stack = self.stack.lock().await;
        if stack.is_empty() {
            return Ok(());
        }
        stack.pre_test(entity.deadline).await?;
        Ok(())
    }

    async fn entity_end(
        &mut self,
        _cx: &HandlerContext,
        entity: &EntityState,
        result: Option<&TestResult>,
    ) -> Result<(), HandlerError> {
        if result.is_none() {
            return Ok(());
        }
        let mut stack = self.stack.lock().await;
        if stack.is_empty() {
            return Ok(());
        }
        stack.post_test(entity.deadline).await?;
        Ok(())
    }

    async fn stack_operation(
        &mut self,
        _cx: &HandlerContext,
        op: &StackOperation,
    ) -> Result<(), HandlerError> {
        let mut stack = self.stack.lock().await;
        match op {
            StackOperation::Push { name } => {
                let fixture = self
                    .registry
                    .get(name)
                    .ok_or_else(|| HandlerError::new(format!("unknown fixture `{name}`")))?
                    .clone();
                stack.push(fixture).await;
            }
            StackOperation::Pop => {
                stack.pop().await;
            }
            StackOperation::Reset => {
                stack.reset().await;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for StackOperationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackOperationHandler")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::{Event, EventSink},
        fixture::{test_support::ScriptedFixture, StackStatus},
        logging::Logger,
        processor::EventProcessor,
    };
    use chrono::Utc;

    #[tokio::test]
    async fn push_and_pop_flow_through_to_the_stack() {
        let sink: EventSink = Arc::new(|_event| {});
        let stack = Arc::new(Mutex::new(FixtureStack::new(Logger::none(), sink)));
        let mut registry = FixtureRegistry::new();
        registry.register(Arc::new(ScriptedFixture::named("chrome")));

        let mut processor = EventProcessor::new("results".into(), Logger::none());
        processor.add_handler(Box::new(StackOperationHandler::new(
            registry,
            stack.clone(),
        )));

        let t = Utc::now();
        processor
            .process(Event::StackOperation {
                time: t,
                op: StackOperation::Push {
                    name: "chrome".into(),
                },
            })
            .await
            .unwrap();
        {
            let stack = stack.lock().await;
            assert_eq!(stack.len(), 1);
            assert_eq!(stack.status(), StackStatus::Green);
        }

        processor
            .process(Event::StackOperation {
                time: t,
                op: StackOperation::Pop,
            })
            .await
            .unwrap();
        assert!(stack.lock().await.is_empty());
    }
}
