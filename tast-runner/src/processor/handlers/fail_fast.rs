// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The fail-fast handler: failure accounting for early abort.

use crate::{
    errors::HandlerError,
    processor::{EntityState, Handler, HandlerContext},
    results::TestResult,
    retry::MaxFailTracker,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Counts failed tests into the shared [`MaxFailTracker`].
///
/// The handler only counts; the processor's caller observes the tracker
/// between events and stops the run once it trips.
#[derive(Debug)]
pub struct FailFastHandler {
    tracker: Arc<MaxFailTracker>,
}

impl FailFastHandler {
    /// Creates a handler feeding the given tracker.
    pub fn new(tracker: Arc<MaxFailTracker>) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl Handler for FailFastHandler {
    async fn entity_end(
        &mut self,
        _cx: &HandlerContext,
        _entity: &EntityState,
        result: Option<&TestResult>,
    ) -> Result<(), HandlerError> {
        if let Some(result) = result {
            if result.failed() {
                let failures = self.tracker.record_failure();
                debug!(
                    test = %result.test.name,
                    failures,
                    threshold = self.tracker.threshold(),
                    "test failed"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::{ErrorReport, Event, TestMetadata},
        logging::Logger,
        processor::EventProcessor,
    };
    use chrono::Utc;

    #[tokio::test]
    async fn failures_count_toward_the_threshold() {
        let tracker = Arc::new(MaxFailTracker::new(1));
        let mut processor = EventProcessor::new("results".into(), Logger::none());
        processor.add_handler(Box::new(FailFastHandler::new(tracker.clone())));

        let t = Utc::now();
        processor
            .process(Event::TestStart {
                time: t,
                test: TestMetadata::named("a.A"),
            })
            .await
            .unwrap();
        processor
            .process(Event::TestError {
                time: t,
                name: "a.A".into(),
                error: ErrorReport::new(t, "boom"),
            })
            .await
            .unwrap();
        assert!(!tracker.exceeded(), "counted only on end");
        processor
            .process(Event::TestEnd {
                time: t,
                name: "a.A".into(),
                skip_reasons: vec![],
            })
            .await
            .unwrap();
        assert!(tracker.exceeded());
    }
}
