// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The RPC-results handler: forwards completed tests upstream.

use crate::{
    errors::{HandlerError, ReportsError},
    processor::{EntityState, Handler, HandlerContext},
    results::TestResult,
    retry::MaxFailTracker,
};
use async_trait::async_trait;
use std::sync::Arc;

/// A destination for completed test results.
///
/// The production implementation bridges to the upstream progress sink over
/// gRPC; tests substitute an in-memory recorder.
#[async_trait]
pub trait ResultReporter: Send {
    /// Reports one completed test. Returns true if the upstream service
    /// wants the run terminated.
    async fn report(&mut self, result: &TestResult) -> Result<bool, ReportsError>;
}

/// Forwards each completed test to a [`ResultReporter`] and trips the shared
/// failure tracker when the upstream asks for termination.
pub struct RpcResultsHandler {
    reporter: Box<dyn ResultReporter>,
    tracker: Arc<MaxFailTracker>,
}

impl RpcResultsHandler {
    /// Creates a handler forwarding to `reporter`.
    pub fn new(reporter: Box<dyn ResultReporter>, tracker: Arc<MaxFailTracker>) -> Self {
        Self { reporter, tracker }
    }
}

#[async_trait]
impl Handler for RpcResultsHandler {
    async fn entity_end(
        &mut self,
        cx: &HandlerContext,
        _entity: &EntityState,
        result: Option<&TestResult>,
    ) -> Result<(), HandlerError> {
        let Some(result) = result else {
            return Ok(());
        };
        let terminate = self.reporter.report(result).await?;
        if terminate {
            cx.logger
                .info("Upstream progress sink requested termination");
            self.tracker.trip();
        }
        Ok(())
    }
}

impl std::fmt::Debug for RpcResultsHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcResultsHandler").finish_non_exhaustive()
    }
}
