// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The driver: end-to-end orchestration of one run.
//!
//! The driver wires the components together in the order the data flows:
//! connection cache, port forwards, reports server, then the retry
//! coordinator driving bundle invocations whose events feed the handler
//! pipeline. The fixture stack is shared with the stack-operation handler
//! and reset (or rebuilt, when yellow) between invocations.

use crate::{
    bundle::{self, BundleCommand, BundleStopCause},
    cancel::Cancelled,
    config::{BundleRunConfig, RunConfig, SshConfig},
    errors::{BundleError, RunFailure},
    events::{Event, EventSink, TestMetadata},
    fixture::{FixtureRegistry, FixtureStack, StackStatus},
    logging::Logger,
    processor::{
        handlers::{
            CopyOutputHandler, FailFastHandler, LoggingHandler, RpcResultsHandler,
            SshOutputPuller, StackOperationHandler, StreamedResultsHandler, TimingHandler,
        },
        EventProcessor,
    },
    reports::{connect_progress_sink, ReportsServer},
    results::{self, RunSummary, RunUuid, TestResult},
    retry::{self, MaxFailTracker, OnceOutcome, OnceRunner},
    target::{ConnectionCache, ForwardKind, ForwardSet, SshRebootHelper, TargetEndpoint},
};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Everything a finished run reports back to the caller.
#[derive(Debug)]
pub struct RunReport {
    /// The run's unique identifier.
    pub run_id: RunUuid,

    /// Final per-test results, in requested order.
    pub results: Vec<TestResult>,

    /// Aggregate statistics.
    pub summary: RunSummary,

    /// How long the run took.
    pub elapsed: std::time::Duration,

    /// The fatal reason, if the run ended early.
    pub fatal: Option<RunFailure>,
}

impl RunReport {
    /// Returns true if the run should exit with a failure code.
    pub fn has_failures(&self) -> bool {
        self.summary.has_failures() || self.fatal.is_some()
    }
}

/// Host-side driver for a suite of tests against one target.
pub struct TestDriver {
    run_config: RunConfig,
    cache: ConnectionCache,
    bundle_path: String,
    tracker: Arc<MaxFailTracker>,
    registry: FixtureRegistry,
    logger: Logger,
}

impl TestDriver {
    /// Creates a driver for `endpoint`. The target is not contacted until
    /// [`run`](Self::run).
    pub fn new(
        endpoint: TargetEndpoint,
        run_config: RunConfig,
        ssh_config: SshConfig,
        bundle_path: impl Into<String>,
        registry: FixtureRegistry,
        logger: Logger,
    ) -> Self {
        let reboot_helper = Box::new(SshRebootHelper::new(endpoint.clone(), ssh_config.clone()));
        let tracker = Arc::new(MaxFailTracker::new(run_config.max_failures));
        let cache = ConnectionCache::new(
            endpoint,
            ssh_config,
            Some(reboot_helper),
            logger.clone(),
        );
        Self {
            run_config,
            cache,
            bundle_path: bundle_path.into(),
            tracker,
            registry,
            logger,
        }
    }

    /// The shared failure tracker, for callers that want to observe or trip
    /// fail-fast externally.
    pub fn tracker(&self) -> Arc<MaxFailTracker> {
        self.tracker.clone()
    }

    /// Runs `tests` to completion and writes the consolidated results.
    pub async fn run(
        &mut self,
        tests: Vec<TestMetadata>,
        cancelled: Cancelled,
    ) -> Result<RunReport, RunFailure> {
        let run_id = RunUuid::new_v4();
        let stopwatch = crate::time::stopwatch();
        self.logger.info(format!(
            "Starting run {run_id} against {}",
            self.cache.connection_spec()
        ));

        let results_dir = self.run_config.results_dir.clone();
        std::fs::create_dir_all(&results_dir).map_err(|error| {
            RunFailure::Processor(crate::errors::ProcessorError::WriteResults {
                path: results_dir.clone(),
                error,
            })
        })?;

        // The reports server runs for the whole run so missing-report
        // synthesis covers tests that never got a bundle invocation.
        let reports = match &self.run_config.progress_sink_addr {
            Some(addr) => {
                let sink = connect_progress_sink(addr)
                    .await
                    .map_err(RunFailure::Reports)?;
                Some(
                    ReportsServer::start(
                        self.run_config.request_names.clone(),
                        sink,
                        self.tracker.clone(),
                    )
                    .await
                    .map_err(RunFailure::Reports)?,
                )
            }
            None => None,
        };

        // Stack events synthesized by host-side fixture work are injected
        // into the per-invocation processor through this channel.
        let (stack_event_tx, stack_event_rx) = mpsc::unbounded_channel::<Event>();
        let sink: EventSink = Arc::new(move |event| {
            let _ = stack_event_tx.send(event);
        });
        let stack = Arc::new(Mutex::new(FixtureStack::new(self.logger.clone(), sink)));

        let requested: Vec<String> = tests.iter().map(|t| t.name.clone()).collect();

        let mut once = DriverOnce {
            cache: &mut self.cache,
            run_config: &self.run_config,
            bundle_path: &self.bundle_path,
            tracker: &self.tracker,
            registry: &self.registry,
            reports: reports.as_ref(),
            stack: &stack,
            stack_events: stack_event_rx,
            logger: &self.logger,
            cancelled,
        };

        let outcome =
            retry::run_tests_with_retries(&tests, self.run_config.retries, &self.tracker, &mut once)
                .await?;

        // Tear down whatever fixtures are still standing.
        {
            let mut stack = stack.lock().await;
            while !stack.is_empty() {
                stack.pop().await;
            }
        }

        // Snapshot the DUT's system logs once, best-effort.
        if let Some(session) = self.cache.current() {
            let system_logs = results_dir.join(results::SYSTEM_LOGS_DIR);
            if let Err(error) = session.copy_tree_from("/var/log", &system_logs).await {
                warn!(%error, "failed to copy system logs");
            }
        }

        if let Some(reports) = &reports {
            match reports.send_missing_reports().await {
                Ok(count) if count > 0 => {
                    self.logger
                        .info(format!("Reported {count} tests that were not run"));
                }
                Ok(_) => {}
                Err(error) => warn!(%error, "failed to send missing reports"),
            }
        }
        if let Some(reports) = reports {
            if let Err(error) = reports.shutdown().await {
                debug!(%error, "reports server shutdown failed");
            }
        }

        results::write_results_json(&results_dir, &outcome.results)
            .map_err(RunFailure::Processor)?;
        self.cache.close().await;

        let summary = RunSummary::compute(&requested, &outcome.results, outcome.retried);
        let elapsed = stopwatch.snapshot().elapsed;
        self.logger.info(format!(
            "Run {run_id} finished in {}",
            humantime::format_duration(elapsed)
        ));
        Ok(RunReport {
            run_id,
            results: outcome.results,
            summary,
            elapsed,
            fatal: outcome.fatal,
        })
    }
}

/// One bundle invocation, with everything it borrows from the driver.
struct DriverOnce<'a> {
    cache: &'a mut ConnectionCache,
    run_config: &'a RunConfig,
    bundle_path: &'a str,
    tracker: &'a Arc<MaxFailTracker>,
    registry: &'a FixtureRegistry,
    reports: Option<&'a ReportsServer>,
    stack: &'a Arc<Mutex<FixtureStack>>,
    stack_events: mpsc::UnboundedReceiver<Event>,
    logger: &'a Logger,
    cancelled: Cancelled,
}

#[async_trait::async_trait]
impl OnceRunner for DriverOnce<'_> {
    async fn run_once(&mut self, tests: Vec<TestMetadata>) -> OnceOutcome {
        let mut processor = EventProcessor::new(
            self.run_config.results_dir.clone(),
            self.logger.clone(),
        );

        let error = match self.drive(tests, &mut processor).await {
            Ok(()) => None,
            Err(error) => Some(error),
        };
        OnceOutcome {
            results: processor.take_results(),
            error,
        }
    }
}

impl DriverOnce<'_> {
    async fn drive(
        &mut self,
        tests: Vec<TestMetadata>,
        processor: &mut EventProcessor,
    ) -> Result<(), RunFailure> {
        let session = self
            .cache
            .ensure_healthy()
            .await
            .map_err(RunFailure::Connection)?;

        // A yellow stack means some fixture failed to reset last time;
        // rebuild it before running anything else on top of it.
        {
            let mut stack = self.stack.lock().await;
            if stack.status() == StackStatus::Yellow {
                self.logger
                    .info("Rebuilding fixture stack after reset failure");
                while !stack.is_empty() {
                    stack.pop().await;
                }
            } else if !stack.is_empty() {
                stack.reset().await;
            }
        }

        // Forwards live per invocation; their addresses go to the bundle as
        // service config.
        let mut forwards = ForwardSet::new();
        let forward_specs = [
            (
                ForwardKind::Tlw,
                self.run_config.tlw_addr.clone(),
            ),
            (
                ForwardKind::DutServer,
                self.run_config.dut_server_addr.clone(),
            ),
            (
                ForwardKind::EphemeralCache,
                self.run_config.cache_server_addr.clone(),
            ),
            (
                ForwardKind::Reports,
                self.reports.map(|r| r.local_addr().to_string()),
            ),
        ];
        for (kind, addr) in forward_specs {
            if let Some(addr) = addr {
                forwards
                    .establish(&session, kind, &addr)
                    .await
                    .map_err(RunFailure::Forward)?;
            }
        }

        processor.add_handler(Box::new(LoggingHandler::new()));
        processor.add_handler(Box::new(TimingHandler::new()));
        processor.add_handler(Box::new(
            StreamedResultsHandler::new(&self.run_config.results_dir)
                .map_err(RunFailure::Processor)?,
        ));
        if let Some(reports) = self.reports {
            processor.add_handler(Box::new(RpcResultsHandler::new(
                reports.reporter(),
                self.tracker.clone(),
            )));
        }
        processor.add_handler(Box::new(FailFastHandler::new(self.tracker.clone())));
        processor.add_handler(Box::new(CopyOutputHandler::new(
            Box::new(SshOutputPuller::new(session.clone())),
            self.run_config.remote_out_dir.clone(),
        )));
        processor.add_handler(Box::new(StackOperationHandler::new(
            self.registry.clone(),
            self.stack.clone(),
        )));

        // Drain any stack events synthesized between invocations into the
        // fresh pipeline, so fixture lifecycles stay visible in the stream.
        while let Ok(event) = self.stack_events.try_recv() {
            processor.process(event).await.map_err(RunFailure::Processor)?;
        }

        if let Some(port) = self.run_config.debug_port {
            bundle::clear_debug_port(&session, port)
                .await
                .map_err(RunFailure::Bundle)?;
        }

        let bundle_config = BundleRunConfig {
            tests: tests.iter().map(|t| t.name.clone()).collect(),
            heartbeat_interval: self.run_config.heartbeat_interval,
            out_dir: self.run_config.remote_out_dir.clone(),
            services: forwards.service_config(),
        };
        let command = BundleCommand::remote(
            &session,
            self.bundle_path,
            self.run_config.debug_port,
        );

        let outcome = bundle::run_bundle(
            command,
            &bundle_config,
            self.run_config.msg_timeout,
            processor,
            self.tracker,
            self.cancelled.clone(),
        )
        .await;

        forwards.close(&session).await;

        // Stack operations executed during the run emitted their events into
        // the channel; fold them into this invocation's pipeline.
        while let Ok(event) = self.stack_events.try_recv() {
            processor.process(event).await.map_err(RunFailure::Processor)?;
        }

        match outcome {
            Ok(BundleStopCause::Completed) => Ok(()),
            Ok(BundleStopCause::FailFast) => {
                processor
                    .finalize("Run aborted: maximum failure threshold reached", None)
                    .await
                    .map_err(RunFailure::Processor)?;
                Ok(())
            }
            Ok(BundleStopCause::Cancelled(reason)) => {
                processor
                    .finalize(&reason.to_string(), None)
                    .await
                    .map_err(RunFailure::Processor)?;
                Err(RunFailure::Cancelled { reason })
            }
            Err(RunFailure::Bundle(BundleError::Stalled { budget })) => {
                processor
                    .finalize(
                        "Test did not finish",
                        Some(&format!(
                            "no message from bundle in {}",
                            humantime::format_duration(budget)
                        )),
                    )
                    .await
                    .map_err(RunFailure::Processor)?;
                // The test gets a synthesized failure and, if it has budget
                // left, another attempt on a fresh bundle.
                Ok(())
            }
            Err(RunFailure::Bundle(error)) => self.diagnose_broken_stream(error, processor).await,
            Err(error) => Err(error),
        }
    }

    /// The event stream broke. Decide between "the connection died" (attach
    /// the diagnosis, reconnect, and let the coordinator re-drive the
    /// unfinished tests) and "the bundle itself died" (fatal).
    async fn diagnose_broken_stream(
        &mut self,
        error: BundleError,
        processor: &mut EventProcessor,
    ) -> Result<(), RunFailure> {
        debug!(%error, "event stream broke; diagnosing");

        let ping_error = match self.cache.current() {
            Some(session) => session.ping().await.err(),
            None => None,
        };
        let Some(ping_error) = ping_error else {
            // The connection is fine; the bundle itself failed.
            processor
                .finalize("Test bundle stopped early", Some(&error.to_string()))
                .await
                .map_err(RunFailure::Processor)?;
            return Err(RunFailure::Bundle(error));
        };

        processor
            .finalize("Lost SSH connection", Some(&ping_error.to_string()))
            .await
            .map_err(RunFailure::Processor)?;

        match self.cache.ensure_healthy().await {
            Ok(_session) => {
                // Reconnected (possibly via reboot). The in-flight test got
                // a synthesized failure; if it has retry budget left, the
                // coordinator re-drives it on a fresh bundle.
                self.logger.info("Reconnected to target");
                Ok(())
            }
            Err(connect_error) => Err(RunFailure::Connection(connect_error)),
        }
    }
}

impl std::fmt::Debug for TestDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestDriver")
            .field("endpoint", self.cache.connection_spec())
            .field("bundle_path", &self.bundle_path)
            .finish_non_exhaustive()
    }
}
