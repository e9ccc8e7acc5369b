// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The reports server and the upstream progress-sink bridge.
//!
//! The running bundle calls the host back over gRPC (through a reverse port
//! forward) with per-test reports and log chunks. The server translates
//! each call into the upstream progress sink's schema and forwards it,
//! keyed by the externally assigned request name. After the run,
//! [`ReportsServer::send_missing_reports`] synthesizes a result for every
//! planned test that never reported, so the upstream service sees exactly
//! one result per request name.

mod convert;

pub use convert::*;

use crate::{
    errors::ReportsError,
    processor::handlers::ResultReporter,
    results::TestResult,
    retry::MaxFailTracker,
};
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, BTreeSet},
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tast_proto::{
    progress::{
        progress_sink_client::ProgressSinkClient, ErrorSeverity, ProgressError, ProgressResult,
        ProgressResultRequest, ReportLogRequest, ResultState,
    },
    reports::{
        reports_server::{Reports, ReportsServer as ReportsGrpcServer},
        LogStreamRequest, LogStreamResponse, ReportResultRequest, ReportResultResponse,
    },
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::{transport::Channel, Request, Response, Status, Streaming};
use tracing::debug;

/// Connects to the upstream progress sink at `addr` (`host:port`).
pub async fn connect_progress_sink(
    addr: &str,
) -> Result<ProgressSinkClient<Channel>, ReportsError> {
    let endpoint = tonic::transport::Endpoint::from_shared(format!("http://{addr}"))
        .map_err(ReportsError::Transport)?;
    let channel = endpoint.connect().await.map_err(ReportsError::Transport)?;
    Ok(ProgressSinkClient::new(channel))
}

struct ReportsState {
    /// Test name -> externally assigned request name. Established once per
    /// run; keys are unique.
    request_names: BTreeMap<String, String>,
    sink: ProgressSinkClient<Channel>,
    tracker: Arc<MaxFailTracker>,
    /// Request names that have been answered with a result.
    reported: Mutex<BTreeSet<String>>,
}

impl ReportsState {
    fn request_name(&self, test: &str) -> Result<&str, ReportsError> {
        self.request_names
            .get(test)
            .map(String::as_str)
            .ok_or_else(|| ReportsError::UnknownTest {
                name: test.to_owned(),
            })
    }

    async fn forward_result(
        &self,
        request_name: &str,
        result: ProgressResult,
    ) -> Result<bool, ReportsError> {
        let mut sink = self.sink.clone();
        let response = sink
            .report_result(ProgressResultRequest {
                request: request_name.to_owned(),
                result: Some(result),
            })
            .await
            .map_err(ReportsError::Upstream)?
            .into_inner();

        self.reported
            .lock()
            .unwrap()
            .insert(request_name.to_owned());

        if response.terminate {
            self.tracker.trip();
        }
        Ok(response.terminate)
    }
}

#[derive(Clone)]
struct ReportsService {
    state: Arc<ReportsState>,
}

#[tonic::async_trait]
impl Reports for ReportsService {
    async fn log_stream(
        &self,
        request: Request<Streaming<LogStreamRequest>>,
    ) -> Result<Response<LogStreamResponse>, Status> {
        let mut inbound = request.into_inner();

        // One upstream ReportLog stream per inbound LogStream call; chunks
        // are forwarded as they arrive.
        let (tx, rx) = mpsc::channel::<ReportLogRequest>(16);
        let mut sink = self.state.sink.clone();
        let upstream: JoinHandle<Result<(), Status>> = tokio::spawn(async move {
            sink.report_log(ReceiverStream::new(rx))
                .await
                .map(|_| ())
        });

        let mut forward_error = None;
        while let Some(chunk) = inbound.message().await? {
            let request_name = match self.state.request_name(&chunk.test) {
                Ok(name) => name.to_owned(),
                Err(error) => {
                    forward_error = Some(Status::invalid_argument(error.to_string()));
                    break;
                }
            };
            let sent = tx
                .send(ReportLogRequest {
                    name: chunk.log_path,
                    request: request_name,
                    data: chunk.data,
                })
                .await;
            if sent.is_err() {
                // The upstream task bailed; its join result carries the
                // error.
                break;
            }
        }
        drop(tx);

        let upstream_result = upstream
            .await
            .map_err(|_| Status::internal("log forwarding task panicked"))?;
        if let Some(status) = forward_error {
            return Err(status);
        }
        upstream_result?;
        Ok(Response::new(LogStreamResponse {}))
    }

    async fn report_result(
        &self,
        request: Request<ReportResultRequest>,
    ) -> Result<Response<ReportResultResponse>, Status> {
        let report = request.into_inner();
        let request_name = self
            .state
            .request_name(&report.test)
            .map_err(|error| Status::invalid_argument(error.to_string()))?
            .to_owned();

        let result = bundle_report_to_progress(&report);
        let terminate = self
            .state
            .forward_result(&request_name, result)
            .await
            .map_err(|error| Status::unavailable(error.to_string()))?;

        Ok(Response::new(ReportResultResponse { terminate }))
    }
}

/// The host-side gRPC server the bundle reports into.
pub struct ReportsServer {
    local_addr: SocketAddr,
    state: Arc<ReportsState>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<(), tonic::transport::Error>>,
}

impl ReportsServer {
    /// Binds an ephemeral localhost port and starts serving.
    ///
    /// `request_names` maps each planned test to its upstream request name;
    /// `sink` is the upstream client every report is forwarded to.
    pub async fn start(
        request_names: BTreeMap<String, String>,
        sink: ProgressSinkClient<Channel>,
        tracker: Arc<MaxFailTracker>,
    ) -> Result<Self, ReportsError> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(ReportsError::Bind)?;
        let local_addr = listener.local_addr().map_err(ReportsError::Bind)?;

        let state = Arc::new(ReportsState {
            request_names,
            sink,
            tracker,
            reported: Mutex::new(BTreeSet::new()),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let service = ReportsService {
            state: state.clone(),
        };
        let handle = tokio::spawn(
            tonic::transport::Server::builder()
                .add_service(ReportsGrpcServer::new(service))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    let _ = shutdown_rx.await;
                }),
        );

        debug!(%local_addr, "reports server listening");
        Ok(Self {
            local_addr,
            state,
            shutdown: Some(shutdown_tx),
            handle,
        })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns a reporter that forwards results through the same state and
    /// upstream client, for the RPC-results handler.
    pub fn reporter(&self) -> Box<dyn ResultReporter> {
        Box::new(ProgressReporter {
            state: self.state.clone(),
        })
    }

    /// Emits a synthesized "Test was not run" result for every configured
    /// request name that never received one. Returns how many were sent.
    pub async fn send_missing_reports(&self) -> Result<usize, ReportsError> {
        let missing: Vec<(String, String)> = {
            let reported = self.state.reported.lock().unwrap();
            self.state
                .request_names
                .iter()
                .filter(|(_, request)| !reported.contains(*request))
                .map(|(test, request)| (test.clone(), request.clone()))
                .collect()
        };

        for (test, request) in &missing {
            debug!(%test, %request, "sending missing-test report");
            let result = missing_test_result();
            self.state.forward_result(request, result).await?;
        }
        Ok(missing.len())
    }

    /// Stops the server and waits for it to wind down.
    pub async fn shutdown(mut self) -> Result<(), ReportsError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        match self.handle.await {
            Ok(result) => result.map_err(ReportsError::Transport),
            Err(_) => Ok(()),
        }
    }
}

impl std::fmt::Debug for ReportsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportsServer")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

/// Forwards host-side completed results upstream, sharing the reported-set
/// with the reports server so missing-report synthesis sees both paths.
struct ProgressReporter {
    state: Arc<ReportsState>,
}

#[async_trait]
impl ResultReporter for ProgressReporter {
    async fn report(&mut self, result: &TestResult) -> Result<bool, ReportsError> {
        // Tests without a request name are simply not forwarded; local-only
        // runs configure no mapping at all.
        let Ok(request_name) = self.state.request_name(&result.test.name) else {
            return Ok(false);
        };
        let request_name = request_name.to_owned();
        let progress = test_result_to_progress(result);
        self.state.forward_result(&request_name, progress).await
    }
}

/// The synthesized result for a planned test that never ran.
fn missing_test_result() -> ProgressResult {
    ProgressResult {
        state: ResultState::Skipped as i32,
        errors: vec![ProgressError {
            time: Some(to_timestamp(chrono::Utc::now())),
            reason: "Test was not run".to_owned(),
            file: String::new(),
            line: 0,
            stack: String::new(),
            severity: ErrorSeverity::Warning as i32,
        }],
        skip_reason: "Test was not run".to_owned(),
        start_time: None,
        duration: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ErrorReport as EventError, TestMetadata};
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use tast_proto::{
        progress::{
            progress_sink_server::{ProgressSink, ProgressSinkServer},
            ProgressResultResponse, ReportLogResponse,
        },
        reports::reports_client::ReportsClient,
    };

    /// In-process progress sink recording everything it receives.
    #[derive(Default)]
    struct FakeSinkState {
        results: Mutex<Vec<ProgressResultRequest>>,
        /// Log bytes per request name.
        logs: Mutex<BTreeMap<String, Vec<u8>>>,
        max_failures: usize,
    }

    #[derive(Clone)]
    struct FakeSink {
        state: Arc<FakeSinkState>,
    }

    #[tonic::async_trait]
    impl ProgressSink for FakeSink {
        async fn report_log(
            &self,
            request: Request<Streaming<ReportLogRequest>>,
        ) -> Result<Response<ReportLogResponse>, Status> {
            let mut inbound = request.into_inner();
            while let Some(chunk) = inbound.message().await? {
                self.state
                    .logs
                    .lock()
                    .unwrap()
                    .entry(chunk.request)
                    .or_default()
                    .extend_from_slice(&chunk.data);
            }
            Ok(Response::new(ReportLogResponse {}))
        }

        async fn report_result(
            &self,
            request: Request<ProgressResultRequest>,
        ) -> Result<Response<ProgressResultResponse>, Status> {
            let mut results = self.state.results.lock().unwrap();
            results.push(request.into_inner());
            let failures = results
                .iter()
                .filter(|r| {
                    r.result.as_ref().map(|res| res.state) == Some(ResultState::Failed as i32)
                })
                .count();
            let terminate = self.state.max_failures > 0 && failures >= self.state.max_failures;
            Ok(Response::new(ProgressResultResponse { terminate }))
        }
    }

    async fn start_fake_sink(
        max_failures: usize,
    ) -> (Arc<FakeSinkState>, ProgressSinkClient<Channel>) {
        let state = Arc::new(FakeSinkState {
            max_failures,
            ..FakeSinkState::default()
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sink = FakeSink {
            state: state.clone(),
        };
        tokio::spawn(
            tonic::transport::Server::builder()
                .add_service(ProgressSinkServer::new(sink))
                .serve_with_incoming(TcpListenerStream::new(listener)),
        );
        let client = connect_progress_sink(&addr.to_string()).await.unwrap();
        (state, client)
    }

    fn mapping(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(t, r)| (t.to_string(), r.to_string()))
            .collect()
    }

    async fn start_server(
        pairs: &[(&str, &str)],
        max_failures: usize,
    ) -> (Arc<FakeSinkState>, ReportsServer, Arc<MaxFailTracker>) {
        let (sink_state, client) = start_fake_sink(max_failures).await;
        let tracker = Arc::new(MaxFailTracker::new(0));
        let server = ReportsServer::start(mapping(pairs), client, tracker.clone())
            .await
            .unwrap();
        (sink_state, server, tracker)
    }

    async fn bundle_client(server: &ReportsServer) -> ReportsClient<Channel> {
        let endpoint =
            tonic::transport::Endpoint::from_shared(format!("http://{}", server.local_addr()))
                .unwrap();
        ReportsClient::new(endpoint.connect().await.unwrap())
    }

    #[tokio::test]
    async fn result_is_translated_and_forwarded() {
        let (sink_state, server, _tracker) =
            start_server(&[("example.Pass", "req-1")], 0).await;
        let mut client = bundle_client(&server).await;

        let response = client
            .report_result(ReportResultRequest {
                test: "example.Pass".into(),
                errors: vec![],
                skip_reason: String::new(),
                start_time: Some(to_timestamp(Utc::now())),
                duration: Some(prost_types::Duration {
                    seconds: 3,
                    nanos: 0,
                }),
            })
            .await
            .unwrap()
            .into_inner();
        assert!(!response.terminate);

        let results = sink_state.results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].request, "req-1");
        assert_eq!(
            results[0].result.as_ref().unwrap().state,
            ResultState::Succeeded as i32
        );
    }

    #[tokio::test]
    async fn unknown_test_name_is_rejected() {
        let (_sink_state, server, _tracker) = start_server(&[("known", "req-1")], 0).await;
        let mut client = bundle_client(&server).await;

        let status = client
            .report_result(ReportResultRequest {
                test: "unknown".into(),
                errors: vec![],
                skip_reason: String::new(),
                start_time: None,
                duration: None,
            })
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn log_chunks_are_forwarded_under_the_request_name() {
        let (sink_state, server, _tracker) = start_server(&[("example.Pass", "req-1")], 0).await;
        let mut client = bundle_client(&server).await;

        let chunks = vec![
            LogStreamRequest {
                test: "example.Pass".into(),
                log_path: "log.txt".into(),
                data: b"hello ".to_vec(),
            },
            LogStreamRequest {
                test: "example.Pass".into(),
                log_path: "log.txt".into(),
                data: b"world".to_vec(),
            },
        ];
        client
            .log_stream(tokio_stream::iter(chunks))
            .await
            .unwrap();

        let logs = sink_state.logs.lock().unwrap();
        assert_eq!(logs.get("req-1").unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn failed_result_reaching_threshold_terminates() {
        let (_sink_state, server, tracker) = start_server(&[("example.Fail", "req-1")], 1).await;
        let mut client = bundle_client(&server).await;

        let response = client
            .report_result(ReportResultRequest {
                test: "example.Fail".into(),
                errors: vec![tast_proto::reports::ErrorReport {
                    time: Some(to_timestamp(Utc::now())),
                    reason: "boom".into(),
                    file: "x.go".into(),
                    line: 7,
                    stack: "trace".into(),
                }],
                skip_reason: String::new(),
                start_time: Some(to_timestamp(Utc::now())),
                duration: None,
            })
            .await
            .unwrap()
            .into_inner();
        assert!(response.terminate, "upstream threshold reached");
        assert!(tracker.exceeded(), "terminate trips the shared tracker");
    }

    #[tokio::test]
    async fn missing_reports_cover_every_configured_request() {
        let (sink_state, server, _tracker) =
            start_server(&[("a.Ran", "req-1"), ("a.NotRun", "req-2")], 0).await;

        // a.Ran reports through the host-side reporter path.
        let mut reporter = ProgressReporter {
            state: server.state.clone(),
        };
        let time = Utc::now();
        let result = TestResult {
            test: TestMetadata::named("a.Ran"),
            start_time: time,
            end_time: time,
            errors: vec![EventError::new(time, "boom")],
            skip_reason: None,
            out_dir: "/out".into(),
            log_path: "/out/log.txt".into(),
        };
        reporter.report(&result).await.unwrap();

        let missing = server.send_missing_reports().await.unwrap();
        assert_eq!(missing, 1);

        let results = sink_state.results.lock().unwrap();
        let mut requests: Vec<_> = results.iter().map(|r| r.request.clone()).collect();
        requests.sort();
        assert_eq!(requests, ["req-1", "req-2"], "exactly one result each");

        let synthesized = results.iter().find(|r| r.request == "req-2").unwrap();
        let progress = synthesized.result.as_ref().unwrap();
        assert_eq!(progress.state, ResultState::Skipped as i32);
        assert_eq!(progress.errors[0].reason, "Test was not run");
        assert_eq!(progress.errors[0].severity, ErrorSeverity::Warning as i32);
    }

    #[tokio::test]
    async fn send_missing_reports_is_idempotent_after_full_coverage() {
        let (_sink_state, server, _tracker) = start_server(&[("a.A", "req-1")], 0).await;
        assert_eq!(server.send_missing_reports().await.unwrap(), 1);
        assert_eq!(server.send_missing_reports().await.unwrap(), 0);
    }
}
