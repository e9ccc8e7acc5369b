// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The bundle client / process supervisor.
//!
//! A bundle is launched locally or over SSH with the serialized run config
//! on its stdin; its stdout carries the length-prefixed event stream and its
//! stderr is captured line-buffered as diagnostics. The supervisor reads
//! events on a background task and drives the processor from the main loop,
//! watching for stalls (no event within the budget), cancellation, and
//! fail-fast trips between events.

mod debug;

pub use debug::*;

use crate::{
    cancel::{CancelReason, Cancelled},
    config::BundleRunConfig,
    errors::{BundleError, EventStreamError, RunFailure},
    events::{self, Event},
    processor::EventProcessor,
    retry::MaxFailTracker,
    target::SshSession,
    time::stall_timer,
};
use camino::Utf8Path;
use std::{
    collections::VecDeque,
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::mpsc,
};
use tracing::{debug, warn};

/// Environment variable telling the bundle which fd to write out-of-band
/// stack traces to.
const STACK_TRACE_FD_ENV: &str = "TAST_B189332919_STACK_TRACE_FD";

/// How long a bundle gets to exit after its stdin closes or a kill is
/// requested, before being killed outright.
const KILL_GRACE: Duration = Duration::from_secs(3);

/// How many trailing stderr lines are kept for diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// A ready-to-spawn bundle invocation.
pub struct BundleCommand {
    command: Command,
    description: String,
}

impl BundleCommand {
    /// Runs the bundle binary directly on the host.
    pub fn local(path: &Utf8Path) -> Self {
        Self {
            command: Command::new(path.as_str()),
            description: path.to_string(),
        }
    }

    /// Runs the bundle binary on the target through `session`. If
    /// `debug_port` is set, the remote command line is rewritten to run
    /// under a headless debugger; callers should clear the port first with
    /// [`clear_debug_port`].
    pub fn remote(session: &SshSession, remote_path: &str, debug_port: Option<u16>) -> Self {
        let command_line = match debug_port {
            Some(port) => debugger_command_line(remote_path, port),
            None => remote_path.to_owned(),
        };
        Self {
            command: session.remote_command(&command_line),
            description: format!("{remote_path} on {}", session.destination()),
        }
    }

    /// A human-readable description of what will run where.
    pub fn description(&self) -> &str {
        &self.description
    }
}

/// How a bundle invocation stopped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BundleStopCause {
    /// `RunEnd` was observed and the process exited cleanly.
    Completed,

    /// The failure threshold tripped between events; the bundle was
    /// stopped without waiting for the remaining tests.
    FailFast,

    /// The run was cancelled.
    Cancelled(CancelReason),
}

/// Launches the bundle and supervises it to completion.
///
/// In-flight entities are NOT finalized here: on any abnormal stop the
/// caller pings the connection, runs its diagnosis, and calls
/// [`EventProcessor::finalize`] with the resulting message.
pub async fn run_bundle(
    mut bundle: BundleCommand,
    run_config: &BundleRunConfig,
    msg_timeout: Duration,
    processor: &mut EventProcessor,
    tracker: &MaxFailTracker,
    mut cancelled: Cancelled,
) -> Result<BundleStopCause, RunFailure> {
    let description = bundle.description.clone();
    debug!(bundle = %description, "launching bundle");

    bundle
        .command
        .env(STACK_TRACE_FD_ENV, "3")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let stack_trace = StackTracePipe::attach(&mut bundle.command)
        .map_err(|error| bundle_failure(&description, error))?;

    let mut child = bundle
        .command
        .spawn()
        .map_err(|error| bundle_failure(&description, error))?;
    let stack_trace = stack_trace.start(&mut child);

    // Hand the bundle its run config, then close stdin so it starts.
    {
        let mut stdin = child.stdin.take().expect("stdin was piped");
        let config =
            serde_json::to_vec(run_config).expect("run config serializes");
        stdin
            .write_all(&config)
            .await
            .map_err(|error| RunFailure::Bundle(BundleError::StdinWrite(error)))?;
        stdin
            .shutdown()
            .await
            .map_err(|error| RunFailure::Bundle(BundleError::StdinWrite(error)))?;
    }

    // Stderr is captured line-buffered; only the tail is kept.
    let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
    let mut stderr_task = {
        let stderr = child.stderr.take().expect("stderr was piped");
        let tail = stderr_tail.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "bundle_stderr", "{line}");
                let mut tail = tail.lock().unwrap();
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        })
    };

    // The reader task turns stdout into a stream of events; the select loop
    // below stays responsive to stalls and cancellation while the processor
    // drains them in FIFO order.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Result<Event, EventStreamError>>();
    {
        let mut stdout = child.stdout.take().expect("stdout was piped");
        tokio::spawn(async move {
            loop {
                match events::read_event(&mut stdout).await {
                    Ok(Some(event)) => {
                        if event_tx.send(Ok(event)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        let _ = event_tx.send(Err(error));
                        break;
                    }
                }
            }
        });
    }

    let heartbeat = run_config.heartbeat_interval;
    let mut stall = std::pin::pin!(stall_timer(stall_budget(heartbeat, None, msg_timeout)));

    let outcome = loop {
        tokio::select! {
            msg = event_rx.recv() => match msg {
                Some(Ok(event)) => {
                    processor
                        .process(event)
                        .await
                        .map_err(RunFailure::Processor)?;
                    stall.as_mut().rearm(stall_budget(
                        heartbeat,
                        processor.open_test_deadline(),
                        msg_timeout,
                    ));
                    if tracker.exceeded() && !processor.run_ended() {
                        break LoopEnd::FailFast;
                    }
                }
                Some(Err(error)) => {
                    break LoopEnd::StreamBroken(error);
                }
                None => {
                    // EOF at a frame boundary. Before RunEnd it means the
                    // process died or closed stdout early; the exit status
                    // (inspected below, after shutdown) decides how that is
                    // reported.
                    break LoopEnd::Eof;
                }
            },
            _ = &mut stall => {
                warn!(
                    budget = ?stall.budget(),
                    "no message from bundle within the stall budget"
                );
                break LoopEnd::Stalled(stall.budget());
            }
            reason = cancelled.cancelled() => {
                break LoopEnd::Cancelled(reason);
            }
        }
    };

    shutdown_child(&mut child).await;

    // The stderr pipe EOFs once the child is gone, but grandchildren may
    // keep it open; don't wait on the reader forever.
    let _ = tokio::time::timeout(Duration::from_secs(1), &mut stderr_task).await;

    if let Some(trace) = stack_trace.collect().await {
        debug!(target: "bundle_stack_trace", "{trace}");
    }

    match outcome {
        LoopEnd::Eof if processor.run_ended() => {
            // A clean event stream with a failing exit status is still a
            // bundle failure.
            match child.wait().await {
                Ok(status) if status.success() => Ok(BundleStopCause::Completed),
                Ok(status) => Err(RunFailure::Bundle(BundleError::EarlyExit {
                    status,
                    stderr_tail: tail_lines(&stderr_tail),
                })),
                Err(error) => Err(bundle_failure(&description, error)),
            }
        }
        LoopEnd::Eof => match child.wait().await {
            Ok(status) if !status.success() => Err(RunFailure::Bundle(BundleError::EarlyExit {
                status,
                stderr_tail: tail_lines(&stderr_tail),
            })),
            _ => Err(RunFailure::Bundle(BundleError::StreamBroken(
                EventStreamError::Io(std::io::Error::other(
                    "bundle closed its event stream before the run completed",
                )),
            ))),
        },
        LoopEnd::FailFast => Ok(BundleStopCause::FailFast),
        LoopEnd::Cancelled(reason) => Ok(BundleStopCause::Cancelled(reason)),
        LoopEnd::StreamBroken(error) => {
            Err(RunFailure::Bundle(BundleError::StreamBroken(error)))
        }
        LoopEnd::Stalled(budget) => Err(RunFailure::Bundle(BundleError::Stalled { budget })),
    }
}

/// How the supervision loop ended; resolved into the public outcome after
/// the child is shut down.
enum LoopEnd {
    Eof,
    FailFast,
    Cancelled(CancelReason),
    StreamBroken(EventStreamError),
    Stalled(Duration),
}

/// The stall budget: generous enough for the slowest legitimate gap, which
/// is a test using its full remaining timeout plus the message slack.
fn stall_budget(
    heartbeat: Duration,
    open_test_deadline: Option<tokio::time::Instant>,
    msg_timeout: Duration,
) -> Duration {
    let remaining = open_test_deadline
        .map(|deadline| deadline.saturating_duration_since(tokio::time::Instant::now()))
        .unwrap_or(Duration::ZERO);
    std::cmp::max(heartbeat * 3, remaining + msg_timeout)
}

fn bundle_failure(description: &str, error: std::io::Error) -> RunFailure {
    RunFailure::Bundle(BundleError::Spawn {
        bundle: description.to_owned(),
        error,
    })
}

fn tail_lines(tail: &Arc<Mutex<VecDeque<String>>>) -> Vec<String> {
    tail.lock().unwrap().iter().cloned().collect()
}

/// Gives the child the kill grace to exit on its own, then kills it.
async fn shutdown_child(child: &mut Child) {
    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            debug!("bundle did not exit within the kill grace; killing");
            let _ = child.kill().await;
        }
    }
}

#[cfg(unix)]
mod stack_trace_imp {
    use std::io::Read;
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::time::Duration;
    use tokio::process::{Child, Command};

    /// A pipe whose write end becomes fd 3 in the bundle, per the
    /// stack-trace fd contract.
    pub(super) struct StackTracePipe {
        reader: std::io::PipeReader,
        // Kept open until the child is spawned; the pre_exec dup2 below
        // needs a live fd to duplicate.
        writer: std::io::PipeWriter,
    }

    pub(super) struct StackTraceReader {
        handle: Option<tokio::task::JoinHandle<String>>,
    }

    impl StackTracePipe {
        pub(super) fn attach(command: &mut Command) -> std::io::Result<Self> {
            let (reader, writer) = std::io::pipe()?;
            let write_fd = writer.as_raw_fd();
            // dup2 into the child has no safe std equivalent; everything
            // else stays in safe fd types. The pipe's ends are CLOEXEC, so
            // the child keeps only the duplicated fd 3.
            unsafe {
                command.pre_exec(move || {
                    if libc::dup2(write_fd, 3) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
            Ok(Self { reader, writer })
        }

        pub(super) fn start(self, _child: &mut Child) -> StackTraceReader {
            // The parent's write end must close, or the reader never sees
            // EOF.
            drop(self.writer);
            let mut file = std::fs::File::from(OwnedFd::from(self.reader));
            let handle = tokio::task::spawn_blocking(move || {
                let mut buf = String::new();
                let _ = file.read_to_string(&mut buf);
                buf
            });
            StackTraceReader {
                handle: Some(handle),
            }
        }
    }

    impl StackTraceReader {
        pub(super) async fn collect(mut self) -> Option<String> {
            let handle = self.handle.take()?;
            // Grandchildren may inherit fd 3 and keep the pipe open past
            // the bundle's death; don't wait on them.
            match tokio::time::timeout(Duration::from_secs(1), handle).await {
                Ok(Ok(trace)) if !trace.trim().is_empty() => Some(trace),
                _ => None,
            }
        }
    }
}

#[cfg(not(unix))]
mod stack_trace_imp {
    use tokio::process::{Child, Command};

    pub(super) struct StackTracePipe;
    pub(super) struct StackTraceReader;

    impl StackTracePipe {
        pub(super) fn attach(_command: &mut Command) -> std::io::Result<Self> {
            Ok(Self)
        }

        pub(super) fn start(self, _child: &mut Child) -> StackTraceReader {
            StackTraceReader
        }
    }

    impl StackTraceReader {
        pub(super) async fn collect(self) -> Option<String> {
            None
        }
    }
}

use stack_trace_imp::StackTracePipe;

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::{
        cancel::cancel_pair,
        config::ServiceConfig,
        events::{write_event, TestMetadata},
        logging::Logger,
        retry::MaxFailTracker,
    };
    use camino::Utf8PathBuf;
    use camino_tempfile::Utf8TempDir;
    use chrono::Utc;
    use std::os::unix::fs::PermissionsExt;

    /// Writes a fake bundle: a script that drains its stdin (the run
    /// config), cats the prepared frame file, then runs `epilogue`.
    async fn fake_bundle(dir: &Utf8TempDir, events: &[Event], epilogue: &str) -> Utf8PathBuf {
        let frames_path = dir.path().join("frames.bin");
        let mut frames = Vec::new();
        for event in events {
            write_event(&mut frames, event).await.unwrap();
        }
        std::fs::write(&frames_path, frames).unwrap();

        let script_path = dir.path().join("bundle.sh");
        let script = format!("#!/bin/sh\ncat > /dev/null\ncat \"{frames_path}\"\n{epilogue}\n");
        std::fs::write(&script_path, script).unwrap();
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();
        script_path
    }

    fn run_config() -> BundleRunConfig {
        BundleRunConfig {
            tests: vec!["example.Pass".into()],
            heartbeat_interval: Duration::from_millis(50),
            out_dir: "/tmp/out".into(),
            services: ServiceConfig::default(),
        }
    }

    fn green_events() -> Vec<Event> {
        let t = Utc::now();
        vec![
            Event::RunStart {
                time: t,
                num_tests: 1,
            },
            Event::TestStart {
                time: t,
                test: TestMetadata::named("example.Pass"),
            },
            Event::TestLog {
                time: t,
                name: "example.Pass".into(),
                text: "ok".into(),
            },
            Event::TestEnd {
                time: t,
                name: "example.Pass".into(),
                skip_reasons: vec![],
            },
            Event::RunEnd {
                time: t,
                log_dir: "/l".into(),
                out_dir: "/o".into(),
            },
        ]
    }

    #[tokio::test]
    async fn green_path_through_a_real_process() {
        let dir = Utf8TempDir::new().unwrap();
        let script = fake_bundle(&dir, &green_events(), "exit 0").await;

        let mut processor = EventProcessor::new(dir.path().join("results"), Logger::none());
        let tracker = MaxFailTracker::new(0);
        let (_cancel, cancelled) = cancel_pair();

        let cause = run_bundle(
            BundleCommand::local(&script),
            &run_config(),
            Duration::from_secs(5),
            &mut processor,
            &tracker,
            cancelled,
        )
        .await
        .unwrap();

        assert_eq!(cause, BundleStopCause::Completed);
        assert!(processor.run_ended());
        assert_eq!(processor.results().len(), 1);
        assert!(processor.results()[0].passed());
    }

    #[tokio::test]
    async fn nonzero_exit_before_run_end_is_an_early_exit() {
        let dir = Utf8TempDir::new().unwrap();
        // Only the first two events; the process then dies mid-run.
        let events = green_events()[..2].to_vec();
        let script = fake_bundle(&dir, &events, "echo boom >&2\nexit 1").await;

        let mut processor = EventProcessor::new(dir.path().join("results"), Logger::none());
        let tracker = MaxFailTracker::new(0);
        let (_cancel, cancelled) = cancel_pair();

        let error = run_bundle(
            BundleCommand::local(&script),
            &run_config(),
            Duration::from_secs(5),
            &mut processor,
            &tracker,
            cancelled,
        )
        .await
        .unwrap_err();

        match error {
            RunFailure::Bundle(BundleError::EarlyExit {
                status,
                stderr_tail,
            }) => {
                assert_eq!(status.code(), Some(1));
                assert!(
                    stderr_tail.iter().any(|line| line.contains("boom")),
                    "stderr tail carries diagnostics: {stderr_tail:?}"
                );
            }
            other => panic!("expected early exit, got {other:?}"),
        }
        // The in-flight test is not finalized here; that's the caller's job.
        assert!(!processor.run_ended());
        assert!(processor.results().is_empty());
    }

    #[tokio::test]
    async fn silent_bundle_trips_the_stall_detector() {
        let dir = Utf8TempDir::new().unwrap();
        let events = vec![Event::RunStart {
            time: Utc::now(),
            num_tests: 1,
        }];
        let script = fake_bundle(&dir, &events, "sleep 30").await;

        let mut processor = EventProcessor::new(dir.path().join("results"), Logger::none());
        let tracker = MaxFailTracker::new(0);
        let (_cancel, cancelled) = cancel_pair();

        let error = run_bundle(
            BundleCommand::local(&script),
            &run_config(),
            Duration::from_millis(200),
            &mut processor,
            &tracker,
            cancelled,
        )
        .await
        .unwrap_err();

        assert!(
            matches!(
                error,
                RunFailure::Bundle(BundleError::Stalled { .. })
            ),
            "got {error:?}"
        );
    }

    #[tokio::test]
    async fn cancellation_stops_the_bundle() {
        let dir = Utf8TempDir::new().unwrap();
        let events = vec![Event::RunStart {
            time: Utc::now(),
            num_tests: 1,
        }];
        let script = fake_bundle(&dir, &events, "sleep 30").await;

        let mut processor = EventProcessor::new(dir.path().join("results"), Logger::none());
        let tracker = MaxFailTracker::new(0);
        let (cancel, cancelled) = cancel_pair();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel(CancelReason::UserAbort);
        });

        let cause = run_bundle(
            BundleCommand::local(&script),
            &run_config(),
            Duration::from_secs(60),
            &mut processor,
            &tracker,
            cancelled,
        )
        .await
        .unwrap();

        assert_eq!(cause, BundleStopCause::Cancelled(CancelReason::UserAbort));
    }

    #[test]
    fn stall_budget_tracks_the_open_test() {
        let heartbeat = Duration::from_secs(1);
        let msg_timeout = Duration::from_secs(60);

        // No open test: the heartbeat floor or the message slack, whichever
        // is larger.
        assert_eq!(stall_budget(heartbeat, None, msg_timeout), msg_timeout);

        // An open test extends the budget by its remaining timeout.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(300);
        let budget = stall_budget(heartbeat, Some(deadline), msg_timeout);
        assert!(budget > Duration::from_secs(350), "got {budget:?}");
    }
}
