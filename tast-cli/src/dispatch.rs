// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::print_summary;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{eyre, Result, WrapErr};
use std::{collections::BTreeMap, io::IsTerminal, time::Duration};
use tast_runner::{
    cancel::{cancel_pair, CancelReason},
    config::{RunConfig, SshConfig},
    driver::TestDriver,
    events::TestMetadata,
    fixture::FixtureRegistry,
    logging::{Logger, WriterSink},
    target::TargetEndpoint,
};
use tracing::debug;

/// The `tast` command-line app.
#[derive(Debug, Parser)]
#[command(name = "tast", about = "Run integration tests on a remote device", version)]
pub struct TastApp {
    /// Log verbose messages.
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Runs tests on a target device.
    Run(RunOpts),
}

#[derive(Debug, Args)]
struct RunOpts {
    /// The target device, as `[user@]host[:port]`.
    target: String,

    /// Names of the tests to run, in order.
    #[arg(required = true)]
    tests: Vec<String>,

    /// Private key for SSH authentication.
    #[arg(long = "keyfile", value_name = "PATH")]
    key_file: Option<Utf8PathBuf>,

    /// Directory to write results into.
    #[arg(long = "resultsdir", value_name = "DIR", default_value = "results")]
    results_dir: Utf8PathBuf,

    /// Extra attempts for each failing test.
    #[arg(long, default_value_t = 0)]
    retries: usize,

    /// Abort the run after this many test failures (0 disables).
    #[arg(long = "maxtestfailures", default_value_t = 0)]
    max_failures: usize,

    /// Overall wall-clock budget for the run, e.g. "30m".
    #[arg(long = "timeout", value_parser = humantime::parse_duration)]
    run_timeout: Option<Duration>,

    /// Path of the test bundle on the target.
    #[arg(
        long = "bundle",
        value_name = "PATH",
        default_value = "/usr/local/libexec/tast/bundles/cros"
    )]
    bundle_path: String,

    /// Address of the upstream progress sink to forward results to.
    #[arg(long = "reports-server", value_name = "ADDR")]
    progress_sink: Option<String>,

    /// `test=request` pairs mapping tests to upstream request names.
    #[arg(long = "report-request", value_name = "TEST=REQUEST")]
    report_requests: Vec<String>,

    /// Run the bundle under a headless debugger on this port.
    #[arg(long = "debugger-port", value_name = "PORT")]
    debug_port: Option<u16>,
}

impl TastApp {
    /// Executes the parsed command, returning the process exit code.
    pub fn exec(self) -> Result<i32> {
        init_tracing(self.verbose);

        match self.command {
            Command::Run(opts) => run_tests(opts),
        }
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default = if verbose { "tast=debug" } else { "tast=warn" };
    let filter = EnvFilter::try_from_env("TAST_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();
}

fn parse_request_names(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut mapping = BTreeMap::new();
    for pair in pairs {
        let (test, request) = pair
            .split_once('=')
            .ok_or_else(|| eyre!("invalid --report-request `{pair}`: expected TEST=REQUEST"))?;
        if mapping.insert(test.to_owned(), request.to_owned()).is_some() {
            return Err(eyre!("duplicate --report-request for test `{test}`"));
        }
    }
    Ok(mapping)
}

fn run_tests(opts: RunOpts) -> Result<i32> {
    let endpoint: TargetEndpoint = opts
        .target
        .parse()
        .wrap_err("failed to parse target endpoint")?;

    let run_config = RunConfig {
        results_dir: opts.results_dir.clone(),
        retries: opts.retries,
        max_failures: opts.max_failures,
        run_timeout: opts.run_timeout,
        debug_port: opts.debug_port,
        request_names: parse_request_names(&opts.report_requests)?,
        progress_sink_addr: opts.progress_sink.clone(),
        ..RunConfig::default()
    };
    let ssh_config = SshConfig {
        key_file: opts.key_file.clone(),
        ..SshConfig::default()
    };

    let logger = Logger::new(WriterSink::new(std::io::stdout()));
    let tests: Vec<TestMetadata> = opts
        .tests
        .iter()
        .map(|name| TestMetadata::named(name.as_str()))
        .collect();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("tast-runner-worker")
        .build()
        .wrap_err("failed to create runtime")?;

    let report = runtime.block_on(async move {
        let mut driver = TestDriver::new(
            endpoint,
            run_config,
            ssh_config,
            opts.bundle_path.clone(),
            FixtureRegistry::new(),
            logger,
        );

        let (cancel, cancelled) = cancel_pair();

        // Ctrl-C cancels the run; the driver synthesizes terminal errors for
        // whatever is in flight.
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    debug!("interrupt received; cancelling run");
                    cancel.cancel(CancelReason::UserAbort);
                }
            });
        }
        if let Some(timeout) = opts.run_timeout {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                cancel.cancel(CancelReason::Timeout);
            });
        }

        driver.run(tests, cancelled).await
    })?;

    print_summary(&mut std::io::stdout(), &report)?;
    Ok(if report.has_failures() { 1 } else { 0 })
}
