// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run and connection configuration.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};

/// Configuration for one test run.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RunConfig {
    /// Directory results are written into.
    pub results_dir: Utf8PathBuf,

    /// Per-test retry budget. 0 disables retries.
    pub retries: usize,

    /// Abort the run once this many tests have failed. 0 disables the
    /// feature.
    pub max_failures: usize,

    /// How often the bundle emits heartbeat events.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Slack added on top of a test's remaining timeout before the stream is
    /// declared stalled.
    #[serde(with = "humantime_serde")]
    pub msg_timeout: Duration,

    /// Overall wall-clock budget for the run, if any.
    #[serde(with = "humantime_serde")]
    pub run_timeout: Option<Duration>,

    /// If set, the bundle is run under a headless debugger listening on this
    /// port.
    pub debug_port: Option<u16>,

    /// Mapping from test name to the externally assigned request name used
    /// for upstream correlation. Established once per run.
    pub request_names: BTreeMap<String, String>,

    /// Address of the upstream progress sink, if results should be forwarded.
    pub progress_sink_addr: Option<String>,

    /// Host-side address of the TLW test-resource server to expose to the
    /// DUT, if any.
    pub tlw_addr: Option<String>,

    /// Host-side address of the DUT server to expose to the DUT, if any.
    pub dut_server_addr: Option<String>,

    /// Host-side address of the ephemeral cache server to expose to the
    /// DUT, if any.
    pub cache_server_addr: Option<String>,

    /// Directory on the DUT the bundle writes per-test output into.
    pub remote_out_dir: Utf8PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            results_dir: Utf8PathBuf::from("results"),
            retries: 0,
            max_failures: 0,
            heartbeat_interval: Duration::from_secs(1),
            msg_timeout: Duration::from_secs(60),
            run_timeout: None,
            debug_port: None,
            request_names: BTreeMap::new(),
            progress_sink_addr: None,
            tlw_addr: None,
            dut_server_addr: None,
            cache_server_addr: None,
            remote_out_dir: Utf8PathBuf::from("/usr/local/tast/out"),
        }
    }
}

/// Configuration for SSH connections to the target.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SshConfig {
    /// Private key used for authentication. Targets accept key-based auth
    /// only.
    pub key_file: Option<Utf8PathBuf>,

    /// Deadline for a single connect attempt.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Number of connect attempts before giving up (or falling back to a
    /// reboot, if a helper is available).
    pub connect_retries: usize,

    /// Delay between connect attempts.
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,

    /// Deadline for a liveness ping.
    #[serde(with = "humantime_serde")]
    pub ping_timeout: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            key_file: None,
            connect_timeout: Duration::from_secs(10),
            connect_retries: 3,
            retry_interval: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(5),
        }
    }
}

/// Addresses of host-side services the bundle should talk to, passed down in
/// the serialized run config.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServiceConfig {
    /// Address of the TLW test-resource server, as reachable from the DUT.
    pub tlw_addr: Option<String>,

    /// Address of the DUT server, as reachable from the DUT.
    pub dut_server_addr: Option<String>,

    /// Address of the ephemeral cache server on the DUT side of its reverse
    /// forward.
    pub cache_addr: Option<String>,

    /// Address of the host's reports server, as reachable from the DUT.
    pub reports_addr: Option<String>,
}

/// The run configuration serialized onto the bundle's stdin.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BundleRunConfig {
    /// Names of the tests to run, in order.
    pub tests: Vec<String>,

    /// How often to emit heartbeat events.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Remote directory the bundle writes per-test output artifacts into.
    pub out_dir: Utf8PathBuf,

    /// Host-side service addresses.
    pub services: ServiceConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn run_config_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.msg_timeout, Duration::from_secs(60));
        assert_eq!(config.max_failures, 0);
    }

    #[test]
    fn run_config_durations_accept_humane_strings() {
        let config: RunConfig =
            serde_json::from_str(r#"{"heartbeat_interval": "2s", "msg_timeout": "1m 30s"}"#)
                .unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.msg_timeout, Duration::from_secs(90));
    }
}
