// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The debugger command rewrite.
//!
//! When a debug port is configured, the bundle runs under a headless `dlv`
//! listening on that port. The rewrite is transparent to every other
//! component: the event stream, stdin config, and reports flow are
//! unchanged.

use crate::{
    errors::{BundleError, ConnectionError},
    target::SshSession,
};
use std::time::Duration;
use tracing::debug;

const PORT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Rewrites a bundle invocation to run under a headless debugger.
pub fn debugger_command_line(bundle_path: &str, port: u16) -> String {
    format!(
        "dlv exec {bundle_path} --headless --listen=:{port} --api-version=2 \
         --log-dest=/dev/null --"
    )
}

/// Makes the debug port usable: a pre-existing debugger on the port is
/// killed; any other listener is fatal.
pub async fn clear_debug_port(session: &SshSession, port: u16) -> Result<(), BundleError> {
    let map_err = |error: ConnectionError| BundleError::DebugPortCheck { port, error };

    // lsof exits non-zero when nothing is listening; that's the common case.
    let pids = match session
        .check_output(&format!("lsof -t -i tcp:{port} -s tcp:LISTEN"), PORT_CHECK_TIMEOUT)
        .await
    {
        Ok(pids) => pids,
        Err(ConnectionError::CommandFailed { .. }) => return Ok(()),
        Err(error) => return Err(map_err(error)),
    };

    for pid in pids.split_whitespace() {
        let process = session
            .check_output(&format!("ps -o comm= -p {pid}"), PORT_CHECK_TIMEOUT)
            .await
            .map_err(map_err)?;
        if !process.contains("dlv") {
            return Err(BundleError::DebugPortBusy { port, process });
        }
        debug!(pid, port, "killing stale debugger");
        session
            .check_output(&format!("kill {pid}"), PORT_CHECK_TIMEOUT)
            .await
            .map_err(map_err)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rewrite_prefixes_dlv_exec() {
        assert_eq!(
            debugger_command_line("/usr/local/libexec/tast/bundles/cros", 2345),
            "dlv exec /usr/local/libexec/tast/bundles/cros --headless \
             --listen=:2345 --api-version=2 --log-dest=/dev/null --"
        );
    }
}
