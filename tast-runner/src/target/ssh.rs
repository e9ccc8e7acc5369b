// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! One multiplexed SSH connection to the target.
//!
//! A session spawns a single control master (`ssh -M -N`) and runs every
//! remote command and port-forward operation through its control socket.
//! When the master dies, everything riding on it dies with it, which is
//! exactly the "forward death makes the connection unhealthy" behavior the
//! connection cache relies on.

use crate::{
    config::SshConfig,
    errors::{ConnectionError, ForwardError},
    logging::Logger,
    target::{Forward, ForwardKind, TargetEndpoint},
};
use camino::Utf8Path;
use camino_tempfile::Utf8TempDir;
use std::{io::Cursor, process::Stdio, time::Duration};
use tokio::process::{Child, Command};
use tracing::debug;

/// Deadline for a control-socket operation (`-O check`, `-O forward`, ...).
/// These talk to the local master only, so they are fast or broken.
const CONTROL_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the remote `reboot` command. It may block indefinitely, so
/// give up quickly and ignore the outcome.
const REBOOT_TIMEOUT: Duration = Duration::from_secs(3);

/// Deadline for pulling an output tree from the target.
const COPY_TIMEOUT: Duration = Duration::from_secs(120);

/// Exclusive ownership of one SSH session plus its port-forward children.
#[derive(Debug)]
pub struct SshSession {
    destination: String,
    config: SshConfig,
    control_path: String,
    master: tokio::sync::Mutex<Child>,
    // Holds the control socket; removed when the session is dropped.
    _control_dir: Utf8TempDir,
}

impl SshSession {
    /// Establishes a session to `endpoint`, waiting until the control master
    /// accepts commands or `config.connect_timeout` elapses.
    pub async fn connect(
        endpoint: &TargetEndpoint,
        config: &SshConfig,
        logger: &Logger,
    ) -> Result<Self, ConnectionError> {
        let control_dir = camino_tempfile::Builder::new()
            .prefix("tast-ssh-")
            .tempdir()
            .map_err(ConnectionError::SpawnSsh)?;
        let control_path = control_dir.path().join("control.sock").to_string();
        let destination = endpoint.destination();

        let mut cmd = Command::new("ssh");
        cmd.arg("-M")
            .arg("-N")
            .args(["-S", &control_path])
            .args(["-o", "BatchMode=yes"])
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                config.connect_timeout.as_secs().max(1)
            ));
        if let Some(key_file) = &config.key_file {
            cmd.args(["-i", key_file.as_str()]);
        }
        if let Some(port) = endpoint.port() {
            cmd.args(["-p", &port.to_string()]);
        }
        cmd.arg(&destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        debug!(%destination, "spawning ssh control master");
        let mut master = cmd.spawn().map_err(ConnectionError::SpawnSsh)?;

        // The master enforces its own TCP connect timeout; the deadline here
        // bounds the whole handshake in case it wedges past that.
        let deadline = tokio::time::Instant::now() + config.connect_timeout * 2;

        let session = loop {
            if let Some(status) = master.try_wait().map_err(ConnectionError::SpawnSsh)? {
                return Err(ConnectionError::MasterExited { status });
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = master.start_kill();
                return Err(ConnectionError::ConnectTimeout {
                    endpoint: destination,
                    attempts: 1,
                });
            }

            let check = control_command(&control_path, &destination, "check")
                .output()
                .await
                .map_err(ConnectionError::SpawnSsh)?;
            if check.status.success() {
                break Self {
                    destination,
                    config: config.clone(),
                    control_path,
                    master: tokio::sync::Mutex::new(master),
                    _control_dir: control_dir,
                };
            }

            tokio::time::sleep(Duration::from_millis(200)).await;
        };

        logger.debug(format!("Connected to {}", session.destination));
        Ok(session)
    }

    /// The destination this session is connected to.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Returns a command that will run `command` on the target through this
    /// session, with stdio unset. Used for long-lived streaming processes.
    pub fn remote_command(&self, command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(["-S", &self.control_path])
            .args(["-o", "BatchMode=yes"])
            .arg(&self.destination)
            .arg("--")
            .arg(command);
        cmd
    }

    /// Runs `command` on the target, capturing its output, with a deadline.
    pub async fn run_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<std::process::Output, ConnectionError> {
        let mut cmd = self.remote_command(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| ConnectionError::CommandTimeout {
                command: command.to_owned(),
                timeout,
            })?
            .map_err(|error| ConnectionError::Command {
                command: command.to_owned(),
                error,
            })?;
        Ok(output)
    }

    /// Runs `command`, requiring success, and returns its trimmed stdout.
    pub async fn check_output(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<String, ConnectionError> {
        let output = self.run_command(command, timeout).await?;
        if !output.status.success() {
            return Err(ConnectionError::CommandFailed {
                command: command.to_owned(),
                status: output.status,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    /// Checks liveness by running a trivial remote command within the
    /// configured ping deadline.
    pub async fn ping(&self) -> Result<(), ConnectionError> {
        let timeout = self.config.ping_timeout;
        match self.run_command("true", timeout).await? {
            output if output.status.success() => Ok(()),
            output => Err(ConnectionError::CommandFailed {
                command: "true".to_owned(),
                status: output.status,
            }),
        }
    }

    /// Reads the target's boot fingerprint. A change between two successful
    /// reads means the target rebooted in between.
    pub async fn read_boot_fingerprint(&self) -> Result<String, ConnectionError> {
        self.check_output(
            "cat /proc/sys/kernel/random/boot_id",
            self.config.ping_timeout,
        )
        .await
    }

    /// Asks the target to reboot. The command may block indefinitely, so the
    /// deadline is short and the outcome is ignored.
    pub async fn request_reboot(&self, logger: &Logger) {
        logger.info(format!("Rebooting {}", self.destination));
        if let Err(error) = self.run_command("reboot", REBOOT_TIMEOUT).await {
            debug!(%error, "reboot request did not complete (expected)");
        }
    }

    /// Opens a reverse forward from an ephemeral port on the target to
    /// `local_addr` on the host side. Returns the forward with the address
    /// the DUT should dial.
    pub async fn open_reverse_forward(
        &self,
        kind: ForwardKind,
        local_addr: &str,
    ) -> Result<Forward, ForwardError> {
        let spec = format!("0:{local_addr}");
        let output = control_command(&self.control_path, &self.destination, "forward")
            .args(["-R", &spec])
            .output()
            .await
            .map_err(|error| ForwardError::Establish {
                kind,
                spec: spec.clone(),
                error,
            })?;
        if !output.status.success() {
            return Err(ForwardError::Establish {
                kind,
                spec,
                error: std::io::Error::other(
                    String::from_utf8_lossy(&output.stderr).trim().to_owned(),
                ),
            });
        }

        // The mux client prints the allocated remote port on stdout.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let port = stdout
            .split_whitespace()
            .find_map(|token| token.parse::<u16>().ok())
            .ok_or(ForwardError::NoAllocatedPort { spec: spec.clone() })?;

        debug!(?kind, port, %local_addr, "reverse forward established");
        Ok(Forward::new(
            kind,
            format!("127.0.0.1:{port}"),
            format!("{port}:{local_addr}"),
        ))
    }

    /// Cancels a reverse forward. Errors are ignored: the forward dies with
    /// the master anyway.
    pub(crate) async fn cancel_reverse_forward(&self, cancel_spec: &str) {
        let res = control_command(&self.control_path, &self.destination, "cancel")
            .args(["-R", cancel_spec])
            .output()
            .await;
        if let Err(error) = res {
            debug!(%error, cancel_spec, "failed to cancel forward");
        }
    }

    /// Copies the tree rooted at `remote_dir` on the target into `local_dir`.
    pub async fn copy_tree_from(
        &self,
        remote_dir: &str,
        local_dir: &Utf8Path,
    ) -> Result<(), ConnectionError> {
        let command = format!("tar -C {remote_dir} -cf - .");
        let output = self.run_command(&command, COPY_TIMEOUT).await?;
        if !output.status.success() {
            return Err(ConnectionError::CommandFailed {
                command,
                status: output.status,
            });
        }

        let local_dir = local_dir.to_owned();
        let data = output.stdout;
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&local_dir)?;
            tar::Archive::new(Cursor::new(data)).unpack(&local_dir)
        })
        .await
        .expect("unpack task does not panic")
        .map_err(|error| ConnectionError::Command { command, error })?;
        Ok(())
    }

    /// Deletes the tree rooted at `remote_dir` on the target.
    pub async fn remove_remote_tree(&self, remote_dir: &str) -> Result<(), ConnectionError> {
        self.check_output(&format!("rm -rf {remote_dir}"), CONTROL_OP_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Closes the session, tearing down the control master. Forward children
    /// die with the master (LIFO release is handled by
    /// [`ForwardSet::close`](crate::target::ForwardSet::close) before this is
    /// called). Idempotent: closing a closed session is a no-op.
    pub async fn close(&self) {
        let res = control_command(&self.control_path, &self.destination, "exit")
            .output()
            .await;
        if let Err(error) = res {
            debug!(%error, "ssh -O exit failed; killing master");
        }
        // Give the master a moment to exit cleanly, then make sure.
        let mut master = self.master.lock().await;
        let _ = tokio::time::timeout(CONTROL_OP_TIMEOUT, master.wait()).await;
        let _ = master.start_kill();
    }
}

fn control_command(control_path: &str, destination: &str, op: &str) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.args(["-S", control_path])
        .args(["-O", op])
        .args(["-o", "BatchMode=yes"])
        .arg(destination)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}
