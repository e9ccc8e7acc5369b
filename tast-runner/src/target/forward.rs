// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Port forwards exposing host-side services to the target.
//!
//! Each service gets a reverse forward: an ephemeral port on the DUT that
//! tunnels back to a host-side address. The set closes LIFO and
//! idempotently; a forward that dies takes its session's health with it, so
//! the next `ensure_healthy` call replaces the whole connection.

use crate::{
    config::ServiceConfig,
    errors::ForwardError,
    target::SshSession,
};

/// Which service a forward belongs to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ForwardKind {
    /// The upstream TLW test-resource server.
    Tlw,
    /// The DUT server.
    DutServer,
    /// The ephemeral cache server.
    EphemeralCache,
    /// The host's reports server.
    Reports,
}

/// One established reverse forward.
#[derive(Clone, Debug)]
pub struct Forward {
    kind: ForwardKind,
    dut_addr: String,
    cancel_spec: String,
}

impl Forward {
    pub(crate) fn new(kind: ForwardKind, dut_addr: String, cancel_spec: String) -> Self {
        Self {
            kind,
            dut_addr,
            cancel_spec,
        }
    }

    /// Which service this forward belongs to.
    pub fn kind(&self) -> ForwardKind {
        self.kind
    }

    /// The address the DUT should dial to reach the service.
    pub fn dut_addr(&self) -> &str {
        &self.dut_addr
    }
}

/// The set of forwards backing one bundle invocation.
#[derive(Debug, Default)]
pub struct ForwardSet {
    forwards: Vec<Forward>,
    closed: bool,
}

impl ForwardSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Establishes a reverse forward for `kind` pointing at `local_addr` and
    /// records it for teardown.
    pub async fn establish(
        &mut self,
        session: &SshSession,
        kind: ForwardKind,
        local_addr: &str,
    ) -> Result<&Forward, ForwardError> {
        let forward = session.open_reverse_forward(kind, local_addr).await?;
        self.forwards.push(forward);
        Ok(self.forwards.last().expect("just pushed"))
    }

    /// Returns the forward for `kind`, if one is active.
    pub fn get(&self, kind: ForwardKind) -> Option<&Forward> {
        self.forwards.iter().find(|f| f.kind() == kind)
    }

    /// Builds the service config handed to the bundle, from whichever
    /// forwards are active.
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            tlw_addr: self.get(ForwardKind::Tlw).map(|f| f.dut_addr().to_owned()),
            dut_server_addr: self
                .get(ForwardKind::DutServer)
                .map(|f| f.dut_addr().to_owned()),
            cache_addr: self
                .get(ForwardKind::EphemeralCache)
                .map(|f| f.dut_addr().to_owned()),
            reports_addr: self
                .get(ForwardKind::Reports)
                .map(|f| f.dut_addr().to_owned()),
        }
    }

    /// Releases all forwards in LIFO order. Calling this more than once is a
    /// no-op.
    pub async fn close(&mut self, session: &SshSession) {
        if self.closed {
            return;
        }
        self.closed = true;
        for forward in self.forwards.drain(..).rev() {
            session.cancel_reverse_forward(&forward.cancel_spec).await;
        }
    }
}
