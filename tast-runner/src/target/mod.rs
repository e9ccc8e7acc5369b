// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Connectivity to the device under test.
//!
//! [`SshSession`] owns one multiplexed SSH connection and its port-forward
//! children; [`ConnectionCache`] keeps at most one healthy session alive for
//! the run, recovering it by reconnect or reboot when it goes bad.

mod conn_cache;
mod endpoint;
mod forward;
mod ssh;

pub use conn_cache::*;
pub use endpoint::*;
pub use forward::*;
pub use ssh::*;
