// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core engine for tast, a system-integration test harness.
//!
//! The host-side driver dispatches a suite of tests to a remote device
//! under test over SSH, supervises the remote test bundle end to end,
//! multiplexes its structured event stream into per-test artifacts, and
//! forwards results to an upstream progress sink over gRPC.
//!
//! The major pieces, in data-flow order:
//!
//! - [`target`] — the connection cache, SSH sessions, and port forwards.
//! - [`fixture`] — the fixture registry and the green/yellow/red stack.
//! - [`bundle`] — launching and supervising the remote bundle process.
//! - [`events`] — the typed event stream the bundle produces.
//! - [`processor`] — the handler pipeline consuming that stream.
//! - [`retry`] — the retry / fail-fast coordinator.
//! - [`reports`] — the gRPC reports server and progress-sink bridge.
//! - [`driver`] — end-to-end orchestration of a run.

#![warn(missing_docs)]

pub mod bundle;
pub mod cancel;
pub mod config;
pub mod driver;
pub mod errors;
pub mod events;
pub mod fixture;
pub mod logging;
pub mod processor;
pub mod reports;
pub mod results;
pub mod retry;
pub mod target;
mod time;
