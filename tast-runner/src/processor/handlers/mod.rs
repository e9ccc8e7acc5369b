// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The standard handler set for the processing pipeline.
//!
//! Handlers are installed in a fixed order: logging first (so every later
//! failure is at least logged), timing, streamed results, RPC forwarding,
//! fail-fast accounting, output copying, and stack-operation mediation last.

mod copy_output;
mod fail_fast;
mod logging;
mod rpc_results;
mod stack_ops;
mod streamed;
mod timing;

pub use copy_output::*;
pub use fail_fast::*;
pub use logging::*;
pub use rpc_results::*;
pub use stack_ops::*;
pub use streamed::*;
pub use timing::*;
