// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Time measurement utilities for the runner.

mod stall;
mod stopwatch;

pub(crate) use stall::*;
pub(crate) use stopwatch::*;
