// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The `tast` command-line driver.

#![warn(missing_docs)]

mod dispatch;
mod output;

pub use dispatch::*;
