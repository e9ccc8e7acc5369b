// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Protocol buffer definitions for tast.
//!
//! This crate contains:
//! - The `Reports` service served by the host-side driver and called by the
//!   test bundle on the DUT (`proto/reports.proto`).
//! - The upstream `ProgressSink` service the driver forwards results to
//!   (`proto/progress.proto`).
//!
//! The proto types are kept separate from the runner's domain types to avoid
//! transport-layer coupling in engine code and to provide a clear boundary
//! for type conversions.

#![allow(missing_docs)] // Generated code doesn't have docs

/// Generated types for the bundle-facing reports service.
pub mod reports {
    tonic::include_proto!("tast.reports");
}

/// Generated types for the upstream progress sink.
pub mod progress {
    tonic::include_proto!("tast.progress");
}
