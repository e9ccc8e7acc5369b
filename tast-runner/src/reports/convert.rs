// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Conversions between runner domain types and the progress-sink schema.

use crate::results::TestResult;
use chrono::{DateTime, Utc};
use tast_proto::{
    progress::{ErrorSeverity, ProgressError, ProgressResult, ResultState},
    reports::ReportResultRequest,
};

/// Converts a wall-clock time to a protobuf timestamp.
pub fn to_timestamp(time: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: time.timestamp(),
        nanos: time.timestamp_subsec_nanos() as i32,
    }
}

/// Converts a non-negative duration to a protobuf duration.
pub fn to_duration(duration: std::time::Duration) -> prost_types::Duration {
    prost_types::Duration {
        seconds: duration.as_secs() as i64,
        nanos: duration.subsec_nanos() as i32,
    }
}

/// Translates a host-side completed test into the upstream result schema:
/// succeeded (no errors, no skip), failed (errors present), or skipped
/// (skip reason set).
pub fn test_result_to_progress(result: &TestResult) -> ProgressResult {
    let state = if result.skipped() {
        ResultState::Skipped
    } else if result.failed() {
        ResultState::Failed
    } else {
        ResultState::Succeeded
    };

    let errors = result
        .errors
        .iter()
        .map(|error| ProgressError {
            time: Some(to_timestamp(error.time)),
            reason: error.reason.clone(),
            file: error.file.clone(),
            line: error.line as i32,
            stack: error.stack.clone(),
            severity: ErrorSeverity::Critical as i32,
        })
        .collect();

    let duration = (result.end_time - result.start_time)
        .to_std()
        .unwrap_or_default();

    ProgressResult {
        state: state as i32,
        errors,
        skip_reason: result.skip_reason.clone().unwrap_or_default(),
        start_time: Some(to_timestamp(result.start_time)),
        duration: Some(to_duration(duration)),
    }
}

/// Translates a result reported directly by the bundle into the upstream
/// schema.
pub fn bundle_report_to_progress(report: &ReportResultRequest) -> ProgressResult {
    let state = if !report.skip_reason.is_empty() {
        ResultState::Skipped
    } else if !report.errors.is_empty() {
        ResultState::Failed
    } else {
        ResultState::Succeeded
    };

    let errors = report
        .errors
        .iter()
        .map(|error| ProgressError {
            time: error.time.clone(),
            reason: error.reason.clone(),
            file: error.file.clone(),
            line: error.line,
            stack: error.stack.clone(),
            severity: ErrorSeverity::Critical as i32,
        })
        .collect();

    ProgressResult {
        state: state as i32,
        errors,
        skip_reason: report.skip_reason.clone(),
        start_time: report.start_time.clone(),
        duration: report.duration.clone(),
    }
}
