// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-test results and the on-disk result formats.
//!
//! A run produces `<resultsDir>/results.json` (an array of [`TestResult`]
//! records, written once at the end) and
//! `<resultsDir>/streamed_results.jsonl` (one record per line, appended as
//! each test completes, so partial results survive a crash and a rerun can
//! resume).

use crate::{
    errors::ProcessorError,
    events::{ErrorReport, TestMetadata},
};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use newtype_uuid::{TypedUuid, TypedUuidKind, TypedUuidTag};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Write},
};

/// Tag for run identifiers.
pub enum RunUuidKind {}

impl TypedUuidKind for RunUuidKind {
    fn tag() -> TypedUuidTag {
        const TAG: TypedUuidTag = TypedUuidTag::new("tast-run");
        TAG
    }
}

/// A unique identifier for one run, stamped into logs and reports.
pub type RunUuid = TypedUuid<RunUuidKind>;

/// The name of the final result file within the results dir.
pub const RESULTS_FILE: &str = "results.json";

/// The name of the streamed result file within the results dir.
pub const STREAMED_RESULTS_FILE: &str = "streamed_results.jsonl";

/// The subdirectory of the results dir holding per-test output.
pub const TESTS_DIR: &str = "tests";

/// The subdirectory of the results dir holding the DUT's system logs.
pub const SYSTEM_LOGS_DIR: &str = "system_logs";

/// The result of one test's execution.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TestResult {
    /// The test this result belongs to.
    #[serde(flatten)]
    pub test: TestMetadata,

    /// When the test started.
    pub start_time: DateTime<Utc>,

    /// When the test ended.
    pub end_time: DateTime<Utc>,

    /// Errors attached to the test. Empty for a passing test.
    #[serde(default)]
    pub errors: Vec<ErrorReport>,

    /// Why the test was skipped, if it was.
    #[serde(default)]
    pub skip_reason: Option<String>,

    /// The local directory holding the test's output artifacts.
    pub out_dir: Utf8PathBuf,

    /// The test's log file.
    pub log_path: Utf8PathBuf,
}

impl TestResult {
    /// Returns true if the test ran and produced no errors.
    pub fn passed(&self) -> bool {
        self.errors.is_empty() && self.skip_reason.is_none()
    }

    /// Returns true if the test was skipped.
    pub fn skipped(&self) -> bool {
        self.skip_reason.is_some()
    }

    /// Returns true if the test failed.
    pub fn failed(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Returns the per-test output directory under `results_dir`.
pub fn test_out_dir(results_dir: &Utf8Path, test_name: &str) -> Utf8PathBuf {
    results_dir.join(TESTS_DIR).join(test_name)
}

/// Returns the per-test log file path under `results_dir`.
pub fn test_log_path(results_dir: &Utf8Path, test_name: &str) -> Utf8PathBuf {
    test_out_dir(results_dir, test_name).join("log.txt")
}

/// Writes the consolidated `results.json` for a run.
pub fn write_results_json(
    results_dir: &Utf8Path,
    results: &[TestResult],
) -> Result<(), ProcessorError> {
    let path = results_dir.join(RESULTS_FILE);
    let write = || -> std::io::Result<()> {
        let mut file = File::create(&path)?;
        serde_json::to_writer_pretty(&mut file, results)?;
        file.write_all(b"\n")?;
        Ok(())
    };
    write().map_err(|error| ProcessorError::WriteResults {
        path: path.clone(),
        error,
    })
}

/// Appends one [`TestResult`] per line to `streamed_results.jsonl`.
///
/// Opening the writer reads any existing file so a resumed run knows which
/// tests were already recorded and appends after them.
#[derive(Debug)]
pub struct StreamedResultsWriter {
    path: Utf8PathBuf,
    file: File,
    recorded: BTreeSet<String>,
}

impl StreamedResultsWriter {
    /// Opens (or creates) the streamed result file under `results_dir`.
    pub fn open(results_dir: &Utf8Path) -> Result<Self, ProcessorError> {
        let path = results_dir.join(STREAMED_RESULTS_FILE);
        let open = || -> std::io::Result<(File, BTreeSet<String>)> {
            let mut recorded = BTreeSet::new();
            if path.exists() {
                let reader = BufReader::new(File::open(&path)?);
                for line in reader.lines() {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Ok(result) = serde_json::from_str::<TestResult>(&line) {
                        recorded.insert(result.test.name);
                    }
                }
            }
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            Ok((file, recorded))
        };
        let (file, recorded) = open().map_err(|error| ProcessorError::WriteResults {
            path: path.clone(),
            error,
        })?;
        Ok(Self {
            path,
            file,
            recorded,
        })
    }

    /// Returns the set of test names already present in the file.
    pub fn recorded(&self) -> &BTreeSet<String> {
        &self.recorded
    }

    /// Appends one result record. Later records for the same test replace
    /// earlier ones on read (last record wins), matching retry semantics.
    pub fn append(&mut self, result: &TestResult) -> Result<(), ProcessorError> {
        let mut write = || -> std::io::Result<()> {
            let mut line = serde_json::to_vec(result)?;
            line.push(b'\n');
            self.file.write_all(&line)?;
            self.file.flush()
        };
        write().map_err(|error| ProcessorError::WriteResults {
            path: self.path.clone(),
            error,
        })?;
        self.recorded.insert(result.test.name.clone());
        Ok(())
    }
}

/// End-of-run statistics shown to the user.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunSummary {
    /// Tests that passed.
    pub passed: usize,
    /// Tests that failed.
    pub failed: usize,
    /// Tests that were skipped.
    pub skipped: usize,
    /// Tests that were retried at least once.
    pub retried: usize,
    /// Requested tests that never reported a result.
    pub missing: usize,
}

impl RunSummary {
    /// Computes a summary over final results.
    ///
    /// `requested` is the set of test names that were supposed to run;
    /// `retried` the count of tests that needed more than one attempt.
    pub fn compute(requested: &[String], results: &[TestResult], retried: usize) -> Self {
        let seen: BTreeSet<&str> = results.iter().map(|r| r.test.name.as_str()).collect();
        let missing = requested
            .iter()
            .filter(|name| !seen.contains(name.as_str()))
            .count();
        let mut summary = RunSummary {
            retried,
            missing,
            ..RunSummary::default()
        };
        for result in results {
            if result.skipped() {
                summary.skipped += 1;
            } else if result.failed() {
                summary.failed += 1;
            } else {
                summary.passed += 1;
            }
        }
        summary
    }

    /// Returns true if the run should exit with a failure code.
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.missing > 0
    }
}
