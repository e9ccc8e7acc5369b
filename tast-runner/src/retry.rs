// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The retry / fail-fast coordinator.
//!
//! The coordinator owns the outer loop of a run: it hands the current batch
//! of tests to a runner function, inspects what came back, re-queues
//! failures that still have retry budget, and stops early once the shared
//! failure threshold trips.

use crate::{
    errors::{NoTestRanInLastAttempt, RunFailure},
    events::TestMetadata,
    results::TestResult,
};
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use tracing::debug;

/// Shared failure accounting for fail-fast.
///
/// The fail-fast handler increments it as tests fail; the coordinator and
/// the bundle loop observe it between events and stop starting new work once
/// it trips. The reports server trips it directly when the upstream sink
/// says to terminate.
#[derive(Debug)]
pub struct MaxFailTracker {
    /// The configured threshold; 0 disables the feature.
    threshold: usize,
    failures: AtomicUsize,
    tripped: AtomicBool,
}

impl MaxFailTracker {
    /// Creates a tracker with the given threshold. 0 disables fail-fast.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            failures: AtomicUsize::new(0),
            tripped: AtomicBool::new(false),
        }
    }

    /// The configured threshold.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// The number of failures recorded so far.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    /// Records one test failure and returns the new count.
    pub fn record_failure(&self) -> usize {
        self.failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Forces the tracker into the exceeded state, regardless of counts.
    pub fn trip(&self) {
        self.tripped.store(true, Ordering::SeqCst);
    }

    /// Returns true once the run should stop starting new tests.
    pub fn exceeded(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
            || (self.threshold > 0 && self.failures() >= self.threshold)
    }
}

/// What one runner invocation produced.
#[derive(Debug, Default)]
pub struct OnceOutcome {
    /// Results for the tests that ran (including synthesized failures for
    /// tests that never reported an end).
    pub results: Vec<TestResult>,

    /// A run-level failure, if the invocation died. Partial results above
    /// are still kept.
    pub error: Option<RunFailure>,
}

/// The coordinator's final answer.
#[derive(Debug)]
pub struct RetryOutcome {
    /// One final result per test that produced any, in requested order.
    /// For retried tests, the last attempt wins.
    pub results: Vec<TestResult>,

    /// The fatal reason, if the run ended early.
    pub fatal: Option<RunFailure>,

    /// How many tests needed more than one attempt.
    pub retried: usize,
}

/// One invocation of the runner over a batch of tests.
///
/// The driver implements this over a live connection; tests substitute
/// scripted runners.
#[async_trait]
pub trait OnceRunner: Send {
    /// Runs one batch, returning whatever results it produced.
    async fn run_once(&mut self, tests: Vec<TestMetadata>) -> OnceOutcome;
}

/// Runs `runner` over `tests` until every test is finalized, re-queueing
/// failed tests up to `retry_budget` extra attempts each.
///
/// Every requested test appears at most once in the returned result list;
/// tests that never got to run (fail-fast) are absent and counted as missing
/// by the summary.
pub async fn run_tests_with_retries(
    tests: &[TestMetadata],
    retry_budget: usize,
    tracker: &MaxFailTracker,
    runner: &mut dyn OnceRunner,
) -> Result<RetryOutcome, NoTestRanInLastAttempt> {
    let mut remaining: Vec<TestMetadata> = tests.to_vec();
    let mut budgets: BTreeMap<String, usize> = tests
        .iter()
        .map(|t| (t.name.clone(), retry_budget))
        .collect();
    let mut finalized: BTreeSet<String> = BTreeSet::new();
    let mut retried: BTreeSet<String> = BTreeSet::new();
    let mut final_results: BTreeMap<String, TestResult> = BTreeMap::new();

    let fatal = loop {
        if tracker.exceeded() {
            break Some(RunFailure::MaxFailReached {
                threshold: tracker.threshold(),
            });
        }
        if remaining.is_empty() {
            break None;
        }

        let outcome = runner.run_once(remaining.clone()).await;
        let had_error = outcome.error.is_some();

        if outcome.results.is_empty() && !had_error {
            // An attempt that runs nothing would loop forever.
            return Err(NoTestRanInLastAttempt);
        }

        for result in outcome.results {
            let name = result.test.name.clone();
            let failed = result.failed();
            if final_results.insert(name.clone(), result).is_some() {
                retried.insert(name.clone());
            }

            if had_error {
                // Partial results are appended but nothing is re-queued; the
                // invocation error ends the run.
                continue;
            }

            let budget = budgets.entry(name.clone()).or_insert(0);
            if failed && *budget > 0 {
                *budget -= 1;
                retried.insert(name.clone());
                debug!(test = %name, remaining_budget = *budget, "re-queueing failed test");
            } else {
                finalized.insert(name);
            }
        }

        if had_error {
            break outcome.error;
        }

        remaining.retain(|t| !finalized.contains(&t.name));
    };

    // Requested order, last attempt wins.
    let results = tests
        .iter()
        .filter_map(|t| final_results.remove(&t.name))
        .collect();

    Ok(RetryOutcome {
        results,
        fatal,
        retried: retried.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::BundleError, events::ErrorReport};
    use camino::Utf8PathBuf;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn meta(name: &str) -> TestMetadata {
        TestMetadata::named(name)
    }

    fn result(name: &str, failed: bool) -> TestResult {
        let time = Utc::now();
        TestResult {
            test: meta(name),
            start_time: time,
            end_time: time,
            errors: if failed {
                vec![ErrorReport::new(time, "boom")]
            } else {
                vec![]
            },
            skip_reason: None,
            out_dir: Utf8PathBuf::from("/out"),
            log_path: Utf8PathBuf::from("/out/log.txt"),
        }
    }

    /// A runner whose behavior per attempt is scripted by a function of the
    /// (1-based) attempt number and the batch.
    struct ScriptedRunner<F> {
        attempts: usize,
        script: F,
    }

    impl<F> ScriptedRunner<F>
    where
        F: FnMut(usize, &[TestMetadata]) -> OnceOutcome + Send,
    {
        fn new(script: F) -> Self {
            Self {
                attempts: 0,
                script,
            }
        }
    }

    #[async_trait]
    impl<F> OnceRunner for ScriptedRunner<F>
    where
        F: FnMut(usize, &[TestMetadata]) -> OnceOutcome + Send,
    {
        async fn run_once(&mut self, tests: Vec<TestMetadata>) -> OnceOutcome {
            self.attempts += 1;
            (self.script)(self.attempts, &tests)
        }
    }

    #[tokio::test]
    async fn green_path_runs_once() {
        let tracker = MaxFailTracker::new(0);
        let mut runner = ScriptedRunner::new(|_attempt, batch: &[TestMetadata]| OnceOutcome {
            results: batch.iter().map(|t| result(&t.name, false)).collect(),
            error: None,
        });

        let outcome =
            run_tests_with_retries(&[meta("a.A"), meta("a.B")], 1, &tracker, &mut runner)
                .await
                .unwrap();

        assert_eq!(runner.attempts, 1);
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.retried, 0);
        assert!(outcome.fatal.is_none());
    }

    #[tokio::test]
    async fn failed_test_is_retried_and_second_attempt_wins() {
        let tracker = MaxFailTracker::new(0);
        let mut runner = ScriptedRunner::new(|attempt, batch: &[TestMetadata]| {
            assert_eq!(batch.len(), 1);
            OnceOutcome {
                results: vec![result("a.A", attempt == 1)],
                error: None,
            }
        });

        let outcome = run_tests_with_retries(&[meta("a.A")], 1, &tracker, &mut runner)
            .await
            .unwrap();

        assert_eq!(runner.attempts, 2);
        assert_eq!(outcome.results.len(), 1, "exactly one final record");
        assert!(outcome.results[0].passed(), "second attempt wins");
        assert_eq!(outcome.retried, 1);
    }

    #[tokio::test]
    async fn exhausted_budget_finalizes_the_failure() {
        let tracker = MaxFailTracker::new(0);
        let mut runner = ScriptedRunner::new(|_attempt, _batch: &[TestMetadata]| OnceOutcome {
            results: vec![result("a.A", true)],
            error: None,
        });

        let outcome = run_tests_with_retries(&[meta("a.A")], 1, &tracker, &mut runner)
            .await
            .unwrap();

        assert_eq!(runner.attempts, 2, "one retry was attempted");
        assert_eq!(outcome.results.len(), 1);
        assert!(outcome.results[0].failed());
        assert_eq!(outcome.retried, 1);
    }

    #[tokio::test]
    async fn empty_attempt_is_an_error() {
        let tracker = MaxFailTracker::new(0);
        let mut runner =
            ScriptedRunner::new(|_attempt, _batch: &[TestMetadata]| OnceOutcome::default());
        let err = run_tests_with_retries(&[meta("a.A")], 0, &tracker, &mut runner)
            .await
            .unwrap_err();
        assert_eq!(err, NoTestRanInLastAttempt);
    }

    #[tokio::test]
    async fn invocation_error_keeps_partial_results() {
        let tracker = MaxFailTracker::new(0);
        let mut runner = ScriptedRunner::new(|_attempt, _batch: &[TestMetadata]| OnceOutcome {
            results: vec![result("a.A", true)],
            error: Some(RunFailure::Bundle(BundleError::StdinWrite(
                std::io::Error::other("pipe closed"),
            ))),
        });

        let outcome =
            run_tests_with_retries(&[meta("a.A"), meta("a.B")], 3, &tracker, &mut runner)
                .await
                .unwrap();

        assert_eq!(runner.attempts, 1, "no retry after an invocation error");
        assert_eq!(outcome.results.len(), 1, "partial results are kept");
        assert!(
            matches!(outcome.fatal, Some(RunFailure::Bundle(_))),
            "the invocation error is the fatal reason"
        );
    }

    #[tokio::test]
    async fn tripped_tracker_short_circuits() {
        let tracker = MaxFailTracker::new(1);
        let mut runner = ScriptedRunner::new(|_attempt, batch: &[TestMetadata]| {
            // Fail-fast stopped the bundle after the first failure.
            tracker.record_failure();
            OnceOutcome {
                results: vec![result(&batch[0].name, true)],
                error: None,
            }
        });

        let outcome =
            run_tests_with_retries(&[meta("a.A"), meta("a.B")], 1, &tracker, &mut runner)
                .await
                .unwrap();

        assert_eq!(runner.attempts, 1, "no second invocation");
        assert_eq!(outcome.results.len(), 1);
        assert!(
            matches!(
                outcome.fatal,
                Some(RunFailure::MaxFailReached { threshold: 1 })
            ),
            "got {:?}",
            outcome.fatal
        );
    }

    #[test]
    fn threshold_zero_disables_fail_fast() {
        let tracker = MaxFailTracker::new(0);
        tracker.record_failure();
        tracker.record_failure();
        assert!(!tracker.exceeded());

        let tracker = MaxFailTracker::new(1);
        assert!(!tracker.exceeded());
        tracker.record_failure();
        assert!(tracker.exceeded());
    }

    #[test]
    fn upstream_terminate_trips_the_tracker() {
        let tracker = MaxFailTracker::new(0);
        assert!(!tracker.exceeded());
        tracker.trip();
        assert!(tracker.exceeded());
    }
}
