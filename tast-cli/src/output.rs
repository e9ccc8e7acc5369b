// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use itertools::Itertools;
use std::io::Write;
use tast_runner::{driver::RunReport, results::TestResult};

fn verdict(result: &TestResult) -> &'static str {
    if result.skipped() {
        "SKIP"
    } else if result.failed() {
        "FAIL"
    } else {
        "PASS"
    }
}

/// Prints the end-of-run summary: per-test verdicts, retry and missing
/// counts, and the fatal reason if the run ended early.
pub(crate) fn print_summary(writer: &mut impl Write, report: &RunReport) -> std::io::Result<()> {
    let name_width = report
        .results
        .iter()
        .map(|r| r.test.name.len())
        .max()
        .unwrap_or(0);

    for result in &report.results {
        let elapsed = (result.end_time - result.start_time)
            .to_std()
            .unwrap_or_default();
        writeln!(
            writer,
            "{:<name_width$}  {}  [{}]",
            result.test.name,
            verdict(result),
            humantime::format_duration(elapsed),
        )?;
        for error in &result.errors {
            writeln!(writer, "{:<name_width$}    {}", "", error.reason)?;
        }
    }

    let summary = &report.summary;
    let mut counts = vec![
        format!("{} passed", summary.passed),
        format!("{} failed", summary.failed),
    ];
    if summary.skipped > 0 {
        counts.push(format!("{} skipped", summary.skipped));
    }
    if summary.retried > 0 {
        counts.push(format!("{} retried", summary.retried));
    }
    if summary.missing > 0 {
        counts.push(format!("{} missing", summary.missing));
    }
    writeln!(
        writer,
        "\n{} in {}",
        counts.iter().join(", "),
        humantime::format_duration(report.elapsed),
    )?;

    if let Some(fatal) = &report.fatal {
        writeln!(writer, "Run ended early: {fatal}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tast_runner::{
        events::{ErrorReport, TestMetadata},
        results::RunSummary,
    };

    #[test]
    fn summary_lists_verdicts_and_counts() {
        let time = chrono::Utc::now();
        let results = vec![
            TestResult {
                test: TestMetadata::named("example.Pass"),
                start_time: time,
                end_time: time,
                errors: vec![],
                skip_reason: None,
                out_dir: "/out".into(),
                log_path: "/out/log.txt".into(),
            },
            TestResult {
                test: TestMetadata::named("example.Fail"),
                start_time: time,
                end_time: time,
                errors: vec![ErrorReport::new(time, "boom")],
                skip_reason: None,
                out_dir: "/out".into(),
                log_path: "/out/log.txt".into(),
            },
        ];
        let report = RunReport {
            run_id: tast_runner::results::RunUuid::new_v4(),
            summary: RunSummary::compute(
                &["example.Pass".into(), "example.Fail".into()],
                &results,
                0,
            ),
            results,
            elapsed: std::time::Duration::from_secs(5),
            fatal: None,
        };

        let mut out = Vec::new();
        print_summary(&mut out, &report).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("example.Pass  PASS"), "{out}");
        assert!(out.contains("example.Fail  FAIL"), "{out}");
        assert!(out.contains("1 passed, 1 failed"), "{out}");
    }
}
