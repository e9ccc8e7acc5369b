// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The logging handler: one well-ordered log file per entity.

use crate::{
    errors::HandlerError,
    events::ErrorReport,
    processor::{EntityState, Handler, HandlerContext},
    results::TestResult,
};
use async_trait::async_trait;
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Write,
};

/// Writes every entity's log lines into its own `log.txt`, created on the
/// entity's start, plus a run-scoped `run.log`.
///
/// Owns each file from start to end; nothing else writes to them.
#[derive(Debug, Default)]
pub struct LoggingHandler {
    files: BTreeMap<String, File>,
    run_log: Option<File>,
}

impl LoggingHandler {
    /// Creates the handler. Files are created lazily as entities start.
    pub fn new() -> Self {
        Self::default()
    }

    fn run_log_file(&mut self, cx: &HandlerContext) -> Result<&mut File, HandlerError> {
        if self.run_log.is_none() {
            fs::create_dir_all(&cx.results_dir)?;
            let file = File::options()
                .create(true)
                .append(true)
                .open(cx.results_dir.join("run.log"))?;
            self.run_log = Some(file);
        }
        Ok(self.run_log.as_mut().expect("just created"))
    }
}

fn format_line(time: DateTime<Utc>, text: &str) -> String {
    format!("{} {text}\n", time.format("%Y-%m-%dT%H:%M:%S%.3fZ"))
}

fn format_error(error: &ErrorReport) -> String {
    if error.file.is_empty() {
        format!("Error: {}", error.reason)
    } else {
        format!("Error at {}:{}: {}", error.file, error.line, error.reason)
    }
}

#[async_trait]
impl Handler for LoggingHandler {
    async fn run_log(
        &mut self,
        cx: &HandlerContext,
        time: DateTime<Utc>,
        text: &str,
    ) -> Result<(), HandlerError> {
        cx.logger.info(text);
        let file = self.run_log_file(cx)?;
        file.write_all(format_line(time, text).as_bytes())?;
        Ok(())
    }

    async fn run_error(
        &mut self,
        cx: &HandlerContext,
        error: &ErrorReport,
    ) -> Result<(), HandlerError> {
        cx.logger.info(format_error(error));
        let line = format_line(error.time, &format_error(error));
        let file = self.run_log_file(cx)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    async fn run_end(
        &mut self,
        _cx: &HandlerContext,
        _log_dir: &Utf8Path,
        _out_dir: &Utf8Path,
    ) -> Result<(), HandlerError> {
        if let Some(file) = &mut self.run_log {
            file.flush()?;
        }
        Ok(())
    }

    async fn entity_start(
        &mut self,
        cx: &HandlerContext,
        entity: &EntityState,
    ) -> Result<(), HandlerError> {
        cx.logger.info(format!("Started {}", entity.name));
        fs::create_dir_all(&entity.out_dir)?;
        let mut file = File::create(&entity.log_path)?;
        file.write_all(format_line(entity.start_time, &format!("Started {}", entity.name)).as_bytes())?;
        self.files.insert(entity.name.clone(), file);
        Ok(())
    }

    async fn entity_log(
        &mut self,
        cx: &HandlerContext,
        entity: &EntityState,
        time: DateTime<Utc>,
        text: &str,
    ) -> Result<(), HandlerError> {
        cx.logger.debug(format!("[{}] {text}", entity.name));
        let file = self
            .files
            .get_mut(&entity.name)
            .ok_or_else(|| HandlerError::new(format!("no log file open for `{}`", entity.name)))?;
        file.write_all(format_line(time, text).as_bytes())?;
        Ok(())
    }

    async fn entity_error(
        &mut self,
        cx: &HandlerContext,
        entity: &EntityState,
        error: &ErrorReport,
    ) -> Result<(), HandlerError> {
        cx.logger.info(format!("[{}] {}", entity.name, format_error(error)));
        let file = self
            .files
            .get_mut(&entity.name)
            .ok_or_else(|| HandlerError::new(format!("no log file open for `{}`", entity.name)))?;
        file.write_all(format_line(error.time, &format_error(error)).as_bytes())?;
        Ok(())
    }

    async fn entity_end(
        &mut self,
        cx: &HandlerContext,
        entity: &EntityState,
        result: Option<&TestResult>,
    ) -> Result<(), HandlerError> {
        let verdict = match result {
            Some(result) if result.skipped() => "skipped",
            Some(result) if result.failed() => "failed",
            Some(_) => "passed",
            None => "finished",
        };
        cx.logger.info(format!("{} {verdict}", entity.name));
        let mut file = self
            .files
            .remove(&entity.name)
            .ok_or_else(|| HandlerError::new(format!("no log file open for `{}`", entity.name)))?;
        let end_time = result.map_or_else(Utc::now, |r| r.end_time);
        file.write_all(format_line(end_time, &format!("Completed {}", entity.name)).as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::{Event, TestMetadata},
        logging::Logger,
        processor::EventProcessor,
    };
    use camino_tempfile::Utf8TempDir;

    #[tokio::test]
    async fn per_test_log_file_holds_its_lines() {
        let dir = Utf8TempDir::new().unwrap();
        let mut processor = EventProcessor::new(dir.path().to_owned(), Logger::none());
        processor.add_handler(Box::new(LoggingHandler::new()));

        let t = Utc::now();
        for event in [
            Event::RunStart {
                time: t,
                num_tests: 1,
            },
            Event::TestStart {
                time: t,
                test: TestMetadata::named("example.Pass"),
            },
            Event::TestLog {
                time: t,
                name: "example.Pass".into(),
                text: "ok".into(),
            },
            Event::TestEnd {
                time: t,
                name: "example.Pass".into(),
                skip_reasons: vec![],
            },
            Event::RunEnd {
                time: t,
                log_dir: "/l".into(),
                out_dir: "/o".into(),
            },
        ] {
            processor.process(event).await.unwrap();
        }

        let log = std::fs::read_to_string(
            dir.path().join("tests").join("example.Pass").join("log.txt"),
        )
        .unwrap();
        assert!(log.contains("ok"), "log contains the test's line: {log}");
        let lines: Vec<_> = log.lines().collect();
        assert!(lines.first().unwrap().contains("Started example.Pass"));
        assert!(lines.last().unwrap().contains("Completed example.Pass"));
    }

    #[tokio::test]
    async fn run_log_collects_run_lines() {
        let dir = Utf8TempDir::new().unwrap();
        let mut processor = EventProcessor::new(dir.path().to_owned(), Logger::none());
        processor.add_handler(Box::new(LoggingHandler::new()));

        processor
            .process(Event::RunLog {
                time: Utc::now(),
                text: "Devserver ready".into(),
            })
            .await
            .unwrap();

        let log = std::fs::read_to_string(dir.path().join("run.log")).unwrap();
        assert!(log.contains("Devserver ready"));
    }
}
