// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The streamed-results handler: one JSONL record per completed test.

use crate::{
    errors::{HandlerError, ProcessorError},
    processor::{EntityState, Handler, HandlerContext},
    results::{StreamedResultsWriter, TestResult},
};
use async_trait::async_trait;
use camino::Utf8Path;

/// Appends each completed test to `streamed_results.jsonl` as it finishes,
/// so a crashed run keeps its partial results and a rerun can resume.
#[derive(Debug)]
pub struct StreamedResultsHandler {
    writer: StreamedResultsWriter,
}

impl StreamedResultsHandler {
    /// Opens (or resumes) the streamed result file under `results_dir`.
    pub fn new(results_dir: &Utf8Path) -> Result<Self, ProcessorError> {
        std::fs::create_dir_all(results_dir).map_err(|error| ProcessorError::WriteResults {
            path: results_dir.to_owned(),
            error,
        })?;
        Ok(Self {
            writer: StreamedResultsWriter::open(results_dir)?,
        })
    }

    /// Test names already recorded by an earlier (resumed) run.
    pub fn recorded(&self) -> impl Iterator<Item = &String> {
        self.writer.recorded().iter()
    }
}

#[async_trait]
impl Handler for StreamedResultsHandler {
    async fn entity_end(
        &mut self,
        _cx: &HandlerContext,
        _entity: &EntityState,
        result: Option<&TestResult>,
    ) -> Result<(), HandlerError> {
        if let Some(result) = result {
            self.writer.append(result)?;
        }
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
    use chrono::Utc;

    #[tokio::test]
    async fn each_completed_test_appends_one_record() {
        let dir = Utf8TempDir::new().unwrap();
        let mut processor = EventProcessor::new(dir.path().to_owned(), Logger::none());
        processor.add_handler(Box::new(StreamedResultsHandler::new(dir.path()).unwrap()));

        let t = Utc::now();
        for name in ["a.A", "a.B"] {
            processor
                .process(Event::TestStart {
                    time: t,
                    test: TestMetadata::named(name),
                })
                .await
                .unwrap();
            processor
                .process(Event::TestEnd {
                    time: t,
                    name: name.into(),
                    skip_reasons: vec![],
                })
                .await
                .unwrap();
        }

        let content =
            std::fs::read_to_string(dir.path().join("streamed_results.jsonl")).unwrap();
        let names: Vec<String> = content
            .lines()
            .map(|line| {
                serde_json::from_str::<TestResult>(line)
                    .unwrap()
                    .test
                    .name
            })
            .collect();
        assert_eq!(names, ["a.A", "a.B"]);

        // A fresh handler over the same dir sees the prior records.
        let resumed = StreamedResultsHandler::new(dir.path()).unwrap();
        assert_eq!(resumed.recorded().count(), 2);
    }
}
