// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The copy-output handler: pulls per-test artifacts off the target.

use crate::{
    errors::HandlerError,
    processor::{EntityState, EntityKind, Handler, HandlerContext},
    results::TestResult,
    target::SshSession,
};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use std::sync::Arc;

/// Moves a remote output tree to a local directory.
#[async_trait]
pub trait OutputPuller: Send {
    /// Copies the remote tree into `local`, creating it as needed.
    async fn pull(&mut self, remote: &str, local: &Utf8Path) -> Result<(), HandlerError>;

    /// Deletes the remote tree.
    async fn remove(&mut self, remote: &str) -> Result<(), HandlerError>;
}

/// Pulls over the run's SSH session.
pub struct SshOutputPuller {
    session: Arc<SshSession>,
}

impl SshOutputPuller {
    /// Creates a puller over `session`.
    pub fn new(session: Arc<SshSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl OutputPuller for SshOutputPuller {
    async fn pull(&mut self, remote: &str, local: &Utf8Path) -> Result<(), HandlerError> {
        self.session.copy_tree_from(remote, local).await?;
        Ok(())
    }

    async fn remove(&mut self, remote: &str) -> Result<(), HandlerError> {
        self.session.remove_remote_tree(remote).await?;
        Ok(())
    }
}

/// On each test's end, pulls `<remote out dir>/<test>` into the test's local
/// output directory, then deletes the remote copy so a later attempt starts
/// clean.
pub struct CopyOutputHandler {
    puller: Box<dyn OutputPuller>,
    remote_out_dir: Utf8PathBuf,
}

impl CopyOutputHandler {
    /// Creates a handler pulling from `remote_out_dir` on the target.
    pub fn new(puller: Box<dyn OutputPuller>, remote_out_dir: Utf8PathBuf) -> Self {
        Self {
            puller,
            remote_out_dir,
        }
    }
}

#[async_trait]
impl Handler for CopyOutputHandler {
    async fn entity_end(
        &mut self,
        _cx: &HandlerContext,
        entity: &EntityState,
        result: Option<&TestResult>,
    ) -> Result<(), HandlerError> {
        if entity.kind != EntityKind::Test {
            return Ok(());
        }
        let Some(result) = result else {
            return Ok(());
        };
        let remote = self.remote_out_dir.join(&entity.name);
        self.puller.pull(remote.as_str(), &result.out_dir).await?;
        self.puller.remove(remote.as_str()).await?;
        Ok(())
    }
}

impl std::fmt::Debug for CopyOutputHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyOutputHandler")
            .field("remote_out_dir", &self.remote_out_dir)
            .finish_non_exhaustive()
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
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPuller {
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl OutputPuller for RecordingPuller {
        async fn pull(&mut self, remote: &str, local: &Utf8Path) -> Result<(), HandlerError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("pull {remote} -> {local}"));
            Ok(())
        }

        async fn remove(&mut self, remote: &str) -> Result<(), HandlerError> {
            self.calls.lock().unwrap().push(format!("remove {remote}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn pulls_then_deletes_remote_out_dir() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut processor = EventProcessor::new("results".into(), Logger::none());
        processor.add_handler(Box::new(CopyOutputHandler::new(
            Box::new(RecordingPuller {
                calls: calls.clone(),
            }),
            "/tmp/tast/out".into(),
        )));

        let t = Utc::now();
        processor
            .process(Event::TestStart {
                time: t,
                test: TestMetadata::named("a.A"),
            })
            .await
            .unwrap();
        processor
            .process(Event::TestEnd {
                time: t,
                name: "a.A".into(),
                skip_reasons: vec![],
            })
            .await
            .unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            [
                "pull /tmp/tast/out/a.A -> results/tests/a.A",
                "remove /tmp/tast/out/a.A",
            ]
        );
    }
}
