// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The timing handler: a stage tree for the run.

use crate::{
    errors::HandlerError,
    processor::{EntityState, Handler, HandlerContext},
    results::TestResult,
};
use async_trait::async_trait;
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::File;

/// One timing stage: opened on an entity's start, closed on its end. Stages
/// nest the way entities nest (fixtures around tests).
#[derive(Clone, Debug, Serialize)]
pub struct Stage {
    name: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    children: Vec<Stage>,
}

/// Records a stage per entity and writes `timing.json` at the end of the
/// run.
#[derive(Debug, Default)]
pub struct TimingHandler {
    /// Completed top-level stages.
    completed: Vec<Stage>,
    /// Currently open stages, outermost first.
    open: Vec<Stage>,
}

impl TimingHandler {
    /// Creates an empty timing handler.
    pub fn new() -> Self {
        Self::default()
    }

    fn close_stage(&mut self, name: &str, end_time: DateTime<Utc>) {
        // Entities end innermost-first, so the stage to close is on top.
        // Tolerate mismatches rather than losing the whole tree.
        let Some(position) = self.open.iter().rposition(|s| s.name == name) else {
            return;
        };
        let mut stage = self.open.remove(position);
        stage.end_time = Some(end_time);
        match self.open.last_mut() {
            Some(parent) => parent.children.push(stage),
            None => self.completed.push(stage),
        }
    }
}

#[async_trait]
impl Handler for TimingHandler {
    async fn entity_start(
        &mut self,
        _cx: &HandlerContext,
        entity: &EntityState,
    ) -> Result<(), HandlerError> {
        self.open.push(Stage {
            name: entity.name.clone(),
            start_time: entity.start_time,
            end_time: None,
            children: Vec::new(),
        });
        Ok(())
    }

    async fn entity_end(
        &mut self,
        _cx: &HandlerContext,
        entity: &EntityState,
        result: Option<&TestResult>,
    ) -> Result<(), HandlerError> {
        let end_time = result.map_or_else(Utc::now, |r| r.end_time);
        self.close_stage(&entity.name, end_time);
        Ok(())
    }

    async fn run_end(
        &mut self,
        cx: &HandlerContext,
        _log_dir: &Utf8Path,
        _out_dir: &Utf8Path,
    ) -> Result<(), HandlerError> {
        // Anything still open at run end closes without an end time.
        while let Some(mut stage) = self.open.pop() {
            stage.end_time = None;
            match self.open.last_mut() {
                Some(parent) => parent.children.push(stage),
                None => self.completed.push(stage),
            }
        }

        std::fs::create_dir_all(&cx.results_dir)?;
        let file = File::create(cx.results_dir.join("timing.json"))?;
        serde_json::to_writer_pretty(file, &self.completed)?;
        Ok(())
    }
}
