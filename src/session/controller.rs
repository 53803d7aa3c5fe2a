//! Session controller — authoritative holder of "where is this patient in
//! the intake flow".
//!
//! Transitions are strictly forward via `advance()`, or backward via
//! `jump_to()` for edits. Nothing else moves the pointer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::session::stage::{Stage, WidgetType, intake_stages, stage_index};
use crate::widgets::CapturedRecord;

/// How a stage came to be marked done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageCompletion {
    /// A validated record was captured.
    Captured,
    /// The fallback advanced past this stage without a record; it needs
    /// re-capture on a later session.
    SkippedByFallback,
}

/// One patient's onboarding run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeSession {
    pub patient_id: String,
    pub current_stage_index: usize,
    pub stage_completion: BTreeMap<String, StageCompletion>,
    pub started_at: DateTime<Utc>,
}

/// Result of an `advance()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Next(&'static Stage),
    /// Terminal. Repeated calls keep returning this, never an error.
    Complete,
}

/// Owns the stage pointer and per-stage completion state for one session.
pub struct SessionController {
    session: IntakeSession,
    stages: &'static [Stage],
}

impl SessionController {
    /// Start a fresh session at the first stage.
    pub fn new(patient_id: impl Into<String>) -> Self {
        Self {
            session: IntakeSession {
                patient_id: patient_id.into(),
                current_stage_index: 0,
                stage_completion: BTreeMap::new(),
                started_at: Utc::now(),
            },
            stages: intake_stages(),
        }
    }

    /// Resume a session from previously captured records: the pointer lands
    /// on the first stage without a record, skipping captured stages.
    pub fn resume_from(
        patient_id: impl Into<String>,
        records: &std::collections::HashMap<WidgetType, CapturedRecord>,
    ) -> Self {
        let mut controller = Self::new(patient_id);
        for stage in controller.stages {
            if records.contains_key(&stage.widget) {
                controller
                    .session
                    .stage_completion
                    .insert(stage.id.to_string(), StageCompletion::Captured);
            }
        }
        controller.session.current_stage_index = controller
            .stages
            .iter()
            .position(|s| !records.contains_key(&s.widget))
            .unwrap_or(controller.stages.len());
        controller
    }

    pub fn session(&self) -> &IntakeSession {
        &self.session
    }

    pub fn patient_id(&self) -> &str {
        &self.session.patient_id
    }

    pub fn current_stage_index(&self) -> usize {
        self.session.current_stage_index
    }

    /// Whether the terminal `Complete` state has been reached.
    pub fn is_complete(&self) -> bool {
        self.session.current_stage_index >= self.stages.len()
    }

    /// The stage at the current pointer. Errors once all stages are done.
    pub fn current_stage(&self) -> Result<&'static Stage, SessionError> {
        self.stages
            .get(self.session.current_stage_index)
            .ok_or(SessionError::OutOfRange)
    }

    /// Whether the pointer is on the last stage.
    pub fn on_last_stage(&self) -> bool {
        self.session.current_stage_index + 1 == self.stages.len()
    }

    /// Move the pointer forward by one. Idempotent at the end.
    pub fn advance(&mut self) -> Advance {
        if self.is_complete() {
            return Advance::Complete;
        }
        self.session.current_stage_index += 1;
        match self.stages.get(self.session.current_stage_index) {
            Some(stage) => Advance::Next(stage),
            None => Advance::Complete,
        }
    }

    /// Explicit rewind for "edit previous answer". Only stages at or before
    /// the current pointer are reachable; forward jumps must go through
    /// `advance()`.
    pub fn jump_to(&mut self, stage_id: &str) -> Result<&'static Stage, SessionError> {
        let target = stage_index(stage_id)
            .ok_or_else(|| SessionError::UnknownStage(stage_id.to_string()))?;
        if target > self.session.current_stage_index {
            let from = self
                .stages
                .get(self.session.current_stage_index)
                .map(|s| s.id.to_string())
                .unwrap_or_else(|| "complete".to_string());
            return Err(SessionError::InvalidTransition {
                from,
                to: stage_id.to_string(),
            });
        }
        self.session.current_stage_index = target;
        Ok(&self.stages[target])
    }

    /// Record that the current stage's widget produced a validated record.
    /// Rewinds for edits do not clear other stages' marks.
    pub fn mark_captured(&mut self, stage_id: &str) {
        self.session
            .stage_completion
            .insert(stage_id.to_string(), StageCompletion::Captured);
    }

    /// Record that the fallback advanced past a stage without a record.
    /// A previously captured stage is never downgraded.
    pub fn mark_skipped(&mut self, stage_id: &str) {
        self.session
            .stage_completion
            .entry(stage_id.to_string())
            .or_insert(StageCompletion::SkippedByFallback);
    }

    pub fn completion(&self, stage_id: &str) -> Option<StageCompletion> {
        self.session.stage_completion.get(stage_id).copied()
    }

    /// Stages that were skipped by the fallback and still need re-capture.
    pub fn unresolved_stages(&self) -> Vec<&str> {
        self.session
            .stage_completion
            .iter()
            .filter(|(_, c)| **c == StageCompletion::SkippedByFallback)
            .map(|(id, _)| id.as_str())
            .collect()
    }
}
