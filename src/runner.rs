//! Intake runner — composes the controller, bridge, widgets, store, and
//! fallback into one session loop.
//!
//! Agent events, user input, and the fallback deadline are all dispatched on
//! a single `select!` queue, so no two handlers for a session ever run
//! concurrently and no locking is needed within a session.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};

use crate::bridge::{AgentEvent, BridgeHandle, SessionCommand, map_tool_call};
use crate::error::Error;
use crate::fallback::FallbackAdvancer;
use crate::session::{
    Advance, SessionController, StageCompletion, Transcript, TranscriptEntry, WidgetType,
    stage_index,
};
use crate::store::{PendingWrites, ProgressStore, RetryPolicy, save_record_with_retry};
use crate::widgets::WidgetRegistry;

/// Commands surfaced to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiCommand {
    AgentSpeech { text: String },
    ShowWidget { widget: WidgetType },
    HighlightField { widget: WidgetType, field: String },
    StageChanged { stage_id: String, synthetic: bool },
    ValidationFailed { widget: WidgetType, message: String },
    Warning { message: String },
    Completed,
}

/// User input into the session loop.
#[derive(Debug)]
pub enum UserInput {
    /// A widget submit action with its collected fields.
    Submission {
        widget: WidgetType,
        fields: Map<String, Value>,
    },
    /// Reopen a prior stage's widget to edit its answers.
    Edit { stage_id: String },
    /// Free text forwarded to the agent.
    Text(String),
    /// Abort the session.
    Quit,
}

/// Read-only view of the session for the status routes.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub patient_id: String,
    pub current_stage: Option<String>,
    pub complete: bool,
    pub completion: BTreeMap<String, StageCompletion>,
    pub unresolved: Vec<String>,
}

/// How the session loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub complete: bool,
    /// Stages skipped by the fallback that still need re-capture.
    pub unresolved: Vec<String>,
}

/// Owns one patient's intake session end to end.
pub struct IntakeRunner {
    controller: SessionController,
    registry: &'static WidgetRegistry,
    store: Arc<dyn ProgressStore>,
    transcript: Transcript,
    pending: PendingWrites,
    retry: RetryPolicy,
    fallback_timeout: Duration,
    agent_open: bool,
    ui_tx: mpsc::Sender<UiCommand>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl IntakeRunner {
    /// Load prior progress and position the session. A store failure here is
    /// fatal: no useful session can start without the backend.
    pub async fn start(
        patient_id: &str,
        store: Arc<dyn ProgressStore>,
        fallback_timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<
        (
            Self,
            watch::Receiver<SessionSnapshot>,
            mpsc::Receiver<UiCommand>,
        ),
        Error,
    > {
        let records = store.load_all(patient_id).await?;
        let controller = SessionController::resume_from(patient_id, &records);
        let transcript =
            Transcript::from_entries(store.load_transcript(patient_id).await.unwrap_or_default());

        let (ui_tx, ui_rx) = mpsc::channel(64);
        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot_of(&controller));

        tracing::info!(
            patient = patient_id,
            resumed_records = records.len(),
            stage = controller.current_stage_index(),
            "Intake session positioned"
        );

        Ok((
            Self {
                controller,
                registry: WidgetRegistry::global(),
                store,
                transcript,
                pending: PendingWrites::new(),
                retry,
                fallback_timeout,
                agent_open: true,
                ui_tx,
                snapshot_tx,
            },
            snapshot_rx,
            ui_rx,
        ))
    }

    /// Run the session loop until the flow completes or input ends.
    pub async fn run(
        mut self,
        handle: BridgeHandle,
        mut events: mpsc::Receiver<AgentEvent>,
        mut inputs: mpsc::Receiver<UserInput>,
    ) -> Result<SessionOutcome, Error> {
        let mut fallback = FallbackAdvancer::new(self.fallback_timeout);

        while !self.controller.is_complete() {
            let agent_open = self.agent_open;
            tokio::select! {
                event = events.recv(), if agent_open => {
                    match event {
                        Some(event) => self.handle_agent_event(event, &mut fallback).await,
                        None => {
                            // Clean end of the event stream; keep going locally.
                            self.agent_open = false;
                        }
                    }
                }
                input = inputs.recv() => {
                    match input {
                        Some(UserInput::Quit) | None => break,
                        Some(input) => self.handle_user_input(input, &handle, &mut fallback).await,
                    }
                }
                _ = fallback.expired() => {
                    self.fire_fallback(&mut fallback).await;
                }
            }
        }

        handle.close().await;
        if !self.pending.is_empty().await {
            let flushed = self.pending.flush(self.store.as_ref()).await;
            tracing::info!(flushed, "Flushed queued progress writes at session end");
        }

        let outcome = SessionOutcome {
            complete: self.controller.is_complete(),
            unresolved: self
                .controller
                .unresolved_stages()
                .into_iter()
                .map(String::from)
                .collect(),
        };
        if outcome.complete {
            self.send_ui(UiCommand::Completed).await;
        }
        Ok(outcome)
    }

    // ── Agent events ────────────────────────────────────────────────

    async fn handle_agent_event(&mut self, event: AgentEvent, fallback: &mut FallbackAdvancer) {
        match event {
            AgentEvent::SessionStarted { session_id } => {
                tracing::info!(%session_id, "Agent session started");
            }
            AgentEvent::Speech { text } => {
                self.record_transcript(TranscriptEntry::agent(&text)).await;
                self.send_ui(UiCommand::AgentSpeech { text }).await;
            }
            AgentEvent::ToolCall(call) => {
                if let Some(command) = map_tool_call(&call) {
                    self.apply_command(command, fallback).await;
                }
            }
            AgentEvent::ChannelClosed { reason } => {
                tracing::warn!(%reason, "Agent channel closed; continuing without the agent");
                self.agent_open = false;
                // The controller is untouched; an armed fallback will move
                // the flow along. Surfaced as non-blocking.
                self.send_ui(UiCommand::Warning {
                    message: "Connection to your guide dropped — we'll keep going without it."
                        .to_string(),
                })
                .await;
            }
        }
    }

    async fn apply_command(&mut self, command: SessionCommand, fallback: &mut FallbackAdvancer) {
        match command {
            SessionCommand::SetStage { stage_id } => {
                self.apply_set_stage(&stage_id, fallback).await;
            }
            SessionCommand::ShowWidget { widget } => {
                self.send_ui(UiCommand::ShowWidget { widget }).await;
            }
            SessionCommand::HighlightField { widget, field } => {
                self.send_ui(UiCommand::HighlightField { widget, field }).await;
            }
            SessionCommand::Say { text } => {
                self.record_transcript(TranscriptEntry::agent(&text)).await;
                self.send_ui(UiCommand::AgentSpeech { text }).await;
            }
        }
    }

    /// Genuine agent-driven transition. The agent may move to the next stage
    /// or back to an earlier one; skipping ahead is ignored so the forward
    /// path stays one stage at a time.
    async fn apply_set_stage(&mut self, stage_id: &str, fallback: &mut FallbackAdvancer) {
        let current = self.controller.current_stage_index();
        match stage_index(stage_id) {
            Some(target) if target == current + 1 => {
                fallback.disarm();
                match self.controller.advance() {
                    Advance::Next(stage) => {
                        self.send_ui(UiCommand::StageChanged {
                            stage_id: stage.id.to_string(),
                            synthetic: false,
                        })
                        .await;
                    }
                    Advance::Complete => {}
                }
                self.publish_snapshot();
            }
            Some(target) if target <= current => {
                fallback.disarm();
                if self.controller.jump_to(stage_id).is_ok() {
                    self.send_ui(UiCommand::StageChanged {
                        stage_id: stage_id.to_string(),
                        synthetic: false,
                    })
                    .await;
                    self.publish_snapshot();
                }
            }
            Some(_) => {
                tracing::warn!(%stage_id, "Agent tried to skip ahead; ignoring");
            }
            None => {
                tracing::warn!(%stage_id, "Agent named an unknown stage; ignoring");
            }
        }
    }

    // ── User input ──────────────────────────────────────────────────

    async fn handle_user_input(
        &mut self,
        input: UserInput,
        handle: &BridgeHandle,
        fallback: &mut FallbackAdvancer,
    ) {
        match input {
            UserInput::Submission { widget, fields } => {
                self.handle_submission(widget, fields, handle, fallback).await;
            }
            UserInput::Edit { stage_id } => match self.controller.jump_to(&stage_id) {
                Ok(stage) => {
                    fallback.disarm();
                    self.send_ui(UiCommand::StageChanged {
                        stage_id: stage.id.to_string(),
                        synthetic: false,
                    })
                    .await;
                    self.send_ui(UiCommand::ShowWidget { widget: stage.widget }).await;
                    self.publish_snapshot();
                }
                Err(e) => {
                    self.send_ui(UiCommand::Warning { message: e.to_string() }).await;
                }
            },
            UserInput::Text(text) => {
                self.record_transcript(TranscriptEntry::patient(&text)).await;
                handle.send_text(text).await;
            }
            UserInput::Quit => {}
        }
    }

    async fn handle_submission(
        &mut self,
        widget: WidgetType,
        fields: Map<String, Value>,
        handle: &BridgeHandle,
        fallback: &mut FallbackAdvancer,
    ) {
        let Ok(stage) = self.controller.current_stage() else {
            return;
        };
        if stage.widget != widget {
            self.send_ui(UiCommand::Warning {
                message: format!("{widget} is not the open step"),
            })
            .await;
            return;
        }

        // Validation failures never escape the widget layer.
        let record = match self.registry.get(widget).validate(fields) {
            Ok(record) => record,
            Err(e) => {
                self.send_ui(UiCommand::ValidationFailed {
                    widget,
                    message: e.to_string(),
                })
                .await;
                return;
            }
        };

        let patient_id = self.controller.patient_id().to_string();
        match save_record_with_retry(self.store.as_ref(), &patient_id, &record, self.retry).await {
            Ok(()) => {
                // A good write is a chance to drain anything queued earlier.
                if !self.pending.is_empty().await {
                    self.pending.flush(self.store.as_ref()).await;
                }
            }
            Err(e) => {
                tracing::warn!(patient = %patient_id, "Queuing record after failed save: {e}");
                self.pending.push(&patient_id, record.clone()).await;
                self.send_ui(UiCommand::Warning {
                    message: "We couldn't save your progress just now — we'll retry automatically."
                        .to_string(),
                })
                .await;
            }
        }

        self.record_transcript(TranscriptEntry::patient(format!(
            "Submitted {}.",
            stage.display_label
        )))
        .await;
        self.controller.mark_captured(stage.id);

        if self.controller.on_last_stage() {
            // Final record captured: the session is logically terminated.
            self.controller.advance();
            self.publish_snapshot();
            return;
        }

        self.publish_snapshot();
        handle.acknowledge(widget).await;
        // If the agent never answers, the fallback keeps the flow moving.
        fallback.arm();
    }

    // ── Fallback ────────────────────────────────────────────────────

    async fn fire_fallback(&mut self, fallback: &mut FallbackAdvancer) {
        let Some(advance) = fallback.fire(&mut self.controller, &mut self.transcript) else {
            return;
        };
        // The synthetic message was appended in memory; persist it too.
        self.persist_transcript_tail().await;
        match advance.next_stage {
            Some(stage) => {
                self.send_ui(UiCommand::StageChanged {
                    stage_id: stage.id.to_string(),
                    synthetic: true,
                })
                .await;
            }
            None => {}
        }
        self.send_ui(UiCommand::AgentSpeech { text: advance.message }).await;
        self.publish_snapshot();
    }

    // ── Helpers ─────────────────────────────────────────────────────

    async fn record_transcript(&mut self, entry: TranscriptEntry) {
        self.transcript.append(entry);
        self.persist_transcript_tail().await;
    }

    async fn persist_transcript_tail(&mut self) {
        let Some(entry) = self.transcript.last() else {
            return;
        };
        let patient_id = self.controller.patient_id();
        if let Err(e) = self.store.append_transcript(patient_id, entry).await {
            // Audit side channel; never blocks the session.
            tracing::warn!(patient = patient_id, "Transcript append failed: {e}");
        }
    }

    async fn send_ui(&self, command: UiCommand) {
        let _ = self.ui_tx.send(command).await;
    }

    fn publish_snapshot(&self) {
        let _ = self.snapshot_tx.send(snapshot_of(&self.controller));
    }
}

fn snapshot_of(controller: &SessionController) -> SessionSnapshot {
    SessionSnapshot {
        patient_id: controller.patient_id().to_string(),
        current_stage: controller.current_stage().ok().map(|s| s.id.to_string()),
        complete: controller.is_complete(),
        completion: controller.session().stage_completion.clone(),
        unresolved: controller
            .unresolved_stages()
            .into_iter()
            .map(String::from)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ToolCall;
    use crate::session::intake_stages;
    use crate::store::LibSqlStore;
    use serde_json::json;

    fn valid_fields(widget: WidgetType) -> Map<String, Value> {
        let value = match widget {
            WidgetType::Vitals => json!({"weight_kg": 85, "age": 30, "sex": "Female"}),
            WidgetType::MedicalHistory => {
                json!({"conditions": "none", "medications": "none", "allergies": "none"})
            }
            WidgetType::Psychographic => json!({
                "motivation": "energy",
                "eating_pattern": "late dinners",
                "activity_level": "light",
            }),
            WidgetType::LabScheduling | WidgetType::ConsultationScheduling => {
                json!({"date": "2026-08-10", "slot": "09:30"})
            }
            WidgetType::Profile => json!({"name": "Asha", "phone": "+15550100"}),
            WidgetType::Payment => json!({"order_id": "ord_1", "status": "success"}),
        };
        value.as_object().unwrap().clone()
    }

    async fn spawn_runner(
        patient: &str,
        store: Arc<dyn ProgressStore>,
        fallback_timeout: Duration,
    ) -> (
        tokio::task::JoinHandle<Result<SessionOutcome, Error>>,
        mpsc::Sender<AgentEvent>,
        mpsc::Sender<UserInput>,
        mpsc::Receiver<UiCommand>,
        watch::Receiver<SessionSnapshot>,
    ) {
        let (runner, snapshot_rx, ui_rx) =
            IntakeRunner::start(patient, store, fallback_timeout, RetryPolicy::default())
                .await
                .unwrap();
        let (handle, _cmds) = BridgeHandle::detached();
        let (event_tx, event_rx) = mpsc::channel(16);
        let (input_tx, input_rx) = mpsc::channel(16);
        let task = tokio::spawn(runner.run(handle, event_rx, input_rx));
        (task, event_tx, input_tx, ui_rx, snapshot_rx)
    }

    async fn next_ui(ui_rx: &mut mpsc::Receiver<UiCommand>) -> UiCommand {
        tokio::time::timeout(Duration::from_secs(5), ui_rx.recv())
            .await
            .expect("ui command in time")
            .expect("ui channel open")
    }

    #[tokio::test(start_paused = true)]
    async fn full_flow_completes_via_fallback_when_agent_is_silent() {
        let store: Arc<dyn ProgressStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let (task, _events, inputs, mut ui_rx, _snap) =
            spawn_runner("p1", store.clone(), Duration::from_millis(200)).await;

        for stage in intake_stages() {
            inputs
                .send(UserInput::Submission {
                    widget: stage.widget,
                    fields: valid_fields(stage.widget),
                })
                .await
                .unwrap();
            if stage.widget != WidgetType::ConsultationScheduling {
                // No agent transition arrives, so each advance is synthetic.
                loop {
                    match next_ui(&mut ui_rx).await {
                        UiCommand::StageChanged { synthetic, .. } => {
                            assert!(synthetic);
                            break;
                        }
                        _ => continue,
                    }
                }
            }
        }
        drop(inputs);

        let outcome = task.await.unwrap().unwrap();
        assert!(outcome.complete);
        // Every stage had a record; nothing is unresolved.
        assert!(outcome.unresolved.is_empty());

        let records = store.load_all("p1").await.unwrap();
        assert_eq!(records.len(), intake_stages().len());
        assert_eq!(
            store.get_status("p1").await.unwrap().as_deref(),
            Some("Consultation Scheduled")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_submission_is_rejected_locally() {
        let store: Arc<dyn ProgressStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let (task, _events, inputs, mut ui_rx, snap) =
            spawn_runner("p1", store.clone(), Duration::from_secs(30)).await;

        inputs
            .send(UserInput::Submission {
                widget: WidgetType::Vitals,
                fields: json!({"weight_kg": 85}).as_object().unwrap().clone(),
            })
            .await
            .unwrap();

        match next_ui(&mut ui_rx).await {
            UiCommand::ValidationFailed { widget, .. } => assert_eq!(widget, WidgetType::Vitals),
            other => panic!("expected validation failure, got {other:?}"),
        }

        // Nothing was stored and the pointer did not move.
        assert!(store.load_all("p1").await.unwrap().is_empty());
        assert_eq!(snap.borrow().current_stage.as_deref(), Some("vitals"));

        drop(inputs);
        let outcome = task.await.unwrap().unwrap();
        assert!(!outcome.complete);
    }

    #[tokio::test(start_paused = true)]
    async fn agent_transition_disarms_the_fallback() {
        let store: Arc<dyn ProgressStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let (task, events, inputs, mut ui_rx, snap) =
            spawn_runner("p1", store.clone(), Duration::from_secs(3)).await;

        inputs
            .send(UserInput::Submission {
                widget: WidgetType::Vitals,
                fields: valid_fields(WidgetType::Vitals),
            })
            .await
            .unwrap();
        events
            .send(AgentEvent::ToolCall(ToolCall {
                name: "set_stage".into(),
                args: json!({"stage_id": "medical_history"}),
            }))
            .await
            .unwrap();

        loop {
            match next_ui(&mut ui_rx).await {
                UiCommand::StageChanged { stage_id, synthetic } => {
                    assert_eq!(stage_id, "medical_history");
                    assert!(!synthetic, "agent-driven transition must not be synthetic");
                    break;
                }
                _ => continue,
            }
        }

        // Long after the fallback window, no synthetic advance happened.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(snap.borrow().current_stage.as_deref(), Some("medical_history"));

        drop(inputs);
        drop(events);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn channel_drop_leaves_state_and_fallback_advances() {
        let store: Arc<dyn ProgressStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let (task, events, inputs, mut ui_rx, _snap) =
            spawn_runner("p1", store.clone(), Duration::from_millis(200)).await;

        inputs
            .send(UserInput::Submission {
                widget: WidgetType::Vitals,
                fields: valid_fields(WidgetType::Vitals),
            })
            .await
            .unwrap();
        events
            .send(AgentEvent::ChannelClosed { reason: "network".into() })
            .await
            .unwrap();

        let mut saw_warning = false;
        let mut saw_synthetic = false;
        while !(saw_warning && saw_synthetic) {
            match next_ui(&mut ui_rx).await {
                UiCommand::Warning { .. } => saw_warning = true,
                UiCommand::StageChanged { stage_id, synthetic } => {
                    assert_eq!(stage_id, "medical_history");
                    assert!(synthetic);
                    saw_synthetic = true;
                }
                _ => continue,
            }
        }

        // The synthetic transition is on the persisted transcript.
        let entries = store.load_transcript("p1").await.unwrap();
        assert!(entries.iter().any(|e| e.synthetic));

        drop(inputs);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_session_skips_captured_stages() {
        let store: Arc<dyn ProgressStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        for widget in [
            WidgetType::Vitals,
            WidgetType::MedicalHistory,
            WidgetType::Psychographic,
        ] {
            let record = WidgetRegistry::global()
                .get(widget)
                .validate(valid_fields(widget))
                .unwrap();
            store.save_record("p1", &record).await.unwrap();
        }

        let (task, _events, inputs, _ui_rx, snap) =
            spawn_runner("p1", store, Duration::from_secs(30)).await;
        assert_eq!(snap.borrow().current_stage.as_deref(), Some("lab_scheduling"));

        drop(inputs);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn edit_reopens_prior_stage_and_resubmit_replaces_record() {
        let store: Arc<dyn ProgressStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let (task, events, inputs, mut ui_rx, snap) =
            spawn_runner("p1", store.clone(), Duration::from_secs(60)).await;

        inputs
            .send(UserInput::Submission {
                widget: WidgetType::Vitals,
                fields: valid_fields(WidgetType::Vitals),
            })
            .await
            .unwrap();
        events
            .send(AgentEvent::ToolCall(ToolCall {
                name: "set_stage".into(),
                args: json!({"stage_id": "medical_history"}),
            }))
            .await
            .unwrap();
        loop {
            if matches!(next_ui(&mut ui_rx).await, UiCommand::StageChanged { .. }) {
                break;
            }
        }

        // Edit vitals, resubmit with different fields.
        inputs
            .send(UserInput::Edit { stage_id: "vitals".into() })
            .await
            .unwrap();
        let mut fields = Map::new();
        fields.insert("weight_kg".into(), json!(82));
        fields.insert("age".into(), json!(30));
        fields.insert("sex".into(), json!("Female"));
        inputs
            .send(UserInput::Submission { widget: WidgetType::Vitals, fields })
            .await
            .unwrap();

        // Wait until the store shows the replacement.
        loop {
            let records = store.load_all("p1").await.unwrap();
            if records
                .get(&WidgetType::Vitals)
                .is_some_and(|r| r.fields["weight_kg"] == json!(82))
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Completion marks elsewhere are untouched by the edit.
        assert_eq!(
            snap.borrow().completion.get("vitals"),
            Some(&StageCompletion::Captured)
        );

        drop(inputs);
        drop(events);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn forward_edit_is_rejected_with_warning() {
        let store: Arc<dyn ProgressStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let (task, _events, inputs, mut ui_rx, snap) =
            spawn_runner("p1", store, Duration::from_secs(30)).await;

        inputs
            .send(UserInput::Edit { stage_id: "payment".into() })
            .await
            .unwrap();
        match next_ui(&mut ui_rx).await {
            UiCommand::Warning { message } => assert!(message.contains("jump forward")),
            other => panic!("expected warning, got {other:?}"),
        }
        assert_eq!(snap.borrow().current_stage.as_deref(), Some("vitals"));

        drop(inputs);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn agent_skip_ahead_is_ignored() {
        let store: Arc<dyn ProgressStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let (task, events, inputs, _ui_rx, snap) =
            spawn_runner("p1", store, Duration::from_secs(30)).await;

        events
            .send(AgentEvent::ToolCall(ToolCall {
                name: "set_stage".into(),
                args: json!({"stage_id": "payment"}),
            }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(snap.borrow().current_stage.as_deref(), Some("vitals"));

        drop(inputs);
        drop(events);
        task.await.unwrap().unwrap();
    }
}
