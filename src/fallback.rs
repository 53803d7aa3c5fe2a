//! Fallback advancer — the intake flow is never permanently stuck waiting
//! for the agent.
//!
//! After a widget submission is acknowledged to the agent, a deadline is
//! armed. If no stage-transition tool call arrives in time, the session
//! advances exactly once along the static stage order and a synthetic,
//! flagged transition message is appended so the patient is not left
//! waiting and support can tell local transitions from agent-driven ones.

use std::pin::Pin;
use std::time::Duration;

use futures::future;

use crate::session::{Advance, SessionController, Stage, Transcript, TranscriptEntry};

/// Result of a fired fallback advance.
#[derive(Debug)]
pub struct FallbackAdvance {
    /// Stage the session was stuck on.
    pub from_stage: &'static Stage,
    /// Next stage, or None when the flow completed.
    pub next_stage: Option<&'static Stage>,
    /// The synthetic transcript message that was appended.
    pub message: String,
}

/// Arms and fires the bounded wait for agent-driven transitions.
pub struct FallbackAdvancer {
    timeout: Duration,
    deadline: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl FallbackAdvancer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: None,
        }
    }

    /// Start (or restart) the bounded wait for an agent transition.
    pub fn arm(&mut self) {
        self.deadline = Some(Box::pin(tokio::time::sleep(self.timeout)));
    }

    /// Cancel the wait; called when a genuine agent transition arrives.
    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves when the armed deadline passes; pending forever while
    /// disarmed, so it can live in a `select!` arm.
    pub async fn expired(&mut self) {
        match self.deadline.as_mut() {
            Some(sleep) => sleep.as_mut().await,
            None => future::pending().await,
        }
    }

    /// Advance the controller one stage and append a flagged synthetic
    /// transition message. Disarms first, so one armed wait fires at most
    /// once. A stage left without a record is marked unresolved for later
    /// re-capture.
    pub fn fire(
        &mut self,
        controller: &mut SessionController,
        transcript: &mut Transcript,
    ) -> Option<FallbackAdvance> {
        self.disarm();

        let from_stage = controller.current_stage().ok()?;
        if controller.completion(from_stage.id).is_none() {
            controller.mark_skipped(from_stage.id);
        }

        let next_stage = match controller.advance() {
            Advance::Next(stage) => Some(stage),
            Advance::Complete => None,
        };

        let message = match next_stage {
            Some(stage) => format!(
                "The connection is a little unstable, so let's keep going — next up: {}.",
                stage.display_label
            ),
            None => "The connection is a little unstable, so let's wrap up here — you're all set."
                .to_string(),
        };
        transcript.append(TranscriptEntry::synthetic(&message));

        tracing::info!(
            from = from_stage.id,
            to = next_stage.map(|s| s.id).unwrap_or("complete"),
            "Fallback advanced the session"
        );

        Some(FallbackAdvance {
            from_stage,
            next_stage,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StageCompletion;

    #[tokio::test(start_paused = true)]
    async fn expired_resolves_only_after_the_timeout() {
        let mut fallback = FallbackAdvancer::new(Duration::from_secs(5));
        fallback.arm();

        let early = tokio::time::timeout(Duration::from_secs(4), fallback.expired()).await;
        assert!(early.is_err(), "deadline should not fire early");

        let late = tokio::time::timeout(Duration::from_secs(2), fallback.expired()).await;
        assert!(late.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn unarmed_wait_is_pending_forever() {
        let mut fallback = FallbackAdvancer::new(Duration::from_millis(10));
        let result = tokio::time::timeout(Duration::from_secs(60), fallback.expired()).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_cancels_the_wait() {
        let mut fallback = FallbackAdvancer::new(Duration::from_secs(5));
        fallback.arm();
        fallback.disarm();
        let result = tokio::time::timeout(Duration::from_secs(10), fallback.expired()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn fire_advances_once_and_appends_synthetic_message() {
        let mut controller = SessionController::new("p1");
        let mut transcript = Transcript::new();
        let mut fallback = FallbackAdvancer::new(Duration::from_millis(10));
        controller.mark_captured("vitals");
        fallback.arm();

        let advance = fallback.fire(&mut controller, &mut transcript).unwrap();
        assert_eq!(advance.from_stage.id, "vitals");
        assert_eq!(advance.next_stage.unwrap().id, "medical_history");
        assert_eq!(controller.current_stage_index(), 1);

        // Flagged synthetic message, distinguishable from agent transitions.
        let entry = transcript.last().unwrap();
        assert!(entry.synthetic);
        assert!(entry.text.contains("Medical History"));

        // One armed wait fires at most once.
        assert!(!fallback.is_armed());
    }

    #[tokio::test]
    async fn fire_marks_recordless_stage_unresolved() {
        let mut controller = SessionController::new("p1");
        let mut transcript = Transcript::new();
        let mut fallback = FallbackAdvancer::new(Duration::from_millis(10));
        fallback.arm();

        fallback.fire(&mut controller, &mut transcript).unwrap();
        assert_eq!(
            controller.completion("vitals"),
            Some(StageCompletion::SkippedByFallback)
        );
        assert_eq!(controller.unresolved_stages(), vec!["vitals"]);
    }

    #[tokio::test]
    async fn fire_never_downgrades_a_captured_stage() {
        let mut controller = SessionController::new("p1");
        let mut transcript = Transcript::new();
        let mut fallback = FallbackAdvancer::new(Duration::from_millis(10));
        controller.mark_captured("vitals");
        fallback.arm();

        fallback.fire(&mut controller, &mut transcript).unwrap();
        assert_eq!(
            controller.completion("vitals"),
            Some(StageCompletion::Captured)
        );
        assert!(controller.unresolved_stages().is_empty());
    }

    #[tokio::test]
    async fn fire_on_last_stage_completes_the_session() {
        let mut controller = SessionController::new("p1");
        let mut transcript = Transcript::new();
        let mut fallback = FallbackAdvancer::new(Duration::from_millis(10));
        while !controller.on_last_stage() {
            controller.advance();
        }
        fallback.arm();

        let advance = fallback.fire(&mut controller, &mut transcript).unwrap();
        assert!(advance.next_stage.is_none());
        assert!(controller.is_complete());
        assert!(transcript.last().unwrap().synthetic);
    }

    #[tokio::test]
    async fn fire_after_completion_is_a_no_op() {
        let mut controller = SessionController::new("p1");
        let mut transcript = Transcript::new();
        let mut fallback = FallbackAdvancer::new(Duration::from_millis(10));
        while !controller.is_complete() {
            controller.advance();
        }
        fallback.arm();

        assert!(fallback.fire(&mut controller, &mut transcript).is_none());
        assert!(transcript.is_empty());
    }
}
