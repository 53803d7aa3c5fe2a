//! Intake session state — stages, the controller, and the transcript.

pub mod controller;
pub mod stage;
pub mod transcript;

pub use controller::{Advance, IntakeSession, SessionController, StageCompletion};
pub use stage::{Stage, WidgetType, intake_stages, stage_index};
pub use transcript::{Speaker, Transcript, TranscriptEntry};
