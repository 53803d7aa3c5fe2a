//! Append-only session transcript.
//!
//! Grows monotonically, never mutated after append. Persisted as a side
//! channel for audit and resume.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Patient,
    Agent,
    /// Locally generated messages (fallback transitions, status notes).
    System,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Patient => "patient",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Speaker> {
        match s {
            "patient" => Some(Self::Patient),
            "agent" => Some(Self::Agent),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// One exchanged message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
    /// True for locally synthesized messages (e.g. fallback transitions), so
    /// they stay distinguishable from genuine agent output.
    pub synthetic: bool,
}

impl TranscriptEntry {
    pub fn patient(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Patient,
            text: text.into(),
            at: Utc::now(),
            synthetic: false,
        }
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Agent,
            text: text.into(),
            at: Utc::now(),
            synthetic: false,
        }
    }

    pub fn synthetic(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::System,
            text: text.into(),
            at: Utc::now(),
            synthetic: true,
        }
    }
}

/// Ordered, append-only log of exchanged messages for one session.
#[derive(Debug, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rehydrate from persisted entries (resume path).
    pub fn from_entries(entries: Vec<TranscriptEntry>) -> Self {
        Self { entries }
    }

    pub fn append(&mut self, entry: TranscriptEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&TranscriptEntry> {
        self.entries.last()
    }
}
