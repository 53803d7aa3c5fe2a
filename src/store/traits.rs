//! `ProgressStore` trait — single async interface for intake persistence.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::session::{TranscriptEntry, WidgetType};
use crate::widgets::CapturedRecord;

/// Durable, patient-scoped persistence for captured records and the
/// transcript. Single active session per patient is assumed, so record
/// upserts are last-write-wins with no conflict detection.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), StoreError>;

    /// Upsert a captured record keyed by `(patient_id, widget)`.
    /// Replaces any prior record wholesale.
    async fn save_record(
        &self,
        patient_id: &str,
        record: &CapturedRecord,
    ) -> Result<(), StoreError>;

    /// Load every captured record for a patient, keyed by widget. Used on
    /// session (re)start to skip directly past completed stages.
    async fn load_all(
        &self,
        patient_id: &str,
    ) -> Result<HashMap<WidgetType, CapturedRecord>, StoreError>;

    /// Append one transcript entry. The transcript is append-only.
    async fn append_transcript(
        &self,
        patient_id: &str,
        entry: &TranscriptEntry,
    ) -> Result<(), StoreError>;

    /// Load the full transcript for a patient, in append order.
    async fn load_transcript(&self, patient_id: &str)
    -> Result<Vec<TranscriptEntry>, StoreError>;

    /// Update the coarse status side-channel. At-least-once; duplicate
    /// writes with the same value are harmless.
    async fn set_status(&self, patient_id: &str, status: &str) -> Result<(), StoreError>;

    /// Read the current coarse status, if one has been written.
    async fn get_status(&self, patient_id: &str) -> Result<Option<String>, StoreError>;
}
