//! libSQL backend — async `ProgressStore` implementation.
//!
//! Supports a local database file and an in-memory database for tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;
use crate::session::{Speaker, TranscriptEntry, WidgetType};
use crate::store::migrations;
use crate::store::traits::ProgressStore;
use crate::widgets::CapturedRecord;

/// libSQL progress store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        info!(path = %path.display(), "Intake database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to create in-memory db: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// Parse an RFC 3339 datetime string written by this store.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[async_trait]
impl ProgressStore for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), StoreError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn save_record(
        &self,
        patient_id: &str,
        record: &CapturedRecord,
    ) -> Result<(), StoreError> {
        let fields = serde_json::to_string(&record.fields)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT INTO intake_records (patient_id, widget, fields, captured_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (patient_id, widget) DO UPDATE SET
                     fields = excluded.fields,
                     captured_at = excluded.captured_at,
                     updated_at = excluded.updated_at",
                params![
                    patient_id,
                    record.widget.as_str(),
                    fields,
                    record.captured_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("save record: {e}")))?;
        Ok(())
    }

    async fn load_all(
        &self,
        patient_id: &str,
    ) -> Result<HashMap<WidgetType, CapturedRecord>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT widget, fields, captured_at FROM intake_records WHERE patient_id = ?1",
                params![patient_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("load records: {e}")))?;

        let mut records = HashMap::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("load records: {e}")))?
        {
            let widget_str: String = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("decode widget: {e}")))?;
            let Some(widget) = WidgetType::parse(&widget_str) else {
                // A widget this build no longer knows about; skip rather than fail the resume.
                tracing::warn!(widget = %widget_str, "Skipping record with unknown widget");
                continue;
            };
            let fields_str: String = row
                .get(1)
                .map_err(|e| StoreError::Query(format!("decode fields: {e}")))?;
            let fields = serde_json::from_str(&fields_str)
                .map_err(|e| StoreError::Serialization(format!("record fields: {e}")))?;
            let captured_at: String = row
                .get(2)
                .map_err(|e| StoreError::Query(format!("decode captured_at: {e}")))?;

            records.insert(
                widget,
                CapturedRecord {
                    widget,
                    fields,
                    captured_at: parse_datetime(&captured_at),
                },
            );
        }
        Ok(records)
    }

    async fn append_transcript(
        &self,
        patient_id: &str,
        entry: &TranscriptEntry,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO transcript_entries (id, patient_id, speaker, content, synthetic, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    patient_id,
                    entry.speaker.as_str(),
                    entry.text.as_str(),
                    entry.synthetic as i64,
                    entry.at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("append transcript: {e}")))?;
        Ok(())
    }

    async fn load_transcript(
        &self,
        patient_id: &str,
    ) -> Result<Vec<TranscriptEntry>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT speaker, content, synthetic, created_at
                 FROM transcript_entries WHERE patient_id = ?1
                 ORDER BY created_at, rowid",
                params![patient_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("load transcript: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("load transcript: {e}")))?
        {
            let speaker_str: String = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("decode speaker: {e}")))?;
            let text: String = row
                .get(1)
                .map_err(|e| StoreError::Query(format!("decode content: {e}")))?;
            let synthetic: i64 = row
                .get(2)
                .map_err(|e| StoreError::Query(format!("decode synthetic: {e}")))?;
            let created_at: String = row
                .get(3)
                .map_err(|e| StoreError::Query(format!("decode created_at: {e}")))?;

            entries.push(TranscriptEntry {
                speaker: Speaker::parse(&speaker_str).unwrap_or(Speaker::System),
                text,
                at: parse_datetime(&created_at),
                synthetic: synthetic != 0,
            });
        }
        Ok(entries)
    }

    async fn set_status(&self, patient_id: &str, status: &str) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO patient_status (patient_id, status, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (patient_id) DO UPDATE SET
                     status = excluded.status,
                     updated_at = excluded.updated_at",
                params![patient_id, status, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set status: {e}")))?;
        Ok(())
    }

    async fn get_status(&self, patient_id: &str) -> Result<Option<String>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status FROM patient_status WHERE patient_id = ?1",
                params![patient_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get status: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("get status: {e}")))?;
        match row {
            Some(row) => Ok(Some(
                row.get::<String>(0)
                    .map_err(|e| StoreError::Query(format!("decode status: {e}")))?,
            )),
            None => Ok(None),
        }
    }
}
