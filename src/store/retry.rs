//! Bounded retry around progress-store saves.
//!
//! A transient persistence failure must not lose captured data: saves are
//! retried a small bounded number of times with jittered backoff, and writes
//! that exhaust their retries are queued for a later flush while intake
//! proceeds optimistically in memory.

use std::collections::VecDeque;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::store::{ProgressStore, coarse_status};
use crate::widgets::CapturedRecord;

/// Retry policy for store writes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), with jitter.
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(4));
        let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis().min(250) as u64);
        exp + Duration::from_millis(jitter_ms)
    }
}

/// Save a record, retrying on failure, then update the coarse status
/// side-channel. A status write failure is logged, not propagated: the
/// channel is at-least-once and the next save repeats it.
pub async fn save_record_with_retry(
    store: &dyn ProgressStore,
    patient_id: &str,
    record: &CapturedRecord,
    policy: RetryPolicy,
) -> Result<(), StoreError> {
    let mut last: Option<StoreError> = None;
    for attempt in 0..policy.attempts.max(1) {
        if attempt > 0 {
            tokio::time::sleep(policy.delay(attempt)).await;
        }
        match store.save_record(patient_id, record).await {
            Ok(()) => {
                let status = coarse_status(record.widget);
                if let Err(e) = store.set_status(patient_id, status).await {
                    tracing::warn!(patient = patient_id, %status, "Status side-channel write failed: {e}");
                }
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(
                    patient = patient_id,
                    widget = %record.widget,
                    attempt = attempt + 1,
                    "Record save failed: {e}"
                );
                last = Some(e);
            }
        }
    }
    Err(StoreError::RetriesExhausted {
        attempts: policy.attempts.max(1),
        last: last.map(|e| e.to_string()).unwrap_or_default(),
    })
}

/// Writes that exhausted their retries, held for a later flush.
/// Data is queued, never dropped.
#[derive(Default)]
pub struct PendingWrites {
    queue: Mutex<VecDeque<(String, CapturedRecord)>>,
}

impl PendingWrites {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, patient_id: &str, record: CapturedRecord) {
        self.queue
            .lock()
            .await
            .push_back((patient_id.to_string(), record));
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    /// Try to persist every queued write once; entries that still fail stay
    /// queued, in order. Returns how many were flushed.
    pub async fn flush(&self, store: &dyn ProgressStore) -> usize {
        let mut queue = self.queue.lock().await;
        let mut flushed = 0;
        let mut remaining = VecDeque::new();
        while let Some((patient_id, record)) = queue.pop_front() {
            match store.save_record(&patient_id, &record).await {
                Ok(()) => {
                    let status = coarse_status(record.widget);
                    let _ = store.set_status(&patient_id, status).await;
                    flushed += 1;
                }
                Err(e) => {
                    tracing::warn!(patient = %patient_id, "Pending write flush failed: {e}");
                    remaining.push_back((patient_id, record));
                }
            }
        }
        *queue = remaining;
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{TranscriptEntry, WidgetType};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Store that fails the first `failures` saves, then succeeds.
    struct FlakyStore {
        failures: AtomicU32,
        saves: AtomicU32,
        statuses: AtomicU32,
    }

    impl FlakyStore {
        fn failing(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                saves: AtomicU32::new(0),
                statuses: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ProgressStore for FlakyStore {
        async fn run_migrations(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn save_record(
            &self,
            _patient_id: &str,
            _record: &CapturedRecord,
        ) -> Result<(), StoreError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Query("simulated outage".to_string()));
            }
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn load_all(
            &self,
            _patient_id: &str,
        ) -> Result<HashMap<WidgetType, CapturedRecord>, StoreError> {
            Ok(HashMap::new())
        }

        async fn append_transcript(
            &self,
            _patient_id: &str,
            _entry: &TranscriptEntry,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        async fn load_transcript(
            &self,
            _patient_id: &str,
        ) -> Result<Vec<TranscriptEntry>, StoreError> {
            Ok(Vec::new())
        }

        async fn set_status(&self, _patient_id: &str, _status: &str) -> Result<(), StoreError> {
            self.statuses.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn get_status(&self, _patient_id: &str) -> Result<Option<String>, StoreError> {
            Ok(None)
        }
    }

    fn record() -> CapturedRecord {
        CapturedRecord {
            widget: WidgetType::Vitals,
            fields: json!({"age": 30}).as_object().unwrap().clone(),
            captured_at: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_from_transient_failures() {
        let store = FlakyStore::failing(2);
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(10),
        };
        save_record_with_retry(&store, "p1", &record(), policy)
            .await
            .unwrap();
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
        // Status side-channel updated exactly once, after the successful save.
        assert_eq!(store.statuses.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_as_error() {
        let store = FlakyStore::failing(10);
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(10),
        };
        let err = save_record_with_retry(&store, "p1", &record(), policy)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pending_writes_flush_when_store_recovers() {
        let pending = PendingWrites::new();
        pending.push("p1", record()).await;
        pending.push("p1", record()).await;
        assert_eq!(pending.len().await, 2);

        // Still down: nothing flushes, nothing is dropped.
        let down = FlakyStore::failing(u32::MAX);
        assert_eq!(pending.flush(&down).await, 0);
        assert_eq!(pending.len().await, 2);

        let up = FlakyStore::failing(0);
        assert_eq!(pending.flush(&up).await, 2);
        assert!(pending.is_empty().await);
    }
}
