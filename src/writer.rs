use crate::jobs::Job;
use crate::models::AnalysisRecord;
use crate::supabase::{SupabaseClient, SupabaseError};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Error)]
pub enum WriteError {
    #[error("store rejected row: {0}")]
    Rejected(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<SupabaseError> for WriteError {
    fn from(value: SupabaseError) -> Self {
        if value.is_row_level() {
            WriteError::Rejected(value.to_string())
        } else {
            WriteError::Unavailable(value.to_string())
        }
    }
}

/// Stable per-row key derived from the upsert columns, so a replayed write
/// carries the same key as the original.
pub fn idempotency_key(owner_id: &str, lookup_key: &str, supplier_id: &str) -> String {
    URL_SAFE_NO_PAD.encode(format!("{owner_id}\u{1f}{lookup_key}\u{1f}{supplier_id}"))
}

/// Persists scored records. Implementations upsert on
/// `(owner_id, lookup_key, supplier_id)` and report one outcome per record,
/// in input order, so a single bad row never hides the rest.
#[async_trait]
pub trait ResultWriter: Send + Sync {
    async fn upsert(&self, records: &[AnalysisRecord]) -> Vec<Result<(), WriteError>>;

    /// Best-effort copy of the job row for external observers.
    async fn mirror_job(&self, _job: &Job) -> Result<(), WriteError> {
        Ok(())
    }
}

type RowKey = (String, String, String);

fn row_key(record: &AnalysisRecord) -> RowKey {
    (
        record.owner_id.clone(),
        record.result.lookup_key.clone(),
        record.supplier_id.clone(),
    )
}

/// In-process store used when no database is configured, and in tests.
#[derive(Default)]
pub struct MemoryWriter {
    rows: Mutex<HashMap<RowKey, AnalysisRecord>>,
    jobs: Mutex<HashMap<Uuid, Job>>,
    failing_keys: HashSet<String>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows for these lookup keys are rejected on every write.
    pub fn failing_on<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failing_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub async fn records(&self) -> Vec<AnalysisRecord> {
        self.rows.lock().await.values().cloned().collect()
    }

    pub async fn record_for(&self, owner_id: &str, lookup_key: &str) -> Option<AnalysisRecord> {
        self.rows
            .lock()
            .await
            .values()
            .find(|row| row.owner_id == owner_id && row.result.lookup_key == lookup_key)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn job(&self, id: Uuid) -> Option<Job> {
        self.jobs.lock().await.get(&id).cloned()
    }
}

#[async_trait]
impl ResultWriter for MemoryWriter {
    async fn upsert(&self, records: &[AnalysisRecord]) -> Vec<Result<(), WriteError>> {
        let mut rows = self.rows.lock().await;
        records
            .iter()
            .map(|record| {
                if self.failing_keys.contains(&record.result.lookup_key) {
                    return Err(WriteError::Rejected(format!(
                        "row {} rejected",
                        record.result.lookup_key
                    )));
                }
                rows.insert(row_key(record), record.clone());
                Ok(())
            })
            .collect()
    }

    async fn mirror_job(&self, job: &Job) -> Result<(), WriteError> {
        self.jobs.lock().await.insert(job.id, job.clone());
        Ok(())
    }
}

/// PostgREST-backed writer. Writes each batch in one request; if the store
/// rejects the batch, rows are retried one by one to isolate the bad ones.
pub struct SupabaseWriter {
    client: SupabaseClient,
}

impl SupabaseWriter {
    pub fn new(client: SupabaseClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResultWriter for SupabaseWriter {
    async fn upsert(&self, records: &[AnalysisRecord]) -> Vec<Result<(), WriteError>> {
        match self.client.upsert_analyses(records).await {
            Ok(()) => {
                debug!(target = "sourcing.writer", rows = records.len(), "batch_upserted");
                records.iter().map(|_| Ok(())).collect()
            }
            Err(err) if err.is_row_level() && records.len() > 1 => {
                warn!(
                    target = "sourcing.writer",
                    rows = records.len(),
                    error = %err,
                    "batch_upsert_rejected_retrying_rows"
                );
                let mut outcomes = Vec::with_capacity(records.len());
                for record in records {
                    let outcome = self
                        .client
                        .upsert_analyses(std::slice::from_ref(record))
                        .await
                        .map_err(WriteError::from);
                    outcomes.push(outcome);
                }
                outcomes
            }
            Err(err) => {
                warn!(target = "sourcing.writer", rows = records.len(), error = %err, "batch_upsert_failed");
                let err = WriteError::from(err);
                records.iter().map(|_| Err(err.clone())).collect()
            }
        }
    }

    async fn mirror_job(&self, job: &Job) -> Result<(), WriteError> {
        self.client.upsert_job(job).await.map_err(WriteError::from)
    }
}
