use crate::{
    idempotency::{Claim, IdempotencyStore},
    models::{AnalysisRecord, ApiError, CandidateProduct},
    pipeline::{Orchestrator, RunOptions},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    /// Run-level fault before any item was processed.
    Failed,
    Cancelled,
    /// A hard provider error stopped dispatch after some items were processed.
    Paused,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Processing)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobItemError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lookup_key: Option<String>,
    pub stage: String,
    pub message: String,
}

impl JobItemError {
    pub fn item(lookup_key: &str, stage: &str, message: impl Into<String>) -> Self {
        Self {
            lookup_key: Some(lookup_key.to_string()),
            stage: stage.to_string(),
            message: message.into(),
        }
    }

    pub fn run(stage: &str, message: impl Into<String>) -> Self {
        Self {
            lookup_key: None,
            stage: stage.to_string(),
            message: message.into(),
        }
    }
}

/// One orchestration run. `errors` is bounded; `error_count` is not.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub owner_id: String,
    pub status: JobStatus,
    pub total_items: usize,
    pub processed_items: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub errors: Vec<JobItemError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

struct TrackedJob {
    job: Job,
    cancel: Arc<AtomicBool>,
}

/// Process-wide registry of job records, shared by the HTTP layer, the queue
/// worker and the orchestrator.
#[derive(Clone)]
pub struct JobTracker {
    jobs: Arc<Mutex<HashMap<Uuid, TrackedJob>>>,
    max_errors: usize,
}

impl JobTracker {
    pub fn new(max_errors: usize) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            max_errors: max_errors.max(1),
        }
    }

    pub async fn create(&self, owner_id: &str, total_items: usize) -> Job {
        self.create_with_id(Uuid::new_v4(), owner_id, total_items).await
    }

    /// Registers a job under a caller-chosen id, e.g. one already bound to an
    /// idempotency key.
    pub async fn create_with_id(&self, id: Uuid, owner_id: &str, total_items: usize) -> Job {
        let job = Job {
            id,
            owner_id: owner_id.to_string(),
            status: JobStatus::Pending,
            total_items,
            processed_items: 0,
            success_count: 0,
            error_count: 0,
            errors: Vec::new(),
            failure: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let mut guard = self.jobs.lock().await;
        guard.insert(
            job.id,
            TrackedJob {
                job: job.clone(),
                cancel: Arc::new(AtomicBool::new(false)),
            },
        );
        job
    }

    pub async fn get(&self, id: Uuid) -> Option<Job> {
        self.jobs.lock().await.get(&id).map(|tracked| tracked.job.clone())
    }

    /// Jobs are only visible to the owner that submitted them.
    pub async fn get_for_owner(&self, id: Uuid, owner_id: &str) -> Option<Job> {
        self.get(id).await.filter(|job| job.owner_id == owner_id)
    }

    pub async fn cancel_flag(&self, id: Uuid) -> Option<Arc<AtomicBool>> {
        self.jobs
            .lock()
            .await
            .get(&id)
            .map(|tracked| tracked.cancel.clone())
    }

    /// Requests cancellation. A pending job is cancelled outright; a running
    /// one stops dispatching chunks and settles once in-flight work lands.
    pub async fn cancel(&self, id: Uuid, owner_id: &str) -> Option<Job> {
        let mut guard = self.jobs.lock().await;
        let tracked = guard.get_mut(&id).filter(|tracked| tracked.job.owner_id == owner_id)?;
        tracked.cancel.store(true, Ordering::SeqCst);
        if tracked.job.status == JobStatus::Pending {
            tracked.job.status = JobStatus::Cancelled;
            tracked.job.completed_at = Some(Utc::now());
        }
        info!(target = "sourcing.jobs", job_id = %id, status = ?tracked.job.status, "job_cancel_requested");
        Some(tracked.job.clone())
    }

    /// Moves a pending job to `processing`. Returns false if the job is gone or
    /// already terminal (e.g. cancelled while queued).
    pub async fn start(&self, id: Uuid) -> bool {
        let mut guard = self.jobs.lock().await;
        match guard.get_mut(&id) {
            Some(tracked) if tracked.job.status == JobStatus::Pending => {
                tracked.job.status = JobStatus::Processing;
                tracked.job.started_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Folds one written batch into the counters.
    pub async fn record_batch(
        &self,
        id: Uuid,
        successes: usize,
        errors: Vec<JobItemError>,
    ) -> Option<Job> {
        let mut guard = self.jobs.lock().await;
        let tracked = guard.get_mut(&id)?;
        let job = &mut tracked.job;
        let failed = errors.len();
        let room = job.total_items.saturating_sub(job.processed_items);
        if successes + failed > room {
            warn!(
                target = "sourcing.jobs",
                job_id = %id,
                room,
                reported = successes + failed,
                "job_progress_overflow"
            );
        }
        job.success_count += successes;
        job.error_count += failed;
        job.processed_items += successes + failed;
        push_bounded(&mut job.errors, errors, self.max_errors);
        Some(job.clone())
    }

    /// Records a run-level error that is not tied to a processed item.
    pub async fn note(&self, id: Uuid, error: JobItemError) {
        let mut guard = self.jobs.lock().await;
        if let Some(tracked) = guard.get_mut(&id) {
            push_bounded(&mut tracked.job.errors, vec![error], self.max_errors);
        }
    }

    pub async fn finish(&self, id: Uuid, status: JobStatus, failure: Option<String>) -> Option<Job> {
        let mut guard = self.jobs.lock().await;
        let tracked = guard.get_mut(&id)?;
        tracked.job.status = status;
        tracked.job.failure = failure;
        tracked.job.completed_at = Some(Utc::now());
        Some(tracked.job.clone())
    }

    /// Drops a pending record that never reached the queue.
    async fn discard(&self, id: Uuid) {
        let mut guard = self.jobs.lock().await;
        if guard
            .get(&id)
            .is_some_and(|tracked| tracked.job.status == JobStatus::Pending)
        {
            guard.remove(&id);
        }
    }

    /// Evicts terminal jobs that finished more than `retention` ago. Running
    /// and pending jobs are never evicted.
    pub async fn prune_finished(&self, retention: Duration) -> usize {
        let retention =
            chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - retention;
        let mut guard = self.jobs.lock().await;
        let before = guard.len();
        guard.retain(|_, tracked| {
            !(tracked.job.status.is_terminal()
                && tracked.job.completed_at.is_some_and(|done| done <= cutoff))
        });
        before - guard.len()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }
}

fn push_bounded(errors: &mut Vec<JobItemError>, incoming: Vec<JobItemError>, max: usize) {
    let room = max.saturating_sub(errors.len());
    errors.extend(incoming.into_iter().take(room));
}

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<QueuedRun>,
    tracker: JobTracker,
}

struct QueuedRun {
    job_id: Uuid,
    products: Vec<CandidateProduct>,
    options: RunOptions,
}

impl JobQueue {
    pub fn spawn(orchestrator: Orchestrator, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<QueuedRun>(capacity.max(1));
        let tracker = orchestrator.tracker().clone();

        let handle = tokio::spawn(async move {
            while let Some(queued) = rx.recv().await {
                let job_id = queued.job_id;
                match orchestrator
                    .run(job_id, queued.products, queued.options)
                    .await
                {
                    Ok(outcome) => info!(
                        target = "sourcing.jobs",
                        job_id = %job_id,
                        status = ?outcome.job.status,
                        processed = outcome.job.processed_items,
                        "queued_run_finished"
                    ),
                    Err(err) => warn!(
                        target = "sourcing.jobs",
                        job_id = %job_id,
                        stage = err.stage(),
                        error = %err,
                        "queued_run_failed"
                    ),
                }
            }
        });

        (Self { tx, tracker }, handle)
    }

    pub async fn enqueue(
        &self,
        owner_id: &str,
        products: Vec<CandidateProduct>,
        options: RunOptions,
    ) -> Result<Uuid, ApiError> {
        let job = self.tracker.create(owner_id, products.len()).await;
        self.submit(job.id, products, options).await
    }

    /// Queues a run unless `idempotency_key` already started one for this
    /// owner. The job record exists before the key is bound to it, so any id
    /// handed out for the key resolves on `GET /jobs/{id}`.
    pub async fn enqueue_idempotent(
        &self,
        store: &IdempotencyStore,
        owner_id: &str,
        idempotency_key: Option<&str>,
        products: Vec<CandidateProduct>,
        options: RunOptions,
    ) -> Result<Enqueued, ApiError> {
        let Some(key) = idempotency_key else {
            let job_id = self.enqueue(owner_id, products, options).await?;
            return Ok(Enqueued {
                job_id,
                deduplicated: false,
            });
        };

        let job = self.tracker.create(owner_id, products.len()).await;
        if let Claim::Existing(existing) = store.claim(owner_id, key, job.id).await {
            self.tracker.discard(job.id).await;
            info!(target = "sourcing.jobs", owner_id, job_id = %existing, "idempotent_replay");
            return Ok(Enqueued {
                job_id: existing,
                deduplicated: true,
            });
        }
        let job_id = self.submit(job.id, products, options).await?;
        Ok(Enqueued {
            job_id,
            deduplicated: false,
        })
    }

    async fn submit(
        &self,
        job_id: Uuid,
        products: Vec<CandidateProduct>,
        options: RunOptions,
    ) -> Result<Uuid, ApiError> {
        let queued = QueuedRun {
            job_id,
            products,
            options,
        };
        if self.tx.send(queued).await.is_err() {
            self.tracker
                .finish(job_id, JobStatus::Failed, Some("worker not available".into()))
                .await;
            return Err(ApiError {
                error: "queue_send_failed".into(),
                detail: Some("worker not available".into()),
            });
        }
        Ok(job_id)
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    pub job_id: Uuid,
    pub deduplicated: bool,
}

/// Final snapshot of a run plus the records it wrote, when requested.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub job: Job,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<AnalysisRecord>,
}
