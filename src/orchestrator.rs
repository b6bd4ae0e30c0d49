//! Orchestrator: drives a job through its state machine with durable,
//! conditional transitions and a bounded parallel fan-out over chunks.
//!
//! Every transition is a compare-and-swap on the job record, so duplicate
//! triggers lose the race and exit instead of double-driving a job. No
//! transition moves backward; retries re-drive the same forward edge.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::chunker::Chunker;
use crate::config::Config;
use crate::error::{PipelineError, WorkerError};
use crate::job::{ErrorDescriptor, JobRecord, JobState, Tone, keys, validate_language_tag};
use crate::store::{JobStore, ObjectStore, StoreError};
use crate::worker::{TranslationWorker, backoff_delay};

pub const MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;
pub const UPLOAD_CONTENT_TYPE: &str = "text/plain";

const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

pub struct Orchestrator {
    jobs: Arc<dyn JobStore>,
    objects: Arc<dyn ObjectStore>,
    worker: Arc<TranslationWorker>,
    chunker: Chunker,
    max_concurrency: usize,
    chunk_max_attempts: u32,
    chunk_total_timeout: Duration,
    job_total_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        objects: Arc<dyn ObjectStore>,
        worker: Arc<TranslationWorker>,
        config: &Config,
    ) -> Self {
        let chunker = Chunker::new(objects.clone(), &config.pipeline);
        Self {
            jobs,
            objects,
            worker,
            chunker,
            max_concurrency: config.pipeline.max_concurrency.clamp(1, 20),
            chunk_max_attempts: config.pipeline.chunk_max_attempts.max(1),
            chunk_total_timeout: config.pipeline.chunk_total_timeout(),
            job_total_timeout: config.pipeline.job_total_timeout(),
        }
    }

    /// Register a new job in `PendingUpload`, before its object exists.
    pub async fn register_job(&self, owner: &str) -> Result<JobRecord, PipelineError> {
        if owner.is_empty() {
            return Err(PipelineError::Validation("owner must not be empty".into()));
        }
        let job = JobRecord::new(owner);
        self.jobs.create(job.clone()).await?;
        debug!("registered job {} for {}", job.job_id, owner);
        Ok(job)
    }

    /// Upload-completion signal: validate the uploaded object, copy it to
    /// `documents/{job_id}` and move the job to `Uploaded`. Events for
    /// unknown jobs are dropped (returns `None`).
    pub async fn handle_upload_event(
        &self,
        job_id: &str,
        content_type: &str,
    ) -> Result<Option<JobRecord>, PipelineError> {
        let Some(job) = self.jobs.get(job_id).await? else {
            warn!("upload event for unknown job {}; dropping", job_id);
            return Ok(None);
        };
        if job.state != JobState::PendingUpload {
            debug!(
                "duplicate upload event for job {} in {}; ignoring",
                job_id, job.state
            );
            return Ok(Some(job));
        }

        if let Err(message) = self.validate_upload(job_id, content_type).await {
            let error = ErrorDescriptor::new("validation", &message);
            self.jobs
                .fail(job_id, JobState::ValidationFailed, error)
                .await?;
            return Err(PipelineError::Validation(message));
        }

        let bytes = self.objects.get(&keys::upload(job_id)).await?;
        self.objects.put(&keys::document(job_id), &bytes).await?;

        self.jobs
            .transition(job_id, JobState::PendingUpload, JobState::Uploaded)
            .await?;
        info!("job {} uploaded ({} bytes)", job_id, bytes.len());
        self.require(job_id).await.map(Some)
    }

    async fn validate_upload(&self, job_id: &str, content_type: &str) -> Result<(), String> {
        if content_type != UPLOAD_CONTENT_TYPE {
            return Err(format!(
                "unsupported content type {:?}; only text/plain is accepted",
                content_type
            ));
        }
        let size = self
            .objects
            .size(&keys::upload(job_id))
            .await
            .map_err(|_| "uploaded object not found".to_string())?;
        if size == 0 {
            return Err("uploaded document is empty".to_string());
        }
        if size > MAX_UPLOAD_BYTES {
            return Err(format!(
                "uploaded document is {} bytes, above the {} byte limit",
                size, MAX_UPLOAD_BYTES
            ));
        }
        Ok(())
    }

    /// Accept a translation request: validates the target, wins (or loses)
    /// the `Uploaded → Chunking` race, and records language and tone.
    /// Returns without driving the pipeline; call [`drive`](Self::drive).
    pub async fn start_translation(
        &self,
        job_id: &str,
        target_language: &str,
        tone: Tone,
    ) -> Result<JobRecord, PipelineError> {
        if !validate_language_tag(target_language) {
            return Err(PipelineError::Validation(format!(
                "invalid target language tag {:?}",
                target_language
            )));
        }

        self.require(job_id).await?;
        if !self
            .jobs
            .transition(job_id, JobState::Uploaded, JobState::Chunking)
            .await?
        {
            let current = self.require(job_id).await?;
            return Err(PipelineError::IllegalState {
                from: current.state,
                to: JobState::Chunking,
            });
        }

        self.jobs
            .set_translation_request(job_id, target_language, tone)
            .await?;
        info!(
            "job {} accepted for translation into {} ({})",
            job_id, target_language, tone
        );
        self.require(job_id).await
    }

    /// Drive the job forward from its current state until it reaches a
    /// terminal state or there is nothing to do. A job that fails inside
    /// the pipeline is returned in its failed state rather than as an `Err`;
    /// `Err` is reserved for request-level problems.
    pub async fn drive(&self, job_id: &str) -> Result<JobRecord, PipelineError> {
        let job = self.require(job_id).await?;
        match job.state {
            JobState::Chunking => {
                if let Err(e) = self.run_chunk_phase(job_id).await {
                    warn!("job {} failed during chunking: {}", job_id, e);
                    return self.require(job_id).await;
                }
                self.run_translate_phase(job_id).await
            }
            JobState::Chunked | JobState::Translating => self.run_translate_phase(job_id).await,
            _ => Ok(job),
        }
    }

    async fn run_chunk_phase(&self, job_id: &str) -> Result<(), PipelineError> {
        let result = match self.objects.reader(&keys::document(job_id)).await {
            Ok(reader) => self.chunker.chunk(job_id, reader).await,
            Err(e) => Err(crate::error::ChunkingError::Storage(e)),
        };

        match result {
            Ok(plan) => {
                let applied = self
                    .jobs
                    .set_chunked(job_id, plan.total_tokens, plan.descriptors)
                    .await?;
                if !applied {
                    debug!("job {} left Chunking concurrently; yielding", job_id);
                    return Ok(());
                }
                info!(
                    "job {} chunked into {} chunks ({} tokens)",
                    job_id, plan.total_chunks, plan.total_tokens
                );
                Ok(())
            }
            Err(e) => {
                // Partial chunk files are garbage after a failed run.
                let _ = self
                    .objects
                    .delete_prefix(&keys::chunk_prefix(job_id))
                    .await;
                let _ = self
                    .jobs
                    .fail(
                        job_id,
                        JobState::ChunkingFailed,
                        ErrorDescriptor::new("chunking", e.to_string()),
                    )
                    .await;
                Err(PipelineError::Chunking(e))
            }
        }
    }

    async fn run_translate_phase(&self, job_id: &str) -> Result<JobRecord, PipelineError> {
        let job = self.require(job_id).await?;
        match job.state {
            JobState::Chunked => {
                if !self
                    .jobs
                    .transition(job_id, JobState::Chunked, JobState::Translating)
                    .await?
                {
                    // Another orchestrator won the race; let it drive.
                    return self.require(job_id).await;
                }
            }
            JobState::Translating => {}
            other => {
                return Err(PipelineError::IllegalState {
                    from: other,
                    to: JobState::Translating,
                });
            }
        }

        let total = job.total_chunks.ok_or_else(|| {
            PipelineError::Permanent(format!("job {} has no chunk plan", job_id))
        })?;

        // Recovery after a crash: only missing indices are scheduled; the
        // idempotent artifact writes make re-runs safe.
        let done: BTreeSet<u32> = self
            .objects
            .list(&keys::translated_prefix(job_id))
            .await?
            .iter()
            .filter_map(|k| keys::translated_index(k))
            .collect();
        let missing: Vec<u32> = (0..total).filter(|i| !done.contains(i)).collect();
        if !done.is_empty() {
            info!(
                "job {}: {} of {} chunks already translated; scheduling {}",
                job_id,
                done.len(),
                total,
                missing.len()
            );
        }

        if tokio::time::timeout(self.job_total_timeout, self.fan_out(job_id, missing))
            .await
            .is_err()
        {
            let _ = self
                .jobs
                .fail(
                    job_id,
                    JobState::Failed,
                    ErrorDescriptor::new(
                        "permanent",
                        format!("job exceeded total budget of {:?}", self.job_total_timeout),
                    ),
                )
                .await;
            return self.require(job_id).await;
        }

        let job = self.require(job_id).await?;
        if job.state != JobState::Translating {
            // A chunk failed permanently (or the job was canceled) while the
            // pool drained; successful artifacts stay, no result is built.
            return Ok(job);
        }

        self.assemble(job_id, total).await?;
        self.jobs.complete(job_id, Utc::now()).await?;
        info!("job {} completed ({} chunks)", job_id, total);
        self.require(job_id).await
    }

    /// Bounded fan-out: at most `max_concurrency` chunk translations are in
    /// flight; when one finishes the next queued index starts. Completion
    /// order is irrelevant, assembly re-establishes it by index.
    async fn fan_out(&self, job_id: &str, indices: Vec<u32>) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = Vec::new();

        for index in indices {
            // Stop dispatching once the job leaves Translating; in-flight
            // chunks finish their current call and exit on their own.
            match self.jobs.get(job_id).await {
                Ok(Some(job)) if job.state == JobState::Translating => {}
                _ => break,
            }

            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let worker = self.worker.clone();
            let jobs = self.jobs.clone();
            let job_id = job_id.to_string();
            let max_attempts = self.chunk_max_attempts;
            let chunk_total_timeout = self.chunk_total_timeout;

            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) =
                    drive_chunk(&worker, &jobs, &job_id, index, max_attempts, chunk_total_timeout)
                        .await
                {
                    // First permanent failure wins; `fail` refuses once the
                    // job is already terminal.
                    warn!("chunk {} of job {} failed: {}", index, job_id, e);
                    let _ = jobs
                        .fail(&job_id, JobState::Failed, e.descriptor())
                        .await;
                }
            }));
        }

        for task in tasks {
            if let Err(e) = task.await {
                warn!("chunk task panicked: {}", e);
            }
        }
    }

    /// Concatenate translated chunks in index order into `results/{job_id}`.
    async fn assemble(&self, job_id: &str, total: u32) -> Result<(), PipelineError> {
        let mut out: Vec<u8> = Vec::new();
        for index in 0..total {
            let bytes = self
                .objects
                .get(&keys::translated(job_id, index))
                .await
                .map_err(|e| {
                    PipelineError::Permanent(format!(
                        "artifact for chunk {} missing at assembly: {}",
                        index, e
                    ))
                })?;
            if index > 0 {
                out.extend_from_slice(b"\n\n");
            }
            out.extend_from_slice(&bytes);
        }
        self.objects.put(&keys::result(job_id), &out).await?;
        Ok(())
    }

    /// Operator cancellation: in-flight workers notice before their next
    /// LLM call; their completed writes remain (idempotent and harmless).
    pub async fn cancel(&self, job_id: &str) -> Result<JobRecord, PipelineError> {
        self.jobs
            .fail(
                job_id,
                JobState::Canceled,
                ErrorDescriptor::new("canceled", "job canceled by operator"),
            )
            .await?;
        self.require(job_id).await
    }

    /// Operator reset of a failed job: delete all derived artifacts and
    /// return the job to `Uploaded` so it can be re-driven from scratch.
    pub async fn reset(&self, job_id: &str) -> Result<JobRecord, PipelineError> {
        reset_job(self.jobs.as_ref(), self.objects.as_ref(), job_id).await
    }

    /// Owner-checked job lookup for the status surface.
    pub async fn job_status(&self, job_id: &str, owner: &str) -> Result<JobRecord, PipelineError> {
        let job = self.require(job_id).await?;
        if job.owner != owner {
            return Err(PipelineError::Authorization);
        }
        Ok(job)
    }

    pub async fn list_jobs(&self, owner: &str) -> Result<Vec<JobRecord>, PipelineError> {
        Ok(self.jobs.list_by_owner(owner).await?)
    }

    async fn require(&self, job_id: &str) -> Result<JobRecord, PipelineError> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or_else(|| PipelineError::Store(StoreError::UnknownJob(job_id.to_string())))
    }
}

/// Reset a failed job back to `Uploaded`, deleting its chunks, artifacts,
/// and assembled result. Free-standing so operator tooling can call it
/// without building a full orchestrator (no LLM client required).
pub async fn reset_job(
    jobs: &dyn JobStore,
    objects: &dyn ObjectStore,
    job_id: &str,
) -> Result<JobRecord, PipelineError> {
    let job = jobs
        .get(job_id)
        .await?
        .ok_or_else(|| PipelineError::Store(StoreError::UnknownJob(job_id.to_string())))?;
    if !matches!(job.state, JobState::Failed | JobState::ChunkingFailed) {
        return Err(PipelineError::IllegalState {
            from: job.state,
            to: JobState::Uploaded,
        });
    }

    objects.delete_prefix(&keys::chunk_prefix(job_id)).await?;
    objects
        .delete_prefix(&keys::translated_prefix(job_id))
        .await?;
    objects.delete_prefix(&keys::result(job_id)).await?;

    if !jobs.reset_to_uploaded(job_id).await? {
        let current = jobs
            .get(job_id)
            .await?
            .ok_or_else(|| PipelineError::Store(StoreError::UnknownJob(job_id.to_string())))?;
        return Err(PipelineError::IllegalState {
            from: current.state,
            to: JobState::Uploaded,
        });
    }
    info!("job {} reset to uploaded", job_id);
    jobs.get(job_id)
        .await?
        .ok_or_else(|| PipelineError::Store(StoreError::UnknownJob(job_id.to_string())))
}

/// Run one chunk through the worker with the per-item retry budget and
/// total-time bound. Only permanent outcomes surface: an exhausted
/// transient budget is converted to a permanent, job-fatal error here.
async fn drive_chunk(
    worker: &TranslationWorker,
    jobs: &Arc<dyn JobStore>,
    job_id: &str,
    index: u32,
    max_attempts: u32,
    total_timeout: Duration,
) -> Result<(), PipelineError> {
    let attempts = async {
        let mut attempt = 0;
        loop {
            attempt += 1;

            // Abort between attempts if the job is no longer active.
            match jobs.get(job_id).await {
                Ok(Some(job)) if job.state == JobState::Translating => {}
                Ok(_) => return Ok(()),
                Err(e) => {
                    return Err(PipelineError::Permanent(format!(
                        "job state unreadable: {}",
                        e
                    )));
                }
            }

            match worker.translate_chunk(job_id, index).await {
                Ok(_) => return Ok(()),
                Err(WorkerError::Permanent(message)) => {
                    return Err(PipelineError::Permanent(message));
                }
                Err(WorkerError::Transient(message)) => {
                    if attempt >= max_attempts {
                        return Err(PipelineError::Permanent(format!(
                            "chunk {} exhausted {} attempts: {}",
                            index, max_attempts, message
                        )));
                    }
                    let delay = backoff_delay(attempt, RETRY_BASE_DELAY);
                    debug!(
                        "chunk {} of job {} transient failure (attempt {}): {}; backing off {:?}",
                        index, job_id, attempt, message, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    };

    match tokio::time::timeout(total_timeout, attempts).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::Permanent(format!(
            "chunk {} exceeded its total budget of {:?}",
            index, total_timeout
        ))),
    }
}
