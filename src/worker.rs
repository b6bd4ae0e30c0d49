//! Translation worker: translates exactly one chunk per invocation, honoring
//! the rate limiter, and persists the result idempotently. Re-running the
//! same `(job, index)` overwrites the artifact (last write wins) and never
//! double-credits the progress counter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::WorkerError;
use crate::job::JobRecord;
use crate::limiter::{Admission, RateLimiter};
use crate::llm::{LlmClient, TranslationRequest, prompts};
use crate::store::{ChunkCredit, JobStore, ObjectStore, StoreError};
use crate::token::TokenCounter;

/// Outcome of one successful chunk translation.
#[derive(Debug, Clone, Copy)]
pub struct TranslationResult {
    pub output_tokens: u64,
    pub latency_ms: u64,
}

pub struct TranslationWorker {
    jobs: Arc<dyn JobStore>,
    objects: Arc<dyn ObjectStore>,
    limiter: Arc<RateLimiter>,
    client: Arc<LlmClient>,
    counter: TokenCounter,
    account: String,
    output_token_ratio: f64,
    rate_limit_max_retries: u32,
    /// Horizon handed to the limiter as the acquire deadline; a chunk may
    /// not wait on capacity longer than its total time budget.
    acquire_horizon: Duration,
}

impl TranslationWorker {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        objects: Arc<dyn ObjectStore>,
        limiter: Arc<RateLimiter>,
        client: Arc<LlmClient>,
        config: &Config,
    ) -> Self {
        Self {
            jobs,
            objects,
            limiter,
            client,
            counter: TokenCounter::new(),
            account: config.account.clone(),
            output_token_ratio: config.pipeline.output_token_ratio,
            rate_limit_max_retries: config.pipeline.rate_limit_max_retries,
            acquire_horizon: config.pipeline.chunk_total_timeout(),
        }
    }

    /// Translate one chunk end to end: load inputs, reserve rate-limit
    /// capacity, call the LLM, write the artifact, credit the job.
    pub async fn translate_chunk(
        &self,
        job_id: &str,
        chunk_index: u32,
    ) -> Result<TranslationResult, WorkerError> {
        let started = Instant::now();

        let descriptor = self
            .jobs
            .descriptor(job_id, chunk_index)
            .await
            .map_err(|e| WorkerError::Transient(format!("job store read failed: {}", e)))?
            .ok_or_else(|| {
                WorkerError::Permanent(format!(
                    "no chunk descriptor for job {} index {}",
                    job_id, chunk_index
                ))
            })?;

        let job = self.load_job(job_id).await?;
        let target_language = job.target_language.clone().ok_or_else(|| {
            WorkerError::Permanent(format!("job {} has no target language", job_id))
        })?;

        let source_bytes = self
            .objects
            .get(&descriptor.source_key)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(key) => {
                    WorkerError::Permanent(format!("chunk source missing: {}", key))
                }
                other => WorkerError::Transient(format!("chunk source read failed: {}", other)),
            })?;
        let source = String::from_utf8(source_bytes)
            .map_err(|_| WorkerError::Permanent("chunk source is not valid UTF-8".to_string()))?;

        let request = TranslationRequest {
            target_language,
            tone: job.tone,
            previous_summary: descriptor.previous_summary.clone(),
            source,
        };

        // Charge the limiter for the prompt as the provider will see it.
        let prompt = format!(
            "{}\n{}",
            prompts::translation_system_prompt(&request.target_language, request.tone),
            prompts::translation_user_prompt(&request.previous_summary, &request.source),
        );
        let tokens_in = self.counter.count(&prompt) as u64;
        let tokens_out = (tokens_in as f64 * self.output_token_ratio).ceil() as u64;

        self.acquire_admission(job_id, tokens_in, tokens_out)
            .await?;

        // A job failed or canceled while we waited must not burn quota.
        self.check_job_active(job_id).await?;

        let output = self.client.translate(&request).await.map_err(|e| {
            if e.is_transient() {
                WorkerError::Transient(e.to_string())
            } else {
                WorkerError::Permanent(e.to_string())
            }
        })?;

        self.limiter
            .release(
                &self.account,
                tokens_in + tokens_out,
                output.input_tokens + output.output_tokens,
            )
            .await;

        self.objects
            .put(&descriptor.output_key, output.text.as_bytes())
            .await
            .map_err(|e| WorkerError::Transient(format!("artifact write failed: {}", e)))?;

        match self
            .jobs
            .credit_chunk(job_id, chunk_index, output.input_tokens, output.output_tokens)
            .await
        {
            Ok(ChunkCredit::Applied) => {}
            Ok(ChunkCredit::AlreadyCredited) => {
                debug!(
                    "chunk {} of job {} was already credited (duplicate delivery)",
                    chunk_index, job_id
                );
            }
            Err(e) => {
                return Err(WorkerError::Transient(format!(
                    "progress update failed: {}",
                    e
                )));
            }
        }

        debug!(
            "translated chunk {} of job {} ({} tokens out, {} ms)",
            chunk_index,
            job_id,
            output.output_tokens,
            started.elapsed().as_millis()
        );

        Ok(TranslationResult {
            output_tokens: output.output_tokens,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn acquire_admission(
        &self,
        job_id: &str,
        tokens_in: u64,
        tokens_out: u64,
    ) -> Result<(), WorkerError> {
        let mut attempt = 0;
        loop {
            let deadline = Utc::now()
                + ChronoDuration::from_std(self.acquire_horizon)
                    .unwrap_or_else(|_| ChronoDuration::seconds(600));
            match self
                .limiter
                .acquire(&self.account, tokens_in, tokens_out, deadline)
                .await
            {
                Admission::Granted => return Ok(()),
                Admission::RetryAfter(wait) => {
                    attempt += 1;
                    if attempt > self.rate_limit_max_retries {
                        return Err(WorkerError::Transient(format!(
                            "rate-limit capacity not granted after {} attempts",
                            attempt
                        )));
                    }
                    // Do not sleep out a wait on behalf of a dead job.
                    self.check_job_active(job_id).await?;
                    warn!(
                        "rate limited; chunk of job {} waiting {:?} (attempt {})",
                        job_id, wait, attempt
                    );
                    tokio::time::sleep(with_jitter(wait)).await;
                }
                Admission::Denied => {
                    return Err(WorkerError::Transient(
                        "rate limiter denied admission".to_string(),
                    ));
                }
            }
        }
    }

    async fn check_job_active(&self, job_id: &str) -> Result<(), WorkerError> {
        let job = self.load_job(job_id).await?;
        if job.state.is_terminal() {
            return Err(WorkerError::Permanent(format!(
                "job {} is {}; aborting before LLM call",
                job_id, job.state
            )));
        }
        Ok(())
    }

    async fn load_job(&self, job_id: &str) -> Result<JobRecord, WorkerError> {
        self.jobs
            .get(job_id)
            .await
            .map_err(|e| WorkerError::Transient(format!("job store read failed: {}", e)))?
            .ok_or_else(|| WorkerError::Permanent(format!("unknown job {}", job_id)))
    }
}

/// Exponential backoff for transient chunk failures: `min(2^attempt, 32)`
/// seconds over `base`, plus jitter. With the default three-attempt budget
/// this yields roughly 2s, 4s, 8s.
pub(crate) fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let factor = 2u64.saturating_pow(attempt.min(6)).min(32);
    with_jitter(base.saturating_mul(factor as u32))
}

/// Add up to 25% random jitter so synchronized retries fan out.
pub(crate) fn with_jitter(d: Duration) -> Duration {
    let quarter = (d.as_millis() as u64 / 4).max(1);
    let jitter = rand::rng().random_range(0..=quarter);
    d + Duration::from_millis(jitter)
}
