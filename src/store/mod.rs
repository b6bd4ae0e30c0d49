pub mod fs;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::job::{ChunkDescriptor, ErrorDescriptor, JobRecord, JobState, Tone};

/// Storage failures, shared by all ports.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("job not found: {0}")]
    UnknownJob(String),
    #[error("storage I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage backend failure: {0}")]
    Backend(String),
    #[error("storage serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Narrow port over the object store. Writes are whole-object and atomic:
/// a reader sees either the complete object or nothing.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Streaming read, used by the chunker so the source document is never
    /// loaded whole.
    async fn reader(&self, key: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>, StoreError>;

    async fn size(&self, key: &str) -> Result<u64, StoreError>;

    /// Keys under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StoreError>;
}

/// Outcome of crediting a translated chunk against the job counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkCredit {
    Applied,
    /// A concurrent or earlier delivery already credited this chunk; the
    /// counters were not touched again.
    AlreadyCredited,
}

/// Narrow port over the job store. Mutations are conditional writes; a
/// `false` return means the caller lost the race and must re-read.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: JobRecord) -> Result<(), StoreError>;

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError>;

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<JobRecord>, StoreError>;

    /// Compare-and-swap state transition. Returns `false` when the job is
    /// not currently in `from`.
    async fn transition(&self, job_id: &str, from: JobState, to: JobState)
    -> Result<bool, StoreError>;

    /// Record the requested target language and tone.
    async fn set_translation_request(
        &self,
        job_id: &str,
        target_language: &str,
        tone: Tone,
    ) -> Result<(), StoreError>;

    /// Atomically persist the chunk plan and move `Chunking → Chunked`:
    /// total count, source token total, zeroed progress counter, and the
    /// full descriptor set. Returns `false` if the job left `Chunking`.
    async fn set_chunked(
        &self,
        job_id: &str,
        total_source_tokens: u64,
        descriptors: Vec<ChunkDescriptor>,
    ) -> Result<bool, StoreError>;

    async fn descriptor(
        &self,
        job_id: &str,
        index: u32,
    ) -> Result<Option<ChunkDescriptor>, StoreError>;

    /// Credit one translated chunk: bump `translated_chunks` and the token
    /// aggregates exactly once per `(job, index)`. Duplicate deliveries get
    /// `AlreadyCredited` and leave the counters alone.
    async fn credit_chunk(
        &self,
        job_id: &str,
        index: u32,
        tokens_in: u64,
        tokens_out: u64,
    ) -> Result<ChunkCredit, StoreError>;

    /// Terminal success: `Translating → Completed`, with
    /// `translated_chunks` forced to `total_chunks` (the orchestrator's
    /// terminal write is the source of truth for completion).
    async fn complete(&self, job_id: &str, completed_at: DateTime<Utc>)
    -> Result<bool, StoreError>;

    /// Terminal failure into `to` (one of the failed/canceled states) with
    /// an error descriptor. No-op returning `false` if already terminal.
    async fn fail(
        &self,
        job_id: &str,
        to: JobState,
        error: ErrorDescriptor,
    ) -> Result<bool, StoreError>;

    /// Operator reset of a failed job back to `Uploaded`, clearing chunk
    /// plan, counters, and error. Returns `false` unless the job is in
    /// `Failed` or `ChunkingFailed`.
    async fn reset_to_uploaded(&self, job_id: &str) -> Result<bool, StoreError>;
}

/// One rate-limit bucket: current charge, window end, and an optimistic
/// concurrency version.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketState {
    pub count: u64,
    pub window_reset_at: DateTime<Utc>,
    pub version: u64,
}

/// A conditional bucket write. `expected_version: None` asserts the bucket
/// does not exist yet.
#[derive(Debug, Clone)]
pub struct BucketWrite {
    pub key: String,
    pub expected_version: Option<u64>,
    pub next: BucketState,
}

/// Strongly-consistent key-value port backing the distributed rate limiter.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Single consistent read of all requested buckets, in request order.
    async fn read_buckets(&self, keys: &[String]) -> Result<Vec<Option<BucketState>>, StoreError>;

    /// All-or-nothing conditional write. Returns `false` when any version
    /// check fails; no bucket is modified in that case.
    async fn write_buckets(&self, writes: Vec<BucketWrite>) -> Result<bool, StoreError>;
}
