//! Typed error taxonomy of the pipeline.
//!
//! The worker reduces everything it sees to transient-or-permanent; the
//! orchestrator converts an exhausted transient budget into a job-level
//! permanent failure. User-visible surfaces get the stable `kind` tag and a
//! human message, never upstream payloads.

use thiserror::Error;

use crate::job::{ErrorDescriptor, JobState};
use crate::store::StoreError;

/// Failure while turning a source document into a chunk plan. Job-fatal and
/// never retried.
#[derive(Debug, Error)]
pub enum ChunkingError {
    #[error("source document is empty")]
    EmptySource,
    #[error("source is not valid UTF-8 at byte offset {offset}")]
    InvalidEncoding { offset: u64 },
    #[error("storage failure during chunking: {0}")]
    Storage(#[from] StoreError),
}

/// Outcome classification for a single chunk translation.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Upstream 429/5xx, timeout, rate-limiter starvation, storage hiccup.
    /// Retryable within the orchestrator's per-chunk budget.
    #[error("transient: {0}")]
    Transient(String),
    /// Upstream 4xx other than 429, malformed response, missing inputs.
    /// Fails the chunk (and, through the orchestrator, the job).
    #[error("permanent: {0}")]
    Permanent(String),
}

impl WorkerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WorkerError::Transient(_))
    }
}

/// Job-level error surface.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("caller cannot act on this job")]
    Authorization,
    #[error("illegal transition from {from} to {to}")]
    IllegalState { from: JobState, to: JobState },
    #[error(transparent)]
    Chunking(#[from] ChunkingError),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// Stable kind tag recorded in job error descriptors and returned by
    /// the status surface.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation",
            PipelineError::Authorization => "authorization",
            PipelineError::IllegalState { .. } => "illegal_state",
            PipelineError::Chunking(_) => "chunking",
            PipelineError::Transient(_) => "transient",
            PipelineError::Permanent(_) => "permanent",
            PipelineError::Store(_) => "storage",
        }
    }

    pub fn descriptor(&self) -> ErrorDescriptor {
        ErrorDescriptor::new(self.kind(), self.to_string())
    }
}

impl From<WorkerError> for PipelineError {
    fn from(e: WorkerError) -> Self {
        match e {
            WorkerError::Transient(msg) => PipelineError::Transient(msg),
            WorkerError::Permanent(msg) => PipelineError::Permanent(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_are_stable() {
        assert_eq!(PipelineError::Validation("x".into()).kind(), "validation");
        assert_eq!(
            PipelineError::Chunking(ChunkingError::EmptySource).kind(),
            "chunking"
        );
        assert_eq!(PipelineError::Permanent("x".into()).kind(), "permanent");
        assert_eq!(
            PipelineError::IllegalState {
                from: JobState::Uploaded,
                to: JobState::Completed,
            }
            .kind(),
            "illegal_state"
        );
    }

    #[test]
    fn test_descriptor_carries_kind_and_message() {
        let descriptor = PipelineError::Permanent("provider rejected chunk".into()).descriptor();
        assert_eq!(descriptor.kind, "permanent");
        assert!(descriptor.message.contains("provider rejected chunk"));
    }

    #[test]
    fn test_worker_error_classification() {
        assert!(WorkerError::Transient("429".into()).is_transient());
        assert!(!WorkerError::Permanent("400".into()).is_transient());
    }
}
