use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle states of a translation job.
///
/// Transitions only move forward through the graph below; terminal states
/// are immutable except for cleanup.
///
/// ```text
/// PendingUpload → Uploaded → Chunking → Chunked → Translating → Completed
///                    │           │          │           │
///                    │           │          │           └→ Failed
///                    │           │          └→ Failed
///                    │           └→ ChunkingFailed
///                    └→ ValidationFailed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    PendingUpload,
    Uploaded,
    Chunking,
    Chunked,
    Translating,
    Completed,
    Failed,
    ChunkingFailed,
    ValidationFailed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed
                | JobState::Failed
                | JobState::ChunkingFailed
                | JobState::ValidationFailed
                | JobState::Canceled
        )
    }

    /// Whether `self → to` is a legal forward transition.
    pub fn can_transition_to(&self, to: JobState) -> bool {
        use JobState::*;
        match (self, to) {
            (PendingUpload, Uploaded) => true,
            (PendingUpload, ValidationFailed) => true,
            (Uploaded, Chunking) => true,
            (Chunking, Chunked) => true,
            (Chunking, ChunkingFailed) => true,
            (Chunked, Translating) => true,
            (Chunked, Failed) => true,
            (Translating, Completed) => true,
            (Translating, Failed) => true,
            // Operator cancellation is allowed from any non-terminal state.
            (from, Canceled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::PendingUpload => "pending_upload",
            JobState::Uploaded => "uploaded",
            JobState::Chunking => "chunking",
            JobState::Chunked => "chunked",
            JobState::Translating => "translating",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::ChunkingFailed => "chunking_failed",
            JobState::ValidationFailed => "validation_failed",
            JobState::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

/// Requested register of the translated output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Formal,
    Informal,
    #[default]
    Neutral,
}

impl std::fmt::Display for Tone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tone::Formal => write!(f, "formal"),
            Tone::Informal => write!(f, "informal"),
            Tone::Neutral => write!(f, "neutral"),
        }
    }
}

/// Stable error descriptor recorded on failed jobs and surfaced by the
/// status API. Never carries upstream payloads or stack traces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: String,
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

impl ErrorDescriptor {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
            failed_at: Utc::now(),
        }
    }
}

/// One translation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub owner: String,
    pub source_key: String,
    pub target_language: Option<String>,
    pub tone: Tone,
    pub state: JobState,
    /// Set once chunking completes; `None` before `Chunked`.
    pub total_chunks: Option<u32>,
    pub translated_chunks: u32,
    pub total_source_tokens: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<ErrorDescriptor>,
}

impl JobRecord {
    pub fn new(owner: &str) -> Self {
        let job_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        Self {
            source_key: keys::document(&job_id),
            job_id,
            owner: owner.to_string(),
            target_language: None,
            tone: Tone::default(),
            state: JobState::PendingUpload,
            total_chunks: None,
            translated_chunks: 0,
            total_source_tokens: 0,
            tokens_in: 0,
            tokens_out: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        }
    }

    /// Only meaningful once `total_chunks` is set (state `Chunked` onward).
    pub fn progress_percentage(&self) -> Option<f32> {
        self.total_chunks.map(|total| {
            if total == 0 {
                0.0
            } else {
                100.0 * self.translated_chunks as f32 / total as f32
            }
        })
    }
}

/// One unit of translation work, created during chunking and immutable
/// thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub job_id: String,
    /// Dense, 0-based, contiguous within the job.
    pub index: u32,
    pub input_tokens: u64,
    /// Byte range of this chunk in the decoded source document.
    pub byte_start: u64,
    pub byte_end: u64,
    /// Tail context carried from the previous chunk; empty for index 0.
    pub previous_summary: String,
    pub source_key: String,
    pub output_key: String,
}

/// Validate a BCP-47-like language tag: a 2-3 letter primary subtag with
/// optional script/region subtags, e.g. `en`, `pt-BR`, `zh-Hant`.
pub fn validate_language_tag(tag: &str) -> bool {
    use once_cell::sync::Lazy;
    use regex::Regex;

    static LANGUAGE_TAG: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^[a-zA-Z]{2,3}(-[a-zA-Z]{4})?(-[a-zA-Z]{2}|-[0-9]{3})?$")
            .expect("language tag pattern")
    });
    LANGUAGE_TAG.is_match(tag)
}

/// Object-store key layout shared by the chunker, workers, and orchestrator.
pub mod keys {
    pub fn upload(job_id: &str) -> String {
        format!("uploads/{}", job_id)
    }

    pub fn document(job_id: &str) -> String {
        format!("documents/{}", job_id)
    }

    pub fn chunk(job_id: &str, index: u32) -> String {
        format!("chunks/{}/{}", job_id, index)
    }

    pub fn chunk_prefix(job_id: &str) -> String {
        format!("chunks/{}/", job_id)
    }

    pub fn translated(job_id: &str, index: u32) -> String {
        format!("translated/{}/{}", job_id, index)
    }

    pub fn translated_prefix(job_id: &str) -> String {
        format!("translated/{}/", job_id)
    }

    pub fn result(job_id: &str) -> String {
        format!("results/{}", job_id)
    }

    /// Parse the chunk index out of a `translated/{job}/{index}` key.
    pub fn translated_index(key: &str) -> Option<u32> {
        key.rsplit('/').next()?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_allowed() {
        assert!(JobState::PendingUpload.can_transition_to(JobState::Uploaded));
        assert!(JobState::Uploaded.can_transition_to(JobState::Chunking));
        assert!(JobState::Chunking.can_transition_to(JobState::Chunked));
        assert!(JobState::Chunked.can_transition_to(JobState::Translating));
        assert!(JobState::Translating.can_transition_to(JobState::Completed));
        assert!(JobState::Translating.can_transition_to(JobState::Failed));
    }

    #[test]
    fn test_backward_and_skip_transitions_rejected() {
        assert!(!JobState::Chunked.can_transition_to(JobState::Chunking));
        assert!(!JobState::Uploaded.can_transition_to(JobState::Translating));
        assert!(!JobState::Completed.can_transition_to(JobState::Translating));
        assert!(!JobState::PendingUpload.can_transition_to(JobState::Chunking));
    }

    #[test]
    fn test_terminal_states_immutable() {
        for terminal in [
            JobState::Completed,
            JobState::Failed,
            JobState::ChunkingFailed,
            JobState::ValidationFailed,
            JobState::Canceled,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(JobState::Canceled));
            assert!(!terminal.can_transition_to(JobState::Uploaded));
        }
    }

    #[test]
    fn test_cancel_from_any_active_state() {
        assert!(JobState::PendingUpload.can_transition_to(JobState::Canceled));
        assert!(JobState::Chunking.can_transition_to(JobState::Canceled));
        assert!(JobState::Translating.can_transition_to(JobState::Canceled));
    }

    #[test]
    fn test_progress_percentage() {
        let mut job = JobRecord::new("tester");
        assert_eq!(job.progress_percentage(), None);

        job.total_chunks = Some(4);
        job.translated_chunks = 1;
        assert_eq!(job.progress_percentage(), Some(25.0));

        job.translated_chunks = 4;
        assert_eq!(job.progress_percentage(), Some(100.0));
    }

    #[test]
    fn test_language_tag_validation() {
        assert!(validate_language_tag("en"));
        assert!(validate_language_tag("pt-BR"));
        assert!(validate_language_tag("zh-Hant"));
        assert!(validate_language_tag("es-419"));
        assert!(!validate_language_tag(""));
        assert!(!validate_language_tag("english"));
        assert!(!validate_language_tag("en_US"));
        assert!(!validate_language_tag("e"));
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(keys::upload("j1"), "uploads/j1");
        assert_eq!(keys::chunk("j1", 3), "chunks/j1/3");
        assert_eq!(keys::translated("j1", 3), "translated/j1/3");
        assert_eq!(keys::translated_index("translated/j1/17"), Some(17));
        assert_eq!(keys::translated_index("translated/j1/x"), None);
    }

    #[test]
    fn test_job_state_serde_round_trip() {
        let json = serde_json::to_string(&JobState::ChunkingFailed).unwrap();
        assert_eq!(json, "\"chunking_failed\"");
        let back: JobState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, JobState::ChunkingFailed);
    }
}
