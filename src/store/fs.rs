//! Filesystem-backed stores so the CLI can run a whole pipeline locally.
//!
//! Object puts are atomic (temp file in the target directory, then rename);
//! the job store keeps one pretty-printed JSON document per job and
//! serializes read-modify-write cycles behind a process-wide lock.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ChunkCredit, JobStore, ObjectStore, StoreError};
use crate::job::{ChunkDescriptor, ErrorDescriptor, JobRecord, JobState, Tone};

fn safe_path(root: &Path, key: &str) -> Result<PathBuf, StoreError> {
    if key.split('/').any(|part| part.is_empty() || part == "..") {
        return Err(StoreError::Backend(format!("invalid object key: {}", key)));
    }
    Ok(root.join(key))
}

async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::Backend(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(parent).await?;

    let tmp = parent.join(format!(".tmp-{}", Uuid::new_v4()));
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = safe_path(&self.root, key)?;
        atomic_write(&path, bytes).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = safe_path(&self.root, key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn reader(&self, key: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>, StoreError> {
        let path = safe_path(&self.root, key)?;
        match fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(tokio::io::BufReader::new(file))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn size(&self, key: &str) -> Result<u64, StoreError> {
        let path = safe_path(&self.root, key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let dir = safe_path(&self.root, prefix.trim_end_matches('/'))?;
        let mut keys = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(".tmp-") {
                continue;
            }
            if entry.file_type().await?.is_file() {
                keys.push(format!("{}{}", prefix, name));
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        let dir = safe_path(&self.root, prefix.trim_end_matches('/'))?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                // A prefix may name a single object rather than a directory.
                match fs::remove_file(&dir).await {
                    Ok(()) => Ok(()),
                    Err(f) if f.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(_) => Err(e.into()),
                }
            }
        }
    }
}

/// On-disk shape of one job: the record plus the chunk plan and the set of
/// already-credited indices (what makes duplicate credits detectable).
#[derive(Serialize, Deserialize)]
struct StoredJob {
    record: JobRecord,
    descriptors: Vec<ChunkDescriptor>,
    credited: BTreeSet<u32>,
}

pub struct FsJobStore {
    dir: PathBuf,
    // Serializes read-modify-write; conditional semantics only need to hold
    // within this process for the local backend.
    lock: Mutex<()>,
}

impl FsJobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            dir: root.into().join("jobs"),
            lock: Mutex::new(()),
        }
    }

    fn job_path(&self, job_id: &str) -> Result<PathBuf, StoreError> {
        if job_id.is_empty() || job_id.contains('/') || job_id.contains("..") {
            return Err(StoreError::Backend(format!("invalid job id: {}", job_id)));
        }
        Ok(self.dir.join(format!("{}.json", job_id)))
    }

    async fn load(&self, job_id: &str) -> Result<Option<StoredJob>, StoreError> {
        let path = self.job_path(job_id)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, stored: &StoredJob) -> Result<(), StoreError> {
        let path = self.job_path(&stored.record.job_id)?;
        let bytes = serde_json::to_vec_pretty(stored)?;
        atomic_write(&path, &bytes).await
    }

    async fn require(&self, job_id: &str) -> Result<StoredJob, StoreError> {
        self.load(job_id)
            .await?
            .ok_or_else(|| StoreError::UnknownJob(job_id.to_string()))
    }
}

#[async_trait]
impl JobStore for FsJobStore {
    async fn create(&self, job: JobRecord) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        self.save(&StoredJob {
            record: job,
            descriptors: Vec::new(),
            credited: BTreeSet::new(),
        })
        .await
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.load(job_id).await?.map(|s| s.record))
    }

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<JobRecord>, StoreError> {
        let mut records = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await?;
            let stored: StoredJob = serde_json::from_slice(&bytes)?;
            if stored.record.owner == owner {
                records.push(stored.record);
            }
        }
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }

    async fn transition(
        &self,
        job_id: &str,
        from: JobState,
        to: JobState,
    ) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut stored = self.require(job_id).await?;
        if stored.record.state != from || !from.can_transition_to(to) {
            return Ok(false);
        }
        stored.record.state = to;
        stored.record.updated_at = Utc::now();
        self.save(&stored).await?;
        Ok(true)
    }

    async fn set_translation_request(
        &self,
        job_id: &str,
        target_language: &str,
        tone: Tone,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut stored = self.require(job_id).await?;
        stored.record.target_language = Some(target_language.to_string());
        stored.record.tone = tone;
        stored.record.updated_at = Utc::now();
        self.save(&stored).await
    }

    async fn set_chunked(
        &self,
        job_id: &str,
        total_source_tokens: u64,
        descriptors: Vec<ChunkDescriptor>,
    ) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut stored = self.require(job_id).await?;
        if stored.record.state != JobState::Chunking {
            return Ok(false);
        }
        stored.record.total_chunks = Some(descriptors.len() as u32);
        stored.record.total_source_tokens = total_source_tokens;
        stored.record.translated_chunks = 0;
        stored.record.state = JobState::Chunked;
        stored.record.updated_at = Utc::now();
        stored.descriptors = descriptors;
        stored.credited.clear();
        self.save(&stored).await?;
        Ok(true)
    }

    async fn descriptor(
        &self,
        job_id: &str,
        index: u32,
    ) -> Result<Option<ChunkDescriptor>, StoreError> {
        Ok(self
            .load(job_id)
            .await?
            .and_then(|s| s.descriptors.get(index as usize).cloned()))
    }

    async fn credit_chunk(
        &self,
        job_id: &str,
        index: u32,
        tokens_in: u64,
        tokens_out: u64,
    ) -> Result<ChunkCredit, StoreError> {
        let _guard = self.lock.lock().await;
        let mut stored = self.require(job_id).await?;
        if !stored.credited.insert(index) {
            return Ok(ChunkCredit::AlreadyCredited);
        }
        stored.record.translated_chunks += 1;
        stored.record.tokens_in += tokens_in;
        stored.record.tokens_out += tokens_out;
        stored.record.updated_at = Utc::now();
        self.save(&stored).await?;
        Ok(ChunkCredit::Applied)
    }

    async fn complete(
        &self,
        job_id: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut stored = self.require(job_id).await?;
        if stored.record.state != JobState::Translating {
            return Ok(false);
        }
        stored.record.state = JobState::Completed;
        stored.record.translated_chunks = stored.record.total_chunks.unwrap_or(0);
        stored.record.completed_at = Some(completed_at);
        stored.record.updated_at = completed_at;
        self.save(&stored).await?;
        Ok(true)
    }

    async fn fail(
        &self,
        job_id: &str,
        to: JobState,
        error: ErrorDescriptor,
    ) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut stored = self.require(job_id).await?;
        if stored.record.state.is_terminal() {
            return Ok(false);
        }
        stored.record.state = to;
        stored.record.error = Some(error);
        stored.record.updated_at = Utc::now();
        self.save(&stored).await?;
        Ok(true)
    }

    async fn reset_to_uploaded(&self, job_id: &str) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut stored = self.require(job_id).await?;
        if !matches!(
            stored.record.state,
            JobState::Failed | JobState::ChunkingFailed
        ) {
            return Ok(false);
        }
        stored.record.state = JobState::Uploaded;
        stored.record.total_chunks = None;
        stored.record.translated_chunks = 0;
        stored.record.total_source_tokens = 0;
        stored.record.tokens_in = 0;
        stored.record.tokens_out = 0;
        stored.record.completed_at = None;
        stored.record.error = None;
        stored.record.updated_at = Utc::now();
        stored.descriptors.clear();
        stored.credited.clear();
        self.save(&stored).await?;
        Ok(true)
    }
}
