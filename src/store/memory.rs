//! In-memory store implementations. Used by tests and by single-process
//! deployments that do not need durability (the ports hide the difference).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Cursor;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;

use super::{BucketState, BucketWrite, ChunkCredit, JobStore, ObjectStore, RateLimitStore, StoreError};
use crate::job::{ChunkDescriptor, ErrorDescriptor, JobRecord, JobState, Tone};

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let mut objects = self.objects.lock().expect("object store lock");
        objects.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let objects = self.objects.lock().expect("object store lock");
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn reader(&self, key: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>, StoreError> {
        let bytes = self.get(key).await?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    async fn size(&self, key: &str) -> Result<u64, StoreError> {
        let objects = self.objects.lock().expect("object store lock");
        objects
            .get(key)
            .map(|b| b.len() as u64)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let objects = self.objects.lock().expect("object store lock");
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        let mut objects = self.objects.lock().expect("object store lock");
        objects.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

struct JobEntry {
    record: JobRecord,
    descriptors: Vec<ChunkDescriptor>,
    credited: BTreeSet<u32>,
}

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, JobEntry>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: JobRecord) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().expect("job store lock");
        jobs.insert(
            job.job_id.clone(),
            JobEntry {
                record: job,
                descriptors: Vec::new(),
                credited: BTreeSet::new(),
            },
        );
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let jobs = self.jobs.lock().expect("job store lock");
        Ok(jobs.get(job_id).map(|e| e.record.clone()))
    }

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<JobRecord>, StoreError> {
        let jobs = self.jobs.lock().expect("job store lock");
        let mut records: Vec<JobRecord> = jobs
            .values()
            .filter(|e| e.record.owner == owner)
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }

    async fn transition(
        &self,
        job_id: &str,
        from: JobState,
        to: JobState,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().expect("job store lock");
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::UnknownJob(job_id.to_string()))?;
        if entry.record.state != from || !from.can_transition_to(to) {
            return Ok(false);
        }
        entry.record.state = to;
        entry.record.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_translation_request(
        &self,
        job_id: &str,
        target_language: &str,
        tone: Tone,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().expect("job store lock");
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::UnknownJob(job_id.to_string()))?;
        entry.record.target_language = Some(target_language.to_string());
        entry.record.tone = tone;
        entry.record.updated_at = Utc::now();
        Ok(())
    }

    async fn set_chunked(
        &self,
        job_id: &str,
        total_source_tokens: u64,
        descriptors: Vec<ChunkDescriptor>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().expect("job store lock");
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::UnknownJob(job_id.to_string()))?;
        if entry.record.state != JobState::Chunking {
            return Ok(false);
        }
        entry.record.total_chunks = Some(descriptors.len() as u32);
        entry.record.total_source_tokens = total_source_tokens;
        entry.record.translated_chunks = 0;
        entry.record.state = JobState::Chunked;
        entry.record.updated_at = Utc::now();
        entry.descriptors = descriptors;
        entry.credited.clear();
        Ok(true)
    }

    async fn descriptor(
        &self,
        job_id: &str,
        index: u32,
    ) -> Result<Option<ChunkDescriptor>, StoreError> {
        let jobs = self.jobs.lock().expect("job store lock");
        Ok(jobs
            .get(job_id)
            .and_then(|e| e.descriptors.get(index as usize).cloned()))
    }

    async fn credit_chunk(
        &self,
        job_id: &str,
        index: u32,
        tokens_in: u64,
        tokens_out: u64,
    ) -> Result<ChunkCredit, StoreError> {
        let mut jobs = self.jobs.lock().expect("job store lock");
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::UnknownJob(job_id.to_string()))?;
        if !entry.credited.insert(index) {
            return Ok(ChunkCredit::AlreadyCredited);
        }
        entry.record.translated_chunks += 1;
        entry.record.tokens_in += tokens_in;
        entry.record.tokens_out += tokens_out;
        entry.record.updated_at = Utc::now();
        Ok(ChunkCredit::Applied)
    }

    async fn complete(
        &self,
        job_id: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().expect("job store lock");
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::UnknownJob(job_id.to_string()))?;
        if entry.record.state != JobState::Translating {
            return Ok(false);
        }
        entry.record.state = JobState::Completed;
        entry.record.translated_chunks = entry.record.total_chunks.unwrap_or(0);
        entry.record.completed_at = Some(completed_at);
        entry.record.updated_at = completed_at;
        Ok(true)
    }

    async fn fail(
        &self,
        job_id: &str,
        to: JobState,
        error: ErrorDescriptor,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().expect("job store lock");
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::UnknownJob(job_id.to_string()))?;
        if entry.record.state.is_terminal() {
            return Ok(false);
        }
        entry.record.state = to;
        entry.record.error = Some(error);
        entry.record.updated_at = Utc::now();
        Ok(true)
    }

    async fn reset_to_uploaded(&self, job_id: &str) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().expect("job store lock");
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::UnknownJob(job_id.to_string()))?;
        if !matches!(
            entry.record.state,
            JobState::Failed | JobState::ChunkingFailed
        ) {
            return Ok(false);
        }
        entry.record.state = JobState::Uploaded;
        entry.record.total_chunks = None;
        entry.record.translated_chunks = 0;
        entry.record.total_source_tokens = 0;
        entry.record.tokens_in = 0;
        entry.record.tokens_out = 0;
        entry.record.completed_at = None;
        entry.record.error = None;
        entry.record.updated_at = Utc::now();
        entry.descriptors.clear();
        entry.credited.clear();
        Ok(true)
    }
}

#[derive(Default)]
pub struct MemoryRateLimitStore {
    buckets: Mutex<HashMap<String, BucketState>>,
    unavailable: AtomicBool,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a backend outage; the limiter must fail closed.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("rate-limit store unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn read_buckets(&self, keys: &[String]) -> Result<Vec<Option<BucketState>>, StoreError> {
        self.check_available()?;
        let buckets = self.buckets.lock().expect("rate-limit store lock");
        Ok(keys.iter().map(|k| buckets.get(k).cloned()).collect())
    }

    async fn write_buckets(&self, writes: Vec<BucketWrite>) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut buckets = self.buckets.lock().expect("rate-limit store lock");
        for write in &writes {
            let current = buckets.get(&write.key).map(|b| b.version);
            if current != write.expected_version {
                return Ok(false);
            }
        }
        for write in writes {
            buckets.insert(write.key, write.next);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::keys;

    #[tokio::test]
    async fn test_object_put_get_list() {
        let store = MemoryObjectStore::new();
        store.put("translated/j/1", b"one").await.unwrap();
        store.put("translated/j/0", b"zero").await.unwrap();
        store.put("results/j", b"all").await.unwrap();

        assert_eq!(store.get("translated/j/0").await.unwrap(), b"zero");
        let listed = store.list("translated/j/").await.unwrap();
        assert_eq!(listed, vec!["translated/j/0", "translated/j/1"]);

        store.delete_prefix("translated/j/").await.unwrap();
        assert!(store.list("translated/j/").await.unwrap().is_empty());
        assert!(matches!(
            store.get("translated/j/0").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_job_transition_cas() {
        let store = MemoryJobStore::new();
        let job = JobRecord::new("me");
        let id = job.job_id.clone();
        store.create(job).await.unwrap();

        assert!(
            store
                .transition(&id, JobState::PendingUpload, JobState::Uploaded)
                .await
                .unwrap()
        );
        // Duplicate trigger loses the race.
        assert!(
            !store
                .transition(&id, JobState::PendingUpload, JobState::Uploaded)
                .await
                .unwrap()
        );
        // Illegal edge is refused even when the from-state matches.
        assert!(
            !store
                .transition(&id, JobState::Uploaded, JobState::Completed)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_credit_chunk_is_idempotent() {
        let store = MemoryJobStore::new();
        let mut job = JobRecord::new("me");
        job.state = JobState::Chunking;
        let id = job.job_id.clone();
        store.create(job).await.unwrap();

        let descriptors = vec![ChunkDescriptor {
            job_id: id.clone(),
            index: 0,
            input_tokens: 10,
            byte_start: 0,
            byte_end: 40,
            previous_summary: String::new(),
            source_key: keys::chunk(&id, 0),
            output_key: keys::translated(&id, 0),
        }];
        assert!(store.set_chunked(&id, 10, descriptors).await.unwrap());

        assert_eq!(
            store.credit_chunk(&id, 0, 10, 12).await.unwrap(),
            ChunkCredit::Applied
        );
        assert_eq!(
            store.credit_chunk(&id, 0, 10, 12).await.unwrap(),
            ChunkCredit::AlreadyCredited
        );

        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.translated_chunks, 1);
        assert_eq!(record.tokens_in, 10);
        assert_eq!(record.tokens_out, 12);
    }

    #[tokio::test]
    async fn test_fail_refused_on_terminal() {
        let store = MemoryJobStore::new();
        let mut job = JobRecord::new("me");
        job.state = JobState::Completed;
        let id = job.job_id.clone();
        store.create(job).await.unwrap();

        assert!(
            !store
                .fail(&id, JobState::Failed, ErrorDescriptor::new("permanent", "x"))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_bucket_cas_all_or_nothing() {
        let store = MemoryRateLimitStore::new();
        let now = Utc::now();

        let ok = store
            .write_buckets(vec![BucketWrite {
                key: "acct#rpm".into(),
                expected_version: None,
                next: BucketState {
                    count: 1,
                    window_reset_at: now,
                    version: 1,
                },
            }])
            .await
            .unwrap();
        assert!(ok);

        // Second write expects the wrong version on one key; nothing applies.
        let conflicted = store
            .write_buckets(vec![
                BucketWrite {
                    key: "acct#rpm".into(),
                    expected_version: Some(99),
                    next: BucketState {
                        count: 2,
                        window_reset_at: now,
                        version: 100,
                    },
                },
                BucketWrite {
                    key: "acct#rpd".into(),
                    expected_version: None,
                    next: BucketState {
                        count: 1,
                        window_reset_at: now,
                        version: 1,
                    },
                },
            ])
            .await
            .unwrap();
        assert!(!conflicted);

        let read = store
            .read_buckets(&["acct#rpm".into(), "acct#rpd".into()])
            .await
            .unwrap();
        assert_eq!(read[0].as_ref().unwrap().count, 1);
        assert!(read[1].is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = MemoryRateLimitStore::new();
        store.set_unavailable(true);
        assert!(store.read_buckets(&["k".into()]).await.is_err());
    }
}
