pub mod init;
pub mod jobs;
pub mod reset;
pub mod resume;
pub mod status;
pub mod translate;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;

use crate::cli::LlmProvider;
use crate::config::Config;
use crate::limiter::RateLimiter;
use crate::llm::{LlmClient, ProviderKind};
use crate::orchestrator::Orchestrator;
use crate::store::fs::{FsJobStore, FsObjectStore};
use crate::store::memory::MemoryRateLimitStore;
use crate::worker::TranslationWorker;

/// Owner recorded on jobs created by this CLI.
pub(crate) const LOCAL_OWNER: &str = "local";

pub(crate) fn workspace_root(config: &Config, workspace: Option<&Path>) -> Result<PathBuf> {
    match workspace {
        Some(path) => Ok(path.to_path_buf()),
        None => config.workspace_root(),
    }
}

pub(crate) fn resolve_provider(config: &Config, provider: Option<LlmProvider>) -> ProviderKind {
    provider
        .map(ProviderKind::from)
        .unwrap_or(match config.default_provider.as_str() {
            "openai" => ProviderKind::OpenAi,
            _ => ProviderKind::Anthropic,
        })
}

pub(crate) struct LocalStack {
    pub orchestrator: Arc<Orchestrator>,
    pub objects: Arc<FsObjectStore>,
    pub jobs: Arc<FsJobStore>,
}

/// Wire the full pipeline over the filesystem stores. The rate-limit
/// buckets live in memory: a single-process run substitutes the in-memory
/// store behind the same interface the distributed deployment uses.
pub(crate) fn open_stack(
    config: &Config,
    workspace: Option<&Path>,
    kind: ProviderKind,
    model: Option<&str>,
) -> Result<LocalStack> {
    let root = workspace_root(config, workspace)?;
    let objects = Arc::new(FsObjectStore::new(&root));
    let jobs = Arc::new(FsJobStore::new(&root));

    let client = Arc::new(LlmClient::new(
        kind,
        config,
        model,
        config.pipeline.chunk_call_timeout(),
    )?);
    let limiter = Arc::new(RateLimiter::new(
        Arc::new(MemoryRateLimitStore::new()),
        config.rate_limits.clone(),
    ));
    let worker = Arc::new(TranslationWorker::new(
        jobs.clone(),
        objects.clone(),
        limiter,
        client,
        config,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        jobs.clone(),
        objects.clone(),
        worker,
        config,
    ));

    Ok(LocalStack {
        orchestrator,
        objects,
        jobs,
    })
}
