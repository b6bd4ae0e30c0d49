use std::path::Path;

use anyhow::{Context, Result};
use console::{Emoji, style};

use crate::config::Config;
use crate::orchestrator::reset_job;
use crate::store::fs::{FsJobStore, FsObjectStore};

use super::workspace_root;

static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK] ");

/// Operator reset: return a failed job to `uploaded` and delete its chunk
/// files, translated artifacts, and assembled result.
pub async fn run(job_id: &str, workspace: Option<&Path>) -> Result<()> {
    let config = Config::load()?;
    let root = workspace_root(&config, workspace)?;
    let jobs = FsJobStore::new(&root);
    let objects = FsObjectStore::new(&root);

    let record = reset_job(&jobs, &objects, job_id)
        .await
        .with_context(|| format!("failed to reset job {}", job_id))?;

    println!(
        "{}Job {} reset to {}; artifacts deleted",
        CHECK,
        style(job_id).cyan(),
        style(record.state.to_string()).green()
    );
    println!(
        "  Re-run it with: {} longtrans resume {}",
        style("$").dim(),
        job_id
    );
    Ok(())
}
