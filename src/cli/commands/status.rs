use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;

use crate::config::Config;
use crate::job::{JobRecord, JobState};
use crate::store::JobStore;
use crate::store::fs::FsJobStore;

use super::{LOCAL_OWNER, workspace_root};

pub async fn run(job_id: &str, workspace: Option<&Path>) -> Result<()> {
    let config = Config::load()?;
    let root = workspace_root(&config, workspace)?;
    let jobs = FsJobStore::new(&root);

    let job = jobs
        .get(job_id)
        .await?
        .with_context(|| format!("job {} not found", job_id))?;
    if job.owner != LOCAL_OWNER {
        anyhow::bail!("job {} belongs to another owner", job_id);
    }

    print_status(&job);
    Ok(())
}

fn print_status(job: &JobRecord) {
    println!();
    println!("  {}  {}", "job".dimmed(), job.job_id);
    println!("  {}  {}", "state".dimmed(), colored_state(job.state));

    if let Some(language) = &job.target_language {
        println!("  {}  {} ({})", "target".dimmed(), language, job.tone);
    }
    if let Some(total) = job.total_chunks {
        let progress = job.progress_percentage().unwrap_or(0.0);
        println!(
            "  {}  {}/{} chunks ({:.0}%)",
            "progress".dimmed(),
            job.translated_chunks,
            total,
            progress
        );
    }
    if job.tokens_in > 0 || job.tokens_out > 0 {
        println!(
            "  {}  {} in / {} out",
            "tokens".dimmed(),
            job.tokens_in,
            job.tokens_out
        );
    }
    println!(
        "  {}  {}",
        "updated".dimmed(),
        job.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(completed_at) = job.completed_at {
        println!(
            "  {}  {}",
            "completed".dimmed(),
            completed_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(error) = &job.error {
        println!(
            "  {}  [{}] {}",
            "error".dimmed(),
            error.kind.red(),
            error.message.red()
        );
    }
    println!();
}

fn colored_state(state: JobState) -> String {
    let text = state.to_string();
    match state {
        JobState::Completed => text.green().bold().to_string(),
        JobState::Failed
        | JobState::ChunkingFailed
        | JobState::ValidationFailed
        | JobState::Canceled => text.red().bold().to_string(),
        _ => text.cyan().to_string(),
    }
}
