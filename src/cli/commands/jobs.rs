use std::path::Path;

use anyhow::Result;
use colored::Colorize;

use crate::config::Config;
use crate::store::JobStore;
use crate::store::fs::FsJobStore;

use super::{LOCAL_OWNER, workspace_root};

pub async fn run(workspace: Option<&Path>) -> Result<()> {
    let config = Config::load()?;
    let root = workspace_root(&config, workspace)?;
    let jobs = FsJobStore::new(&root);

    let records = jobs.list_by_owner(LOCAL_OWNER).await?;
    if records.is_empty() {
        println!("No jobs yet. Start one with 'longtrans translate'.");
        return Ok(());
    }

    println!();
    println!(
        "  {:<36}  {:<17}  {:>9}  {:<8}  {}",
        "JOB".dimmed(),
        "STATE".dimmed(),
        "PROGRESS".dimmed(),
        "TARGET".dimmed(),
        "UPDATED".dimmed()
    );
    for job in records {
        let progress = job
            .progress_percentage()
            .map(|p| format!("{:.0}%", p))
            .unwrap_or_else(|| "-".to_string());
        let target = job.target_language.as_deref().unwrap_or("-");
        println!(
            "  {:<36}  {:<17}  {:>9}  {:<8}  {}",
            job.job_id,
            job.state,
            progress,
            target,
            job.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!();
    Ok(())
}
