use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use console::{Emoji, style};
use indicatif::HumanDuration;

use crate::cli::LlmProvider;
use crate::config::Config;
use crate::job::{JobState, keys};

use super::{open_stack, resolve_provider};

static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK] ");
static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[X] ");
static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "");

/// Re-drive a job from its last durable state. A crashed run in
/// `translating` schedules only the chunks with no artifact yet.
pub async fn run(
    job_id: &str,
    provider: Option<LlmProvider>,
    model: Option<String>,
    workspace: Option<&Path>,
) -> Result<()> {
    let started = Instant::now();
    let config =
        Config::load().context("Failed to load configuration. Run 'longtrans init' first.")?;

    let kind = resolve_provider(&config, provider);
    let model = model.or(config.default_model.clone());
    let stack = open_stack(&config, workspace, kind, model.as_deref())?;

    println!("{}Resuming job {}", ROCKET, style(job_id).cyan());
    let record = stack.orchestrator.drive(job_id).await?;

    match record.state {
        JobState::Completed => {
            println!(
                "{}Job completed: {}/{} chunks, result at {}",
                CHECK,
                style(record.translated_chunks).green().bold(),
                style(record.total_chunks.unwrap_or(0)).green().bold(),
                style(keys::result(job_id)).cyan()
            );
            println!(
                "{}Done in {}",
                CHECK,
                style(HumanDuration(started.elapsed())).green()
            );
            Ok(())
        }
        state if state.is_terminal() => {
            let message = record
                .error
                .map(|e| format!("{}: {}", e.kind, e.message))
                .unwrap_or_else(|| "no error recorded".to_string());
            println!(
                "{}Job ended in {}: {}",
                CROSS,
                style(state.to_string()).red().bold(),
                message
            );
            anyhow::bail!("job {} is {}", job_id, state)
        }
        state => {
            println!(
                "{}Job is in {}; nothing to resume yet",
                CROSS,
                style(state.to_string()).yellow()
            );
            Ok(())
        }
    }
}
