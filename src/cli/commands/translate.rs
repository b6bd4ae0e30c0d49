use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use console::{Emoji, style};
use indicatif::{HumanDuration, ProgressBar, ProgressStyle};

use crate::cli::{LlmProvider, ToneArg};
use crate::config::Config;
use crate::job::{JobState, keys};
use crate::store::{JobStore, ObjectStore};

use super::{LOCAL_OWNER, open_stack, resolve_provider};

static PAPER: Emoji<'_, '_> = Emoji("📄 ", "");
static BRAIN: Emoji<'_, '_> = Emoji("🧠 ", "");
static GLOBE: Emoji<'_, '_> = Emoji("🌍 ", "");
static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK] ");
static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[X] ");
static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

#[allow(clippy::too_many_arguments)]
pub async fn run(
    file: PathBuf,
    language: String,
    tone: ToneArg,
    provider: Option<LlmProvider>,
    model: Option<String>,
    concurrency: Option<usize>,
    output: Option<PathBuf>,
    workspace: Option<&Path>,
) -> Result<()> {
    let started = Instant::now();

    println!();
    println!(
        "{}",
        style(" longtrans - Document Translation ").bold().reverse()
    );
    println!();

    let mut config =
        Config::load().context("Failed to load configuration. Run 'longtrans init' first.")?;
    if let Some(concurrency) = concurrency {
        config.pipeline.max_concurrency = concurrency;
    }
    config.validate()?;

    let kind = resolve_provider(&config, provider);
    let model = model.or(config.default_model.clone());
    let model_display = model.clone().unwrap_or_else(|| "default".to_string());

    println!("{}Provider: {}", BRAIN, style(kind.to_string()).cyan().bold());
    println!("{}Model: {}", BRAIN, style(&model_display).cyan());
    println!("{}Source: {}", PAPER, style(file.display()).cyan());
    println!(
        "{}Target: {} ({})",
        GLOBE,
        style(&language).cyan().bold(),
        style(tone.to_string()).cyan()
    );
    if config.pipeline.max_concurrency > 1 {
        println!(
            "{}Concurrency: {}",
            BRAIN,
            style(config.pipeline.max_concurrency).cyan()
        );
    }
    println!();

    let stack = open_stack(&config, workspace, kind, model.as_deref())?;

    // The CLI plays the part of the upload flow: put the raw object, then
    // deliver the upload-completion event.
    let job = stack.orchestrator.register_job(LOCAL_OWNER).await?;
    let bytes = tokio::fs::read(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    stack.objects.put(&keys::upload(&job.job_id), &bytes).await?;
    stack
        .orchestrator
        .handle_upload_event(&job.job_id, content_type_of(&file))
        .await?;
    stack
        .orchestrator
        .start_translation(&job.job_id, &language, tone.into())
        .await?;

    println!("{}Job: {}", PAPER, style(&job.job_id).cyan());
    println!();

    // Drive in the background, render chunk progress in the foreground.
    let driver = {
        let orchestrator = stack.orchestrator.clone();
        let job_id = job.job_id.clone();
        tokio::spawn(async move { orchestrator.drive(&job_id).await })
    };

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{}{{spinner:.green}} [{{elapsed_precise}}] {{bar:40.cyan/blue}} {{pos}}/{{len}} chunks {{msg}}",
                GLOBE
            ))
            .unwrap()
            .progress_chars("━━╸━"),
    );
    pb.enable_steady_tick(Duration::from_millis(100));

    while !driver.is_finished() {
        if let Ok(Some(current)) = stack.jobs.get(&job.job_id).await {
            if let Some(total) = current.total_chunks {
                pb.set_length(total as u64);
                pb.set_position(current.translated_chunks as u64);
            }
            pb.set_message(style(current.state.to_string()).dim().to_string());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    let record = driver.await.context("translation driver panicked")??;
    pb.finish_and_clear();

    match record.state {
        JobState::Completed => {
            let result = stack.objects.get(&keys::result(&job.job_id)).await?;
            let output_path = output.unwrap_or_else(|| default_output_path(&file, &language));
            tokio::fs::write(&output_path, &result)
                .await
                .with_context(|| format!("Failed to write {}", output_path.display()))?;

            println!(
                "{}Translated {} chunks ({} tokens in, {} tokens out)",
                CHECK,
                style(record.total_chunks.unwrap_or(0)).green().bold(),
                style(record.tokens_in).green(),
                style(record.tokens_out).green()
            );
            println!(
                "{}Output written to {}",
                CHECK,
                style(output_path.display()).cyan()
            );
            println!();
            println!(
                "{}Done in {}",
                SPARKLE,
                style(HumanDuration(started.elapsed())).green().bold()
            );
            Ok(())
        }
        state => {
            let (error_kind, message) = record
                .error
                .map(|e| (e.kind, e.message))
                .unwrap_or_else(|| ("unknown".to_string(), "no error recorded".to_string()));
            println!(
                "{}Job {} ended in {}: {}",
                CROSS,
                style(&job.job_id).cyan(),
                style(state.to_string()).red().bold(),
                style(&message).red()
            );
            anyhow::bail!("translation failed ({}): {}", error_kind, message)
        }
    }
}

fn content_type_of(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        None | Some("txt") | Some("text") => "text/plain",
        _ => "application/octet-stream",
    }
}

fn default_output_path(file: &Path, language: &str) -> PathBuf {
    file.with_extension(format!("{}.txt", language))
}
