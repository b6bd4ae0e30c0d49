use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use longtrans::cli::{Cli, Commands, commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing - only show warnings by default, use RUST_LOG=info for more detail
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let workspace = cli.workspace;

    match cli.command {
        Commands::Init { force } => {
            commands::init::run(force).await?;
        }
        Commands::Translate {
            file,
            language,
            tone,
            provider,
            model,
            concurrency,
            output,
        } => {
            commands::translate::run(
                file,
                language,
                tone,
                provider,
                model,
                concurrency,
                output,
                workspace.as_deref(),
            )
            .await?;
        }
        Commands::Status { job_id } => {
            commands::status::run(&job_id, workspace.as_deref()).await?;
        }
        Commands::Jobs => {
            commands::jobs::run(workspace.as_deref()).await?;
        }
        Commands::Resume {
            job_id,
            provider,
            model,
        } => {
            commands::resume::run(&job_id, provider, model, workspace.as_deref()).await?;
        }
        Commands::Reset { job_id } => {
            commands::reset::run(&job_id, workspace.as_deref()).await?;
        }
    }

    Ok(())
}
