use anyhow::{Context, Result};
use console::{Emoji, style};
use std::fs;

use crate::config::{Config, ProviderConfig, ProvidersConfig};

static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "");
static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK] ");
static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[!] ");
static KEY: Emoji<'_, '_> = Emoji("🔑 ", "");

pub async fn run(force: bool) -> Result<()> {
    println!();
    println!("{}", style(" longtrans - Initialization ").bold().reverse());
    println!();

    let config_dir = Config::config_dir()?;
    let config_path = config_dir.join("config.toml");

    // Check if config already exists
    if config_path.exists() && !force {
        println!(
            "{}Configuration already exists at {}",
            WARN,
            style(config_path.display()).cyan()
        );
        println!("  Use {} to overwrite", style("--force").yellow());
        return Ok(());
    }

    fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

    let default_config = Config {
        providers: ProvidersConfig {
            anthropic: Some(ProviderConfig {
                api_key: "${ANTHROPIC_API_KEY}".to_string(),
                base_url: None,
                model: Some("claude-sonnet-4-20250514".to_string()),
            }),
            openai: Some(ProviderConfig {
                api_key: "${OPENAI_API_KEY}".to_string(),
                base_url: None,
                model: Some("gpt-4o".to_string()),
            }),
        },
        ..Config::default()
    };

    let config_content = toml::to_string_pretty(&default_config)?;
    fs::write(&config_path, config_content).context("Failed to write config file")?;

    println!(
        "{}Created configuration at {}",
        CHECK,
        style(config_path.display()).cyan()
    );

    println!();
    println!("{}", style("━".repeat(50)).dim());
    println!();
    println!("{}Next steps:", ROCKET);
    println!();
    println!("  {}Export an API key for your provider:", KEY);
    println!(
        "    {} export ANTHROPIC_API_KEY=sk-ant-...",
        style("$").dim()
    );
    println!();
    println!("  {}Translate your first document:", ROCKET);
    println!(
        "    {} longtrans translate ./book.txt --language pt-BR",
        style("$").dim()
    );
    println!();

    Ok(())
}
