use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// One immutable configuration record passed in at initialization. No
/// global mutable state; every tunable lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_provider")]
    pub default_provider: String,
    pub default_model: Option<String>,
    /// Rate-limit account shared by all workers hitting the same API key.
    #[serde(default = "default_account")]
    pub account: String,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_provider() -> String {
    "anthropic".to_string()
}

fn default_account() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_target_chunk_tokens")]
    pub target_chunk_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
    /// Paragraph-boundary tolerance around the chunk target, in percent.
    #[serde(default = "default_paragraph_slack")]
    pub paragraph_boundary_slack_percent: u32,
    /// Parallel chunk translations per job, clamped to 1..=20.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_chunk_max_attempts")]
    pub chunk_max_attempts: u32,
    #[serde(default = "default_rate_limit_max_retries")]
    pub rate_limit_max_retries: u32,
    #[serde(default = "default_chunk_call_timeout_secs")]
    pub chunk_call_timeout_secs: u64,
    #[serde(default = "default_chunk_total_timeout_secs")]
    pub chunk_total_timeout_secs: u64,
    #[serde(default = "default_job_total_timeout_secs")]
    pub job_total_timeout_secs: u64,
    /// Multiplier turning estimated input tokens into estimated output
    /// tokens when charging the tokens-per-minute window.
    #[serde(default = "default_output_token_ratio")]
    pub output_token_ratio: f64,
}

fn default_target_chunk_tokens() -> usize {
    3500
}

fn default_overlap_tokens() -> usize {
    250
}

fn default_paragraph_slack() -> u32 {
    10
}

fn default_max_concurrency() -> usize {
    10
}

fn default_chunk_max_attempts() -> u32 {
    3
}

fn default_rate_limit_max_retries() -> u32 {
    5
}

fn default_chunk_call_timeout_secs() -> u64 {
    60
}

fn default_chunk_total_timeout_secs() -> u64 {
    600
}

fn default_job_total_timeout_secs() -> u64 {
    21_600
}

fn default_output_token_ratio() -> f64 {
    1.0
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_chunk_tokens: default_target_chunk_tokens(),
            overlap_tokens: default_overlap_tokens(),
            paragraph_boundary_slack_percent: default_paragraph_slack(),
            max_concurrency: default_max_concurrency(),
            chunk_max_attempts: default_chunk_max_attempts(),
            rate_limit_max_retries: default_rate_limit_max_retries(),
            chunk_call_timeout_secs: default_chunk_call_timeout_secs(),
            chunk_total_timeout_secs: default_chunk_total_timeout_secs(),
            job_total_timeout_secs: default_job_total_timeout_secs(),
            output_token_ratio: default_output_token_ratio(),
        }
    }
}

impl PipelineConfig {
    pub fn chunk_call_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_call_timeout_secs)
    }

    pub fn chunk_total_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_total_timeout_secs)
    }

    pub fn job_total_timeout(&self) -> Duration {
        Duration::from_secs(self.job_total_timeout_secs)
    }
}

/// External API limits per account: requests and tokens per rolling minute,
/// requests per day anchored to the configured day boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u64,
    #[serde(default = "default_tokens_per_minute")]
    pub tokens_per_minute: u64,
    #[serde(default = "default_requests_per_day")]
    pub requests_per_day: u64,
    /// Day-boundary offset from UTC, in minutes. Resets are stored in UTC;
    /// a fixed offset avoids DST ambiguity.
    #[serde(default)]
    pub day_boundary_utc_offset_minutes: i32,
}

fn default_requests_per_minute() -> u64 {
    50
}

fn default_tokens_per_minute() -> u64 {
    100_000
}

fn default_requests_per_day() -> u64 {
    5_000
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            tokens_per_minute: default_tokens_per_minute(),
            requests_per_day: default_requests_per_day(),
            day_boundary_utc_offset_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    pub anthropic: Option<ProviderConfig>,
    pub openai: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Workspace root for the filesystem-backed stores; defaults to the
    /// platform data dir.
    pub root: Option<PathBuf>,
}

impl Config {
    /// Get the configuration directory path
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("longtrans");
        Ok(config_dir)
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Workspace root used by the filesystem stores.
    pub fn workspace_root(&self) -> Result<PathBuf> {
        if let Some(ref root) = self.storage.root {
            return Ok(root.clone());
        }
        let data_dir = dirs::data_dir()
            .context("Could not determine data directory")?
            .join("longtrans")
            .join("workspace");
        Ok(data_dir)
    }

    /// Load configuration from file
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            anyhow::bail!(
                "Configuration file not found at {}. Run 'longtrans init' first.",
                config_path.display()
            );
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file at {}", config_path.display()))?;

        // Expand environment variables in API keys
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Expand environment variables in configuration values
    fn expand_env_vars(&mut self) {
        if let Some(ref mut provider) = self.providers.anthropic {
            provider.api_key = expand_env_var(&provider.api_key);
        }
        if let Some(ref mut provider) = self.providers.openai {
            provider.api_key = expand_env_var(&provider.api_key);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        if !(1..=20).contains(&p.max_concurrency) {
            anyhow::bail!(
                "max_concurrency must be between 1 and 20, got {}",
                p.max_concurrency
            );
        }
        if p.target_chunk_tokens == 0 {
            anyhow::bail!("target_chunk_tokens must be positive");
        }
        if p.overlap_tokens >= p.target_chunk_tokens {
            anyhow::bail!(
                "overlap_tokens ({}) must be smaller than target_chunk_tokens ({})",
                p.overlap_tokens,
                p.target_chunk_tokens
            );
        }
        if p.paragraph_boundary_slack_percent > 50 {
            anyhow::bail!("paragraph_boundary_slack_percent must be at most 50");
        }
        if p.output_token_ratio <= 0.0 {
            anyhow::bail!("output_token_ratio must be positive");
        }
        if p.chunk_max_attempts == 0 {
            anyhow::bail!("chunk_max_attempts must be at least 1");
        }

        let r = &self.rate_limits;
        if r.requests_per_minute == 0 || r.tokens_per_minute == 0 || r.requests_per_day == 0 {
            anyhow::bail!("rate limits must be positive");
        }
        if r.day_boundary_utc_offset_minutes.abs() > 14 * 60 {
            anyhow::bail!(
                "day_boundary_utc_offset_minutes out of range: {}",
                r.day_boundary_utc_offset_minutes
            );
        }

        Ok(())
    }

    /// Get provider configuration by name
    pub fn get_provider(&self, name: &str) -> Option<&ProviderConfig> {
        match name.to_lowercase().as_str() {
            "anthropic" => self.providers.anthropic.as_ref(),
            "openai" => self.providers.openai.as_ref(),
            _ => None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            default_model: None,
            account: default_account(),
            pipeline: PipelineConfig::default(),
            rate_limits: RateLimitsConfig::default(),
            providers: ProvidersConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Expand environment variable references like ${VAR_NAME}
fn expand_env_var(value: &str) -> String {
    if value.starts_with("${") && value.ends_with('}') {
        let var_name = &value[2..value.len() - 1];
        std::env::var(var_name).unwrap_or_default()
    } else if let Some(var_name) = value.strip_prefix('$') {
        std::env::var(var_name).unwrap_or_default()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_var_braces() {
        // SAFETY: test is single-threaded
        unsafe { std::env::set_var("TEST_VAR_A", "value_a") };
        assert_eq!(expand_env_var("${TEST_VAR_A}"), "value_a");
        unsafe { std::env::remove_var("TEST_VAR_A") };
    }

    #[test]
    fn test_expand_env_var_literal() {
        assert_eq!(expand_env_var("literal_value"), "literal_value");
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.pipeline.target_chunk_tokens, 3500);
        assert_eq!(config.pipeline.overlap_tokens, 250);
        assert_eq!(config.pipeline.paragraph_boundary_slack_percent, 10);
        assert_eq!(config.pipeline.max_concurrency, 10);
        assert_eq!(config.pipeline.chunk_max_attempts, 3);
        assert_eq!(config.pipeline.chunk_call_timeout_secs, 60);
        assert_eq!(config.pipeline.chunk_total_timeout_secs, 600);
        assert_eq!(config.pipeline.job_total_timeout_secs, 21_600);
        assert_eq!(config.pipeline.output_token_ratio, 1.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            default_provider = "openai"
            default_model = "gpt-4o"

            [pipeline]
            target_chunk_tokens = 500
            overlap_tokens = 50
            max_concurrency = 4

            [rate_limits]
            requests_per_minute = 5
            tokens_per_minute = 250000
            requests_per_day = 25

            [providers.openai]
            api_key = "sk-test"
            model = "gpt-4o"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.default_provider, "openai");
        assert_eq!(config.pipeline.target_chunk_tokens, 500);
        assert_eq!(config.pipeline.overlap_tokens, 50);
        assert_eq!(config.pipeline.max_concurrency, 4);
        assert_eq!(config.rate_limits.requests_per_minute, 5);
        // Unset fields fall back to defaults.
        assert_eq!(config.pipeline.chunk_max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_concurrency() {
        let mut config = Config::default();
        config.pipeline.max_concurrency = 0;
        assert!(config.validate().is_err());
        config.pipeline.max_concurrency = 21;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_overlap_at_least_target() {
        let mut config = Config::default();
        config.pipeline.overlap_tokens = config.pipeline.target_chunk_tokens;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = Config::default();
        config.rate_limits.requests_per_minute = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_get_provider() {
        let toml_str = r#"
            [providers.anthropic]
            api_key = "sk-test"
            model = "claude-sonnet-4-20250514"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.get_provider("anthropic").is_some());
        assert!(config.get_provider("openai").is_none());
        assert!(config.get_provider("nonexistent").is_none());
    }

    #[test]
    fn test_config_roundtrip_toml() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(deserialized.default_provider, "anthropic");
        assert_eq!(deserialized.pipeline.target_chunk_tokens, 3500);
    }
}
