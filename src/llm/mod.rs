mod anthropic;
mod openai;
pub mod prompts;

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use thiserror::Error;

use crate::config::Config;
use crate::job::Tone;

/// Which provider implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderKind {
    #[default]
    Anthropic,
    OpenAi,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Anthropic => write!(f, "anthropic"),
            ProviderKind::OpenAi => write!(f, "openai"),
        }
    }
}

/// One chunk-translation request as the provider sees it.
#[derive(Debug, Clone)]
pub struct TranslationRequest {
    pub target_language: String,
    pub tone: Tone,
    /// Tail of the previous chunk, rendered as a prior-context block.
    pub previous_summary: String,
    pub source: String,
}

/// Provider response: translated text plus the provider's own usage counts.
#[derive(Debug, Clone)]
pub struct TranslationOutput {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
}

/// Provider failures, classified so the worker can tell retryable from
/// fatal. 429 and 5xx are kept distinct from other 4xx by construction.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider throttled the request: {0}")]
    RateLimited(String),
    #[error("provider server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("provider rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited(_)
                | ProviderError::Server { .. }
                | ProviderError::Timeout(_)
                | ProviderError::Transport(_)
        )
    }
}

/// Trait for LLM translation providers.
#[async_trait]
pub trait TranslationProvider: Send + Sync {
    async fn translate(
        &self,
        request: &TranslationRequest,
    ) -> Result<TranslationOutput, ProviderError>;

    fn name(&self) -> &'static str;
}

/// Main LLM client that abstracts over providers.
pub struct LlmClient {
    provider: Box<dyn TranslationProvider>,
}

impl LlmClient {
    /// Create a new LLM client for the specified provider. `call_timeout`
    /// bounds each HTTP call (the per-chunk call timeout).
    pub fn new(
        kind: ProviderKind,
        config: &Config,
        model_override: Option<&str>,
        call_timeout: Duration,
    ) -> Result<Self> {
        let provider: Box<dyn TranslationProvider> = match kind {
            ProviderKind::Anthropic => {
                let provider_config = config
                    .get_provider("anthropic")
                    .context("Anthropic provider not configured")?;
                let model = model_override
                    .map(String::from)
                    .or_else(|| provider_config.model.clone())
                    .unwrap_or_else(|| "claude-sonnet-4-20250514".to_string());
                Box::new(anthropic::AnthropicProvider::new(
                    &provider_config.api_key,
                    &model,
                    provider_config.base_url.as_deref(),
                    call_timeout,
                )?)
            }
            ProviderKind::OpenAi => {
                let provider_config = config
                    .get_provider("openai")
                    .context("OpenAI provider not configured")?;
                let model = model_override
                    .map(String::from)
                    .or_else(|| provider_config.model.clone())
                    .unwrap_or_else(|| "gpt-4o".to_string());
                Box::new(openai::OpenAiProvider::new(
                    &provider_config.api_key,
                    &model,
                    provider_config.base_url.as_deref(),
                    call_timeout,
                )?)
            }
        };

        Ok(Self { provider })
    }

    /// Wrap an arbitrary provider implementation (tests inject scripted
    /// providers through this).
    pub fn from_provider(provider: Box<dyn TranslationProvider>) -> Self {
        Self { provider }
    }

    pub async fn translate(
        &self,
        request: &TranslationRequest,
    ) -> Result<TranslationOutput, ProviderError> {
        self.provider.translate(request).await
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }
}

/// Shared HTTP status classification for provider implementations.
pub(crate) fn classify_status(status: u16, message: String) -> ProviderError {
    if status == 429 {
        ProviderError::RateLimited(message)
    } else if (500..600).contains(&status) {
        ProviderError::Server { status, message }
    } else {
        ProviderError::Rejected { status, message }
    }
}

/// Shared transport-error mapping for provider implementations.
pub(crate) fn classify_transport(e: reqwest::Error, call_timeout: Duration) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(call_timeout)
    } else {
        ProviderError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(429, "slow down".into()),
            ProviderError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(503, "overloaded".into()),
            ProviderError::Server { status: 503, .. }
        ));
        assert!(matches!(
            classify_status(400, "bad request".into()),
            ProviderError::Rejected { status: 400, .. }
        ));
    }

    #[test]
    fn test_transience() {
        assert!(classify_status(429, String::new()).is_transient());
        assert!(classify_status(500, String::new()).is_transient());
        assert!(!classify_status(400, String::new()).is_transient());
        assert!(!classify_status(404, String::new()).is_transient());
        assert!(ProviderError::Timeout(Duration::from_secs(60)).is_transient());
        assert!(!ProviderError::Malformed("no text".into()).is_transient());
    }
}
