use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::prompts::{translation_system_prompt, translation_user_prompt};
use super::{
    ProviderError, TranslationOutput, TranslationProvider, TranslationRequest, classify_status,
    classify_transport,
};

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    call_timeout: Duration,
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
    model: String,
}

#[derive(Deserialize)]
struct ContentBlock {
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

impl AnthropicProvider {
    pub fn new(
        api_key: &str,
        model: &str,
        base_url: Option<&str>,
        call_timeout: Duration,
    ) -> Result<Self> {
        if api_key.is_empty() {
            anyhow::bail!(
                "Anthropic API key is required. Set ANTHROPIC_API_KEY environment variable."
            );
        }

        let client = Client::builder()
            .timeout(call_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or("https://api.anthropic.com")
                .trim_end_matches('/')
                .to_string(),
            call_timeout,
        })
    }
}

#[async_trait]
impl TranslationProvider for AnthropicProvider {
    async fn translate(
        &self,
        request: &TranslationRequest,
    ) -> Result<TranslationOutput, ProviderError> {
        let body = AnthropicRequest {
            model: self.model.clone(),
            max_tokens: 8192,
            system: translation_system_prompt(&request.target_language, request.tone),
            messages: vec![Message {
                role: "user".to_string(),
                content: translation_user_prompt(&request.previous_summary, &request.source),
            }],
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(e, self.call_timeout))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), message));
        }

        let response: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        let text: String = response
            .content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect();
        if text.is_empty() {
            return Err(ProviderError::Malformed(
                "no text content in response".to_string(),
            ));
        }

        Ok(TranslationOutput {
            text,
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
            model: response.model,
        })
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_api_key() {
        assert!(
            AnthropicProvider::new("", "claude-sonnet-4-20250514", None, Duration::from_secs(60))
                .is_err()
        );
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let provider = AnthropicProvider::new(
            "sk-test",
            "claude-sonnet-4-20250514",
            Some("https://proxy.example.com/"),
            Duration::from_secs(60),
        )
        .unwrap();
        assert_eq!(provider.base_url, "https://proxy.example.com");
    }

    #[test]
    fn test_response_parsing() {
        let json = r#"{
            "content": [{"type": "text", "text": "Olá mundo."}],
            "usage": {"input_tokens": 12, "output_tokens": 5},
            "model": "claude-sonnet-4-20250514"
        }"#;
        let parsed: AnthropicResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.usage.input_tokens, 12);
        assert_eq!(parsed.content[0].text.as_deref(), Some("Olá mundo."));
    }
}
