//! Concrete chat-completion providers. Both speak JSON over `reqwest`,
//! report token usage from the API response and price calls from the
//! configured per-million rates.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::AppResult;
use crate::HttpClient;

use super::{rate_limiter::RateLimiter, AiProvider, GenerateOutcome, ModelInfo};

/// Rough chars-per-token used for pre-call rate-limiter estimates; actual
/// usage comes back from the API.
const CHARS_PER_TOKEN: usize = 4;

fn estimate_tokens(prompt: &str) -> u32 {
    (prompt.len() / CHARS_PER_TOKEN).max(1) as u32
}

fn price(
    input_tokens: u64,
    output_tokens: u64,
    input_cost_per_1m: f64,
    output_cost_per_1m: f64,
) -> f64 {
    input_tokens as f64 / 1_000_000.0 * input_cost_per_1m
        + output_tokens as f64 / 1_000_000.0 * output_cost_per_1m
}

// ============================================================================
// OpenAI-style chat completions
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChatApiResponseOrError {
    Error { error: ChatApiError },
    Response(ChatApiResponse),
}

#[derive(Debug, Deserialize)]
struct ChatApiError {
    message: String,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChatApiResponse {
    choices: Vec<ChatChoice>,
    usage: ChatUsage,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

pub struct OpenAiProvider {
    http_client: HttpClient,
    rate_limiter: Arc<RateLimiter>,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f64,
    input_cost_per_1m: f64,
    output_cost_per_1m: f64,
}

impl OpenAiProvider {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http_client: HttpClient,
        rate_limiter: Arc<RateLimiter>,
        base_url: String,
        api_key: String,
        model: String,
        temperature: f64,
        input_cost_per_1m: f64,
        output_cost_per_1m: f64,
    ) -> Self {
        Self {
            http_client,
            rate_limiter,
            base_url,
            api_key,
            model,
            temperature,
            input_cost_per_1m,
            output_cost_per_1m,
        }
    }
}

#[async_trait]
impl AiProvider for OpenAiProvider {
    async fn generate(&self, prompt: &str) -> AppResult<GenerateOutcome> {
        self.rate_limiter
            .admit(&self.model, estimate_tokens(prompt))
            .await?;

        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": &self.model,
                "temperature": self.temperature,
                "messages": [
                    { "role": "user", "content": prompt }
                ],
            }))
            .send()
            .await?
            .json::<serde_json::Value>()
            .await?;

        let parsed = serde_json::from_value::<ChatApiResponseOrError>(resp.clone())
            .context(format!("Could not parse chat response: {resp}"))?;

        let parsed = match parsed {
            ChatApiResponseOrError::Error { error } => {
                return Err(anyhow!(
                    "Chat API error from {} (code {:?}): {}",
                    self.model,
                    error.code,
                    error.message
                )
                .into());
            }
            ChatApiResponseOrError::Response(parsed) => parsed,
        };

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .context("No choices in response")?;
        let usage = parsed.usage;

        Ok(GenerateOutcome {
            text: choice.message.content,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            cost_usd: price(
                usage.prompt_tokens,
                usage.completion_tokens,
                self.input_cost_per_1m,
                self.output_cost_per_1m,
            ),
        })
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            model_name: self.model.clone(),
            provider: "openai".to_string(),
        }
    }

    fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        price(
            input_tokens,
            output_tokens,
            self.input_cost_per_1m,
            self.output_cost_per_1m,
        )
    }
}

// ============================================================================
// Gemini generateContent
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiResponseOrError {
    Error { error: GeminiError },
    Response(GeminiResponse),
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    message: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
    usage_metadata: GeminiUsage,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct GeminiUsage {
    prompt_token_count: u64,
    candidates_token_count: u64,
    total_token_count: u64,
}

pub struct GeminiProvider {
    http_client: HttpClient,
    rate_limiter: Arc<RateLimiter>,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f64,
    input_cost_per_1m: f64,
    output_cost_per_1m: f64,
}

impl GeminiProvider {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http_client: HttpClient,
        rate_limiter: Arc<RateLimiter>,
        base_url: String,
        api_key: String,
        model: String,
        temperature: f64,
        input_cost_per_1m: f64,
        output_cost_per_1m: f64,
    ) -> Self {
        Self {
            http_client,
            rate_limiter,
            base_url,
            api_key,
            model,
            temperature,
            input_cost_per_1m,
            output_cost_per_1m,
        }
    }
}

#[async_trait]
impl AiProvider for GeminiProvider {
    async fn generate(&self, prompt: &str) -> AppResult<GenerateOutcome> {
        self.rate_limiter
            .admit(&self.model, estimate_tokens(prompt))
            .await?;

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let resp = self
            .http_client
            .post(&url)
            .json(&json!({
                "contents": [
                    { "parts": [ { "text": prompt } ] }
                ],
                "generationConfig": { "temperature": self.temperature },
            }))
            .send()
            .await?
            .json::<serde_json::Value>()
            .await?;

        let parsed = serde_json::from_value::<GeminiResponseOrError>(resp.clone())
            .context(format!("Could not parse Gemini response: {resp}"))?;

        let parsed = match parsed {
            GeminiResponseOrError::Error { error } => {
                return Err(anyhow!(
                    "Gemini API error from {} ({:?}): {}",
                    self.model,
                    error.status,
                    error.message
                )
                .into());
            }
            GeminiResponseOrError::Response(parsed) => parsed,
        };

        let text = parsed
            .candidates
            .into_iter()
            .next()
            .context("No candidates in response")?
            .content
            .parts
            .into_iter()
            .map(|p| p.text)
            .collect::<Vec<_>>()
            .join("");
        let usage = parsed.usage_metadata;

        Ok(GenerateOutcome {
            text,
            input_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
            total_tokens: usage.total_token_count,
            cost_usd: price(
                usage.prompt_token_count,
                usage.candidates_token_count,
                self.input_cost_per_1m,
                self.output_cost_per_1m,
            ),
        })
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            model_name: self.model.clone(),
            provider: "gemini".to_string(),
        }
    }

    fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        price(
            input_tokens,
            output_tokens,
            self.input_cost_per_1m,
            self.output_cost_per_1m,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_response_parses_success_shape() {
        let raw = json!({
            "choices": [ { "message": { "role": "assistant", "content": "hello" }, "finish_reason": "stop" } ],
            "usage": { "prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15 }
        });
        let parsed: ChatApiResponseOrError = serde_json::from_value(raw).unwrap();
        match parsed {
            ChatApiResponseOrError::Response(r) => {
                assert_eq!(r.choices[0].message.content, "hello");
                assert_eq!(r.usage.total_tokens, 15);
            }
            ChatApiResponseOrError::Error { .. } => panic!("expected response"),
        }
    }

    #[test]
    fn chat_response_parses_error_shape() {
        let raw = json!({
            "error": { "message": "Requests rate limit exceeded", "code": 429 }
        });
        let parsed: ChatApiResponseOrError = serde_json::from_value(raw).unwrap();
        match parsed {
            ChatApiResponseOrError::Error { error } => {
                assert!(error.message.contains("rate limit"));
            }
            ChatApiResponseOrError::Response(_) => panic!("expected error"),
        }
    }

    #[test]
    fn gemini_response_joins_parts() {
        let raw = json!({
            "candidates": [ { "content": { "parts": [ { "text": "[1," }, { "text": " 2]" } ], "role": "model" } } ],
            "usageMetadata": { "promptTokenCount": 10, "candidatesTokenCount": 4, "totalTokenCount": 14 }
        });
        let parsed: GeminiResponseOrError = serde_json::from_value(raw).unwrap();
        match parsed {
            GeminiResponseOrError::Response(r) => {
                let text: String = r
                    .candidates
                    .into_iter()
                    .next()
                    .unwrap()
                    .content
                    .parts
                    .into_iter()
                    .map(|p| p.text)
                    .collect();
                assert_eq!(text, "[1, 2]");
            }
            GeminiResponseOrError::Error { .. } => panic!("expected response"),
        }
    }

    #[test]
    fn pricing_uses_per_million_rates() {
        assert_eq!(price(1_000_000, 0, 0.075, 0.3), 0.075);
        assert_eq!(price(0, 2_000_000, 0.075, 0.3), 0.6);
    }
}
