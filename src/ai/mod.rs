//! AI provider layer: the uniform generate contract, per-model rate
//! limiting and the ordered fallback chain every LLM-backed step runs on.

pub mod factory;
pub mod fallback;
pub mod providers;
pub mod rate_limiter;

pub use factory::{HttpProviderFactory, ProviderFactory};
pub use fallback::FallbackChain;
pub use rate_limiter::RateLimiter;

use async_trait::async_trait;

use crate::error::AppResult;

/// Result of one model call.
#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub model_name: String,
    pub provider: String,
}

impl std::fmt::Display for ModelInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model_name)
    }
}

#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Send a prompt, get text plus token counts and cost. Any error is a
    /// signal for the fallback chain to advance.
    async fn generate(&self, prompt: &str) -> AppResult<GenerateOutcome>;

    fn model_info(&self) -> ModelInfo;

    fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64;
}
