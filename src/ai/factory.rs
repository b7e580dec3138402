//! Builds providers from (provider, tier) pairs. The factory is
//! constructor-injected wherever a fallback chain is assembled; there is no
//! global provider state.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{ModelTier, ProviderConfig, ProviderKind};
use crate::error::{AppResult, PipelineError};
use crate::HttpClient;

use super::providers::{GeminiProvider, OpenAiProvider};
use super::rate_limiter::RateLimiter;
use super::AiProvider;

pub trait ProviderFactory: Send + Sync {
    fn create(&self, kind: ProviderKind, tier: ModelTier) -> AppResult<Box<dyn AiProvider>>;
}

pub struct HttpProviderFactory {
    http_client: HttpClient,
    rate_limiter: Arc<RateLimiter>,
    providers: HashMap<ProviderKind, ProviderConfig>,
}

impl HttpProviderFactory {
    pub fn new(
        http_client: HttpClient,
        rate_limiter: Arc<RateLimiter>,
        providers: HashMap<ProviderKind, ProviderConfig>,
    ) -> Self {
        Self {
            http_client,
            rate_limiter,
            providers,
        }
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn create(&self, kind: ProviderKind, tier: ModelTier) -> AppResult<Box<dyn AiProvider>> {
        let cfg = self
            .providers
            .get(&kind)
            .ok_or_else(|| PipelineError::ProviderInit {
                name: format!("{kind}-{tier}"),
                reason: "provider not configured".to_string(),
            })?;

        if cfg.api_key.is_empty() {
            return Err(PipelineError::ProviderInit {
                name: format!("{kind}-{tier}"),
                reason: "missing API key".to_string(),
            });
        }

        let model = cfg.model_for(tier).to_string();
        tracing::info!("Initializing provider: {}-{} ({})", kind, tier, model);

        let provider: Box<dyn AiProvider> = match kind {
            ProviderKind::OpenAi => Box::new(OpenAiProvider::new(
                self.http_client.clone(),
                self.rate_limiter.clone(),
                cfg.base_url.clone(),
                cfg.api_key.clone(),
                model,
                cfg.temperature,
                cfg.input_cost_per_1m,
                cfg.output_cost_per_1m,
            )),
            ProviderKind::Gemini => Box::new(GeminiProvider::new(
                self.http_client.clone(),
                self.rate_limiter.clone(),
                cfg.base_url.clone(),
                cfg.api_key.clone(),
                model,
                cfg.temperature,
                cfg.input_cost_per_1m,
                cfg.output_cost_per_1m,
            )),
        };

        Ok(provider)
    }
}
