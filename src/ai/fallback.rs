//! Ordered provider fallback. The chain walks its (provider, tier) pairs:
//! pairs that fail to initialize are skipped, any `generate` failure
//! advances to the next pair with the same prompt, and exhaustion surfaces
//! the last underlying error. Resetting puts the primary provider back in
//! charge so a transient failure does not demote it permanently.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::ProviderEntry;
use crate::error::{AppResult, PipelineError};

use super::factory::ProviderFactory;
use super::{AiProvider, GenerateOutcome, ModelInfo};

struct ChainState {
    index: usize,
    current: Option<Box<dyn AiProvider>>,
}

pub struct FallbackChain {
    order: Vec<ProviderEntry>,
    factory: Arc<dyn ProviderFactory>,
    state: Mutex<ChainState>,
}

impl FallbackChain {
    pub fn new(order: Vec<ProviderEntry>, factory: Arc<dyn ProviderFactory>) -> AppResult<Self> {
        if order.is_empty() {
            return Err(
                anyhow::anyhow!("at least one provider configuration must be specified").into(),
            );
        }
        Ok(Self {
            order,
            factory,
            state: Mutex::new(ChainState {
                index: 0,
                current: None,
            }),
        })
    }

    /// Ensure `state.current` holds a provider, advancing past entries that
    /// fail to initialize. Records the last init error in `last_error`.
    fn ensure_provider(&self, state: &mut ChainState, last_error: &mut Option<String>) -> bool {
        while state.current.is_none() {
            let Some(entry) = self.order.get(state.index) else {
                return false;
            };
            match self.factory.create(entry.provider, entry.tier) {
                Ok(provider) => {
                    tracing::info!("Fallback chain using {}", provider.model_info());
                    state.current = Some(provider);
                }
                Err(e) => {
                    tracing::error!("Failed to initialize {}: {}", entry, e);
                    *last_error = Some(e.to_string());
                    state.index += 1;
                }
            }
        }
        true
    }

    pub async fn generate(&self, prompt: &str) -> AppResult<GenerateOutcome> {
        let mut state = self.state.lock().await;
        let mut last_error: Option<String> = None;

        loop {
            if !self.ensure_provider(&mut state, &mut last_error) {
                tracing::error!("All providers exhausted in fallback order");
                return Err(PipelineError::ProvidersExhausted {
                    last_error: last_error.unwrap_or_else(|| "no provider available".to_string()),
                });
            }

            let (info, result) = {
                let provider = state.current.as_ref().unwrap();
                let info = provider.model_info();
                tracing::debug!("Calling AI provider: {}", info);
                (info, provider.generate(prompt).await)
            };

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    tracing::warn!("Provider {} failed: {}", info, e);
                    last_error = Some(e.to_string());
                    state.index += 1;
                    state.current = None;
                }
            }
        }
    }

    /// Back to the first configured pair for the next call.
    pub async fn reset_to_primary(&self) {
        let mut state = self.state.lock().await;
        if state.index != 0 {
            tracing::info!("Resetting to primary provider {}", self.order[0]);
        }
        state.index = 0;
        state.current = None;
    }

    pub async fn current_model_info(&self) -> Option<ModelInfo> {
        let mut state = self.state.lock().await;
        let mut last_error = None;
        if !self.ensure_provider(&mut state, &mut last_error) {
            return None;
        }
        state.current.as_ref().map(|p| p.model_info())
    }

    pub async fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        let mut state = self.state.lock().await;
        let mut last_error = None;
        if !self.ensure_provider(&mut state, &mut last_error) {
            return 0.0;
        }
        state
            .current
            .as_ref()
            .map(|p| p.estimate_cost(input_tokens, output_tokens))
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::config::{ModelTier, ProviderKind};

    struct ScriptedProvider {
        name: String,
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AiProvider for ScriptedProvider {
        async fn generate(&self, _prompt: &str) -> AppResult<GenerateOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(anyhow::anyhow!("{} refused", self.name).into())
            } else {
                Ok(GenerateOutcome {
                    text: format!("answer from {}", self.name),
                    input_tokens: 10,
                    output_tokens: 5,
                    total_tokens: 15,
                    cost_usd: 0.0,
                })
            }
        }

        fn model_info(&self) -> ModelInfo {
            ModelInfo {
                model_name: self.name.clone(),
                provider: "scripted".to_string(),
            }
        }

        fn estimate_cost(&self, _input: u64, _output: u64) -> f64 {
            0.0
        }
    }

    /// Factory whose nth creation yields a provider scripted to fail or
    /// succeed; `init_fail` entries refuse to build at all.
    struct ScriptedFactory {
        fail_generate: Vec<bool>,
        init_fail: Vec<bool>,
        built: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedFactory {
        fn new(fail_generate: Vec<bool>, init_fail: Vec<bool>) -> Self {
            Self {
                fail_generate,
                init_fail,
                built: Arc::new(AtomicUsize::new(0)),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl ProviderFactory for ScriptedFactory {
        fn create(
            &self,
            kind: ProviderKind,
            tier: ModelTier,
        ) -> AppResult<Box<dyn AiProvider>> {
            let n = self.built.fetch_add(1, Ordering::SeqCst);
            if self.init_fail.get(n).copied().unwrap_or(false) {
                return Err(PipelineError::ProviderInit {
                    name: format!("{kind}-{tier}"),
                    reason: "scripted init failure".to_string(),
                });
            }
            Ok(Box::new(ScriptedProvider {
                name: format!("provider-{n}"),
                fail: self.fail_generate.get(n).copied().unwrap_or(false),
                calls: self.calls.clone(),
            }))
        }
    }

    fn order(n: usize) -> Vec<ProviderEntry> {
        (0..n)
            .map(|_| ProviderEntry::new(ProviderKind::Gemini, ModelTier::Fast))
            .collect()
    }

    #[tokio::test]
    async fn falls_back_to_next_provider_on_failure() {
        let factory = Arc::new(ScriptedFactory::new(vec![true, false], vec![]));
        let chain = FallbackChain::new(order(2), factory.clone()).unwrap();

        let outcome = chain.generate("prompt").await.unwrap();
        assert_eq!(outcome.text, "answer from provider-1");
        assert_eq!(factory.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhaustion_reports_last_error_and_stops() {
        let factory = Arc::new(ScriptedFactory::new(vec![true, true, true], vec![]));
        let chain = FallbackChain::new(order(3), factory.clone()).unwrap();

        let err = chain.generate("prompt").await.unwrap_err();
        match err {
            PipelineError::ProvidersExhausted { last_error } => {
                assert!(last_error.contains("provider-2 refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // Three generate attempts, never a fourth.
        assert_eq!(factory.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn init_failures_are_skipped_recursively() {
        let factory = Arc::new(ScriptedFactory::new(
            vec![false, false, false],
            vec![true, true, false],
        ));
        let chain = FallbackChain::new(order(3), factory.clone()).unwrap();

        let outcome = chain.generate("prompt").await.unwrap();
        assert_eq!(outcome.text, "answer from provider-2");
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reset_returns_to_primary() {
        let factory = Arc::new(ScriptedFactory::new(vec![true, false, false], vec![]));
        let chain = FallbackChain::new(order(2), factory.clone()).unwrap();

        let first = chain.generate("prompt").await.unwrap();
        assert_eq!(first.text, "answer from provider-1");

        chain.reset_to_primary().await;
        // Builds index 0 again; the factory's third build succeeds.
        let second = chain.generate("prompt").await.unwrap();
        assert_eq!(second.text, "answer from provider-2");
    }

    #[tokio::test]
    async fn empty_order_is_rejected() {
        let factory = Arc::new(ScriptedFactory::new(vec![], vec![]));
        assert!(FallbackChain::new(vec![], factory).is_err());
    }
}
