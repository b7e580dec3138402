use std::collections::HashMap;

use config::{Config, ConfigError};
use serde::Deserialize;

/// Provider identity for a fallback chain entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Gemini,
}

/// Model tier within a provider. `Fast` maps to the cheap high-throughput
/// model, `Quality` to the slower flagship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ModelTier {
    Fast,
    Quality,
}

/// One (provider, tier) pair in a fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ProviderEntry {
    pub provider: ProviderKind,
    pub tier: ModelTier,
}

impl ProviderEntry {
    pub fn new(provider: ProviderKind, tier: ModelTier) -> Self {
        Self { provider, tier }
    }
}

impl std::fmt::Display for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.provider, self.tier)
    }
}

/// Hard API limits for one model. Safety margins are applied by the
/// rate limiter, not baked in here.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelLimits {
    pub requests_per_minute: u32,
    pub requests_per_day: u32,
    pub tokens_per_minute: u32,
}

/// Connection + pricing details for one provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
    pub base_url: String,
    pub fast_model: String,
    pub quality_model: String,
    pub input_cost_per_1m: f64,
    pub output_cost_per_1m: f64,
    pub temperature: f64,
}

impl ProviderConfig {
    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Fast => &self.fast_model,
            ModelTier::Quality => &self.quality_model,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    pub import_batch_size: usize,
    pub classification_batch_size: usize,
    pub content_batch_size: usize,
    pub booking_batch_size: usize,
    pub queue_bound: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    pub batch_size: usize,
    /// Lowercased location names counted as "home area"; bookings entirely
    /// inside this area are not trip-worthy.
    pub local_area: Vec<String>,
    pub estimated_input_tokens_per_email: u64,
    pub estimated_output_tokens_per_email: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub batch: BatchConfig,
    pub detection: DetectionConfig,
    /// Model id fragment -> hard limits. Matched by substring so
    /// "gemini-2.5-flash" picks up the "gemini-2.5-flash" entry even when
    /// the provider appends a version suffix.
    pub rate_limits: HashMap<String, ModelLimits>,
    pub providers: HashMap<ProviderKind, ProviderConfig>,
    pub classification_fallback: Vec<ProviderEntry>,
    pub booking_fallback: Vec<ProviderEntry>,
    pub detection_fallback: Vec<ProviderEntry>,
}

impl PipelineConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;

        builder.try_deserialize()
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut rate_limits = HashMap::new();
        rate_limits.insert(
            "gemini-2.5-pro".to_string(),
            ModelLimits {
                requests_per_minute: 5,
                requests_per_day: 100,
                tokens_per_minute: 250_000,
            },
        );
        rate_limits.insert(
            "gemini-2.5-flash".to_string(),
            ModelLimits {
                requests_per_minute: 10,
                requests_per_day: 1000,
                tokens_per_minute: 250_000,
            },
        );
        rate_limits.insert(
            "gpt-4o-mini".to_string(),
            ModelLimits {
                requests_per_minute: 60,
                requests_per_day: 10_000,
                tokens_per_minute: 2_000_000,
            },
        );

        let mut providers = HashMap::new();
        providers.insert(
            ProviderKind::Gemini,
            ProviderConfig {
                api_key: std::env::var("GEMINI_API_KEY").unwrap_or_default(),
                base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                fast_model: "gemini-2.5-flash".to_string(),
                quality_model: "gemini-2.5-pro".to_string(),
                input_cost_per_1m: 0.075,
                output_cost_per_1m: 0.3,
                temperature: 0.1,
            },
        );
        providers.insert(
            ProviderKind::OpenAi,
            ProviderConfig {
                api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
                base_url: "https://api.openai.com/v1".to_string(),
                fast_model: "gpt-4o-mini".to_string(),
                quality_model: "gpt-4o".to_string(),
                input_cost_per_1m: 0.15,
                output_cost_per_1m: 0.6,
                temperature: 0.1,
            },
        );

        Self {
            batch: BatchConfig {
                import_batch_size: 100,
                classification_batch_size: 20,
                content_batch_size: 10,
                booking_batch_size: 10,
                queue_bound: 10,
            },
            detection: DetectionConfig {
                batch_size: 10,
                local_area: [
                    "zurich",
                    "zürich",
                    "zuerich",
                    "winterthur",
                    "uster",
                    "dübendorf",
                    "dietikon",
                    "wetzikon",
                    "kloten",
                    "opfikon",
                    "wallisellen",
                    "bülach",
                    "regensdorf",
                    "schlieren",
                    "zurich airport",
                    "zürich flughafen",
                    "zrh",
                ]
                .into_iter()
                .map(str::to_string)
                .collect(),
                estimated_input_tokens_per_email: 1000,
                estimated_output_tokens_per_email: 500,
            },
            rate_limits,
            providers,
            classification_fallback: vec![
                ProviderEntry::new(ProviderKind::OpenAi, ModelTier::Fast),
                ProviderEntry::new(ProviderKind::Gemini, ModelTier::Fast),
            ],
            booking_fallback: vec![
                ProviderEntry::new(ProviderKind::Gemini, ModelTier::Fast),
                ProviderEntry::new(ProviderKind::OpenAi, ModelTier::Fast),
            ],
            detection_fallback: vec![
                ProviderEntry::new(ProviderKind::Gemini, ModelTier::Fast),
                ProviderEntry::new(ProviderKind::OpenAi, ModelTier::Fast),
            ],
        }
    }
}
