use derive_more::derive::Display;

pub type AppResult<T> = Result<T, PipelineError>;

#[derive(Debug, Display)]
pub enum PipelineError {
    #[display("daily request limit exceeded for {model}")]
    DailyLimitExceeded { model: String },
    #[display("all providers failed, last error: {last_error}")]
    ProvidersExhausted { last_error: String },
    #[display("provider {name} failed to initialize: {reason}")]
    ProviderInit { name: String, reason: String },
    #[display("pipeline is already running")]
    AlreadyRunning,
    #[display("invalid date range: {_0}")]
    InvalidDateRange(String),
    #[display("malformed model response: {_0}")]
    MalformedResponse(String),
    #[display("mail source error: {_0}")]
    MailSource(anyhow::Error),
    #[display("storage error: {_0}")]
    Storage(anyhow::Error),
    #[display("{_0}")]
    Internal(anyhow::Error),
}

impl std::error::Error for PipelineError {}

impl From<anyhow::Error> for PipelineError {
    fn from(error: anyhow::Error) -> Self {
        PipelineError::Internal(error)
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(error: reqwest::Error) -> Self {
        tracing::error!("Reqwest error: {:?}", error);
        PipelineError::Internal(error.into())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(error: serde_json::Error) -> Self {
        PipelineError::MalformedResponse(error.to_string())
    }
}

impl PipelineError {
    /// True for failures that should not be retried within the same day.
    pub fn is_daily_limit(&self) -> bool {
        matches!(self, PipelineError::DailyLimitExceeded { .. })
    }
}
