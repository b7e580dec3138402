//! Per-model request/token budgets over rolling time windows.
//!
//! Three budgets must all clear before a call proceeds: requests in the
//! last 60 seconds, tokens in the last 60 seconds and requests in the
//! current UTC calendar day, each under a safety margin of the configured
//! hard limit. A saturated minute window delays the caller until the
//! oldest entry ages out; a saturated day fails immediately, since no
//! amount of waiting helps within the same day.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use tokio::sync::Mutex;

use crate::config::ModelLimits;
use crate::error::{AppResult, PipelineError};

const RPM_SAFETY: f64 = 0.8;
const TPM_SAFETY: f64 = 0.8;
const RPD_SAFETY: f64 = 0.9;
const WINDOW: Duration = Duration::from_secs(60);
/// Extra second past the oldest entry's expiry, matching the window math's
/// one-second granularity.
const WAIT_BUFFER: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct ModelUsage {
    requests: VecDeque<Instant>,
    tokens: VecDeque<(Instant, u32)>,
    day: Option<NaiveDate>,
    daily_requests: u32,
}

impl ModelUsage {
    fn prune(&mut self, now: Instant, today: NaiveDate) {
        while let Some(front) = self.requests.front() {
            if now.duration_since(*front) >= WINDOW {
                self.requests.pop_front();
            } else {
                break;
            }
        }
        while let Some((front, _)) = self.tokens.front() {
            if now.duration_since(*front) >= WINDOW {
                self.tokens.pop_front();
            } else {
                break;
            }
        }
        if self.day != Some(today) {
            self.day = Some(today);
            self.daily_requests = 0;
        }
    }

    fn tokens_in_window(&self) -> u64 {
        self.tokens.iter().map(|(_, t)| *t as u64).sum()
    }
}

/// Wait needed before the given request may proceed, or a daily-limit error.
/// Pure over `now`/`today` so tests can assert exact waits.
fn compute_wait(
    usage: &mut ModelUsage,
    limits: &ModelLimits,
    model: &str,
    estimated_tokens: u32,
    now: Instant,
    today: NaiveDate,
) -> AppResult<Duration> {
    usage.prune(now, today);

    let rpm_limit = (limits.requests_per_minute as f64 * RPM_SAFETY) as usize;
    let rpd_limit = (limits.requests_per_day as f64 * RPD_SAFETY) as u32;
    let tpm_limit = (limits.tokens_per_minute as f64 * TPM_SAFETY) as u64;

    if usage.daily_requests >= rpd_limit {
        return Err(PipelineError::DailyLimitExceeded {
            model: model.to_string(),
        });
    }

    let mut wait = Duration::ZERO;

    if usage.requests.len() >= rpm_limit.max(1) {
        if let Some(oldest) = usage.requests.front() {
            let age = now.duration_since(*oldest);
            if age < WINDOW {
                wait = wait.max(WINDOW - age + WAIT_BUFFER);
            }
        }
    }

    if usage.tokens_in_window() + estimated_tokens as u64 > tpm_limit {
        if let Some((oldest, _)) = usage.tokens.front() {
            let age = now.duration_since(*oldest);
            if age < WINDOW {
                wait = wait.max(WINDOW - age + WAIT_BUFFER);
            }
        }
    }

    Ok(wait)
}

#[derive(Debug, Clone)]
pub struct ModelUsageStats {
    pub requests_last_minute: usize,
    pub requests_today: u32,
    pub tokens_last_minute: u64,
    pub rpm_usage_percent: f64,
    pub rpd_usage_percent: f64,
    pub tpm_usage_percent: f64,
}

/// Safe for concurrent callers from multiple stages; one lock guards all
/// per-model counters, held across the wait so admissions serialize.
pub struct RateLimiter {
    limits: HashMap<String, ModelLimits>,
    state: Mutex<HashMap<String, ModelUsage>>,
}

impl RateLimiter {
    pub fn new(limits: HashMap<String, ModelLimits>) -> Self {
        Self {
            limits,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Configured limits for a model id, matched by substring so versioned
    /// ids resolve to their family entry.
    fn limits_for(&self, model: &str) -> Option<&ModelLimits> {
        let model_lower = model.to_lowercase();
        self.limits
            .iter()
            .find(|(key, _)| model_lower.contains(&key.to_lowercase()))
            .map(|(_, limits)| limits)
    }

    /// Block until the request fits every budget, then record it. Returns
    /// how long the caller was delayed.
    pub async fn admit(&self, model: &str, estimated_tokens: u32) -> AppResult<Duration> {
        let Some(limits) = self.limits_for(model) else {
            tracing::warn!("No rate limits configured for model {}", model);
            return Ok(Duration::ZERO);
        };

        let mut state = self.state.lock().await;
        let usage = state.entry(model.to_string()).or_default();

        let wait = compute_wait(
            usage,
            limits,
            model,
            estimated_tokens,
            Instant::now(),
            Utc::now().date_naive(),
        )?;

        if wait > Duration::ZERO {
            tracing::info!(
                "Rate limit: waiting {:.1}s before calling {}",
                wait.as_secs_f64(),
                model
            );
            tokio::time::sleep(wait).await;
        }

        let now = Instant::now();
        usage.prune(now, Utc::now().date_naive());
        usage.requests.push_back(now);
        usage.tokens.push_back((now, estimated_tokens));
        usage.daily_requests += 1;

        Ok(wait)
    }

    pub async fn usage_stats(&self) -> HashMap<String, ModelUsageStats> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let today = Utc::now().date_naive();

        let mut stats = HashMap::new();
        for (model, usage) in state.iter_mut() {
            usage.prune(now, today);
            let limits = self.limits_for(model);
            let (rpm, rpd, tpm) = limits
                .map(|l| {
                    (
                        l.requests_per_minute as f64,
                        l.requests_per_day as f64,
                        l.tokens_per_minute as f64,
                    )
                })
                .unwrap_or((0.0, 0.0, 0.0));
            stats.insert(
                model.clone(),
                ModelUsageStats {
                    requests_last_minute: usage.requests.len(),
                    requests_today: usage.daily_requests,
                    tokens_last_minute: usage.tokens_in_window(),
                    rpm_usage_percent: percent(usage.requests.len() as f64, rpm),
                    rpd_usage_percent: percent(usage.daily_requests as f64, rpd),
                    tpm_usage_percent: percent(usage.tokens_in_window() as f64, tpm),
                },
            );
        }
        stats
    }
}

fn percent(used: f64, limit: f64) -> f64 {
    if limit > 0.0 {
        used / limit * 100.0
    } else {
        0.0
    }
}
