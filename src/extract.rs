//! The extraction-function contract and its LLM-backed implementation.
//!
//! The three operations are opaque prompt/parse round trips: deterministic
//! JSON shape on success, an error otherwise. `detect_trips` additionally
//! promises, best effort, to return at least the trips it was given; the
//! trip engine verifies that instead of trusting it.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indoc::formatdoc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::ai::FallbackChain;
use crate::error::{AppResult, PipelineError};
use crate::mail::MessageHeader;
use crate::model::{BookingInfo, EmailCategory, Trip};

/// Email content handed to booking extraction.
#[derive(Debug, Clone)]
pub struct EmailForExtraction {
    pub email_id: String,
    pub subject: String,
    pub sender: String,
    pub body: String,
}

/// Validated booking fragment plus the message metadata trip detection
/// needs for chronological context.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FragmentForDetection {
    pub email_id: String,
    pub subject: String,
    pub sender: String,
    pub date: DateTime<Utc>,
    pub category: EmailCategory,
    pub booking: BookingInfo,
}

#[async_trait]
pub trait TravelExtractor: Send + Sync {
    /// One category per header, same order as the input.
    async fn classify(&self, headers: &[MessageHeader]) -> AppResult<Vec<EmailCategory>>;

    async fn extract_booking(&self, email: &EmailForExtraction) -> AppResult<BookingInfo>;

    /// Full replacement trip list for the given fragments in the context of
    /// the existing trips.
    async fn detect_trips(
        &self,
        fragments: &[FragmentForDetection],
        existing: &[Trip],
    ) -> AppResult<Vec<Trip>>;

    /// Put the underlying provider chain back on its primary entry.
    async fn reset(&self) {}

    async fn estimate_cost(&self, _input_tokens: u64, _output_tokens: u64) -> f64 {
        0.0
    }
}

// ============================================================================
// JSON salvage
// ============================================================================

static RE_CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").unwrap());

/// Models wrap JSON in fences or chatter around it often enough that a bare
/// `serde_json::from_str` is not viable. Unwrap a fenced block if present,
/// otherwise slice from the first `{`/`[` to the matching last bracket.
fn extract_json_payload(text: &str) -> &str {
    if let Some(caps) = RE_CODE_FENCE.captures(text) {
        return caps.get(1).map(|m| m.as_str()).unwrap_or(text);
    }
    let object = text.find('{').zip(text.rfind('}'));
    let array = text.find('[').zip(text.rfind(']'));
    let slice = match (object, array) {
        (Some((os, oe)), Some((as_, ae))) => {
            if as_ < os {
                (as_, ae)
            } else {
                (os, oe)
            }
        }
        (Some(bounds), None) => bounds,
        (None, Some(bounds)) => bounds,
        (None, None) => return text,
    };
    &text[slice.0..=slice.1]
}

pub fn parse_model_json<T: DeserializeOwned>(text: &str) -> AppResult<T> {
    let payload = extract_json_payload(text);
    serde_json::from_str(payload).map_err(|e| {
        PipelineError::MalformedResponse(format!(
            "{e}; payload head: {}",
            payload.chars().take(200).collect::<String>()
        ))
    })
}

// ============================================================================
// LLM-backed implementation
// ============================================================================

/// Each operation runs on its own fallback chain so classification,
/// booking extraction and trip detection can carry different provider
/// orders (and fail over independently).
pub struct LlmExtractor {
    classification_chain: FallbackChain,
    booking_chain: FallbackChain,
    detection_chain: FallbackChain,
}

impl LlmExtractor {
    pub fn new(
        classification_chain: FallbackChain,
        booking_chain: FallbackChain,
        detection_chain: FallbackChain,
    ) -> Self {
        Self {
            classification_chain,
            booking_chain,
            detection_chain,
        }
    }

    /// Wire the full provider stack from config: one shared rate limiter,
    /// one provider factory, three independently ordered chains.
    pub fn from_config(
        http_client: crate::HttpClient,
        config: &crate::config::PipelineConfig,
    ) -> AppResult<Self> {
        use std::sync::Arc;

        use crate::ai::{HttpProviderFactory, RateLimiter};

        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limits.clone()));
        let factory: Arc<dyn crate::ai::ProviderFactory> = Arc::new(HttpProviderFactory::new(
            http_client,
            rate_limiter,
            config.providers.clone(),
        ));

        Ok(Self::new(
            FallbackChain::new(config.classification_fallback.clone(), factory.clone())?,
            FallbackChain::new(config.booking_fallback.clone(), factory.clone())?,
            FallbackChain::new(config.detection_fallback.clone(), factory)?,
        ))
    }

    fn classification_prompt(headers: &[MessageHeader]) -> String {
        let categories = [
            "flight",
            "hotel",
            "car_rental",
            "train",
            "cruise",
            "tour",
            "travel_insurance",
            "flight_change",
            "hotel_change",
            "other_travel",
            "marketing",
            "not_travel",
            "general_info",
            "account_management",
            "restaurant_reservation",
            "security",
        ]
        .join(", ");

        let emails = headers
            .iter()
            .enumerate()
            .map(|(i, h)| {
                format!(
                    "<email index=\"{i}\"><subject>{}</subject><sender>{}</sender></email>",
                    h.subject, h.sender
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        formatdoc! {r#"
            You categorize emails by subject and sender. Choose exactly one category
            per email from: [{categories}]
            Respond with only a JSON array of objects {{"index": <number>, "category": "<category>"}},
            one per input email, no explanations.

            {emails}"#}
    }

    fn booking_prompt(email: &EmailForExtraction) -> String {
        formatdoc! {r#"
            Extract structured travel booking data from the email below. Respond with
            only a JSON object. For an actual booking set "booking_type" to one of
            [flight, hotel, car_rental, train, cruise, tour, travel_insurance,
            cancellation, modification] and fill "transport_segments",
            "accommodations", "activities" and "cruises" arrays with the segments the
            email evidences (datetimes as YYYY-MM-DDTHH:MM:SS, dates as YYYY-MM-DD).
            For an informational email set "booking_type" to null and give
            "non_booking_type" and "reason".

            <subject>{subject}</subject>
            <sender>{sender}</sender>
            <body>{body}</body>"#,
            subject = email.subject,
            sender = email.sender,
            body = email.body,
        }
    }

    fn detection_prompt(fragments_json: &str, existing_json: &str) -> String {
        formatdoc! {r#"
            You organize travel bookings into trips. Below are existing trips and a
            new batch of booking emails in chronological order. Merge the new
            bookings into the trips, creating new trips where none fits. Return the
            COMPLETE updated trip list as a JSON array - every existing trip must
            appear in your answer, updated or unchanged. Each trip has "name",
            "destination", "start_date", "end_date", "cities", "total_cost",
            "transport_segments", "accommodations", "activities" and "cruises";
            every segment lists the contributing email ids in "related_email_ids".

            <existing_trips>{existing_json}</existing_trips>
            <new_bookings>{fragments_json}</new_bookings>"#}
    }
}

#[derive(Debug, Deserialize)]
struct CategoryAnswer {
    index: usize,
    category: String,
}

/// Trip lists come back either bare or wrapped in a "trips" object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TripsAnswer {
    Wrapped { trips: Vec<Trip> },
    Bare(Vec<Trip>),
}

#[async_trait]
impl TravelExtractor for LlmExtractor {
    async fn classify(&self, headers: &[MessageHeader]) -> AppResult<Vec<EmailCategory>> {
        if headers.is_empty() {
            return Ok(Vec::new());
        }

        let prompt = Self::classification_prompt(headers);
        let outcome = self.classification_chain.generate(&prompt).await?;
        let answers: Vec<CategoryAnswer> = parse_model_json(&outcome.text)?;

        let mut categories = vec![EmailCategory::ClassificationFailed; headers.len()];
        for answer in answers {
            if let Some(slot) = categories.get_mut(answer.index) {
                *slot = EmailCategory::from_str(&answer.category)
                    .unwrap_or(EmailCategory::ClassificationFailed);
            }
        }
        Ok(categories)
    }

    async fn extract_booking(&self, email: &EmailForExtraction) -> AppResult<BookingInfo> {
        let prompt = Self::booking_prompt(email);
        let outcome = self.booking_chain.generate(&prompt).await?;
        parse_model_json(&outcome.text)
    }

    async fn detect_trips(
        &self,
        fragments: &[FragmentForDetection],
        existing: &[Trip],
    ) -> AppResult<Vec<Trip>> {
        let fragments_json =
            serde_json::to_string(fragments).map_err(|e| PipelineError::Internal(e.into()))?;
        let existing_json =
            serde_json::to_string(existing).map_err(|e| PipelineError::Internal(e.into()))?;

        let prompt = Self::detection_prompt(&fragments_json, &existing_json);
        let outcome = self.detection_chain.generate(&prompt).await?;
        let answer: TripsAnswer = parse_model_json(&outcome.text)?;
        Ok(match answer {
            TripsAnswer::Wrapped { trips } => trips,
            TripsAnswer::Bare(trips) => trips,
        })
    }

    async fn reset(&self) {
        self.detection_chain.reset_to_primary().await;
    }

    async fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        self.detection_chain
            .estimate_cost(input_tokens, output_tokens)
            .await
    }
}
