//! Mail-source boundary. The pipeline consumes search pages incrementally
//! and never requires the full result set materialized.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::{AppResult, PipelineError};
use crate::model::AttachmentInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> AppResult<Self> {
        if end < start {
            return Err(PipelineError::InvalidDateRange(format!(
                "end {end} precedes start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        let date = ts.date_naive();
        date >= self.start && date <= self.end
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} to {}", self.start, self.end)
    }
}

#[derive(Debug, Clone)]
pub struct MessageHeader {
    pub email_id: String,
    pub subject: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct FullMessage {
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<AttachmentInfo>,
}

/// One page of a search. An empty `ids` page or a `None` token ends the scan.
#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub ids: Vec<String>,
    pub next_page_token: Option<String>,
    pub result_size_estimate: usize,
}

#[async_trait]
pub trait MailSource: Send + Sync {
    async fn search(
        &self,
        range: &DateRange,
        page_token: Option<&str>,
        max_results: usize,
    ) -> AppResult<MessagePage>;

    async fn fetch_headers(&self, email_id: &str) -> AppResult<MessageHeader>;

    async fn fetch_full(&self, email_id: &str) -> AppResult<FullMessage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_inverted_range() {
        let start = NaiveDate::from_ymd_opt(2024, 5, 10).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        assert!(DateRange::new(start, end).is_err());
        assert!(DateRange::new(end, start).is_ok());
    }
}
