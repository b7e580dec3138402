//! Booking extraction stage: runs the LLM extraction function per email
//! and persists the decoded fragment. Terminal status is written only
//! after both the LLM call and the store write succeed, so a crash
//! mid-batch leaves the item re-discoverable as pending work.
//!
//! This is the tail of the queue chain; trip detection is triggered
//! separately because it operates on the full persisted booking corpus.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AppResult;
use crate::extract::{EmailForExtraction, TravelExtractor};
use crate::model::{BookingExtractionStatus, ExtractionStatus};
use crate::pipeline::queues::EmailBatch;
use crate::pipeline::stage::PipelineStage;
use crate::pipeline::state::StageState;
use crate::storage::EmailStore;

pub struct BookingExtractionStage {
    store: Arc<dyn EmailStore>,
    extractor: Arc<dyn TravelExtractor>,
    state: StageState,
    batch_size: usize,
}

impl BookingExtractionStage {
    pub fn new(
        store: Arc<dyn EmailStore>,
        extractor: Arc<dyn TravelExtractor>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            extractor,
            state: StageState::new("booking"),
            batch_size,
        }
    }
}

#[async_trait]
impl PipelineStage for BookingExtractionStage {
    fn name(&self) -> &'static str {
        "booking"
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn state(&self) -> &StageState {
        &self.state
    }

    async fn check_pending_work(&self) -> AppResult<Option<Vec<String>>> {
        let pending = self.store.booking_pending_ids().await?;
        if pending.is_empty() {
            Ok(None)
        } else {
            tracing::info!("Found {} emails pending booking extraction", pending.len());
            Ok(Some(pending))
        }
    }

    async fn process_batch(&self, batch: EmailBatch) -> AppResult<Option<EmailBatch>> {
        let snapshot = self.state.snapshot();
        let mut processed = snapshot.processed;
        let mut failed = snapshot.failed;
        let mut bookings_found = snapshot.bookings_found;
        let total = snapshot.total + batch.len();

        for email_id in &batch.email_ids {
            let Some(message) = self.store.get_message(email_id).await? else {
                continue;
            };
            let Some(content) = self.store.get_content(email_id).await? else {
                continue;
            };
            if content.extraction_status != ExtractionStatus::Completed {
                continue;
            }
            if matches!(
                content.booking_extraction_status,
                BookingExtractionStatus::Completed | BookingExtractionStatus::NoBooking
            ) {
                // Already extracted on a prior delivery.
                continue;
            }

            self.store
                .update_booking_extraction(email_id, BookingExtractionStatus::Extracting, None)
                .await?;

            let email = EmailForExtraction {
                email_id: email_id.clone(),
                subject: message.subject.clone(),
                sender: message.sender.clone(),
                body: content
                    .body_text
                    .or(content.body_html)
                    .unwrap_or_default(),
            };

            match self.extractor.extract_booking(&email).await {
                Ok(booking) => {
                    if booking.is_booking() {
                        bookings_found += 1;
                    }
                    self.store.complete_booking(email_id, booking).await?;
                }
                Err(e) => {
                    tracing::warn!("Booking extraction failed for {}: {}", email_id, e);
                    self.store
                        .update_booking_extraction(
                            email_id,
                            BookingExtractionStatus::Failed,
                            Some(e.to_string()),
                        )
                        .await?;
                    failed += 1;
                }
            }
            processed += 1;
        }

        self.state.update(|s| {
            s.processed = processed;
            s.total = total;
            s.failed = failed;
            s.bookings_found = bookings_found;
        });

        Ok(None)
    }
}
