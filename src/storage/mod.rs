//! Persistence boundary. The store is the source of truth for resumability:
//! every stage re-discovers unfinished work from these status queries after
//! a restart instead of trusting queue contents to survive a crash.

mod memory;

pub use memory::MemoryStore;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::AppResult;
use crate::mail::{DateRange, FullMessage};
use crate::model::{
    BookingExtractionStatus, BookingInfo, EmailCategory, ExtractedContent, ExtractionStatus,
    MessageRecord, Trip, TripDetectionStatus,
};

#[async_trait]
pub trait EmailStore: Send + Sync {
    async fn existing_message_ids(&self) -> AppResult<HashSet<String>>;

    /// Insert new messages, skipping ids that already exist. Returns the
    /// number actually inserted.
    async fn insert_messages(&self, messages: Vec<MessageRecord>) -> AppResult<usize>;

    async fn get_message(&self, email_id: &str) -> AppResult<Option<MessageRecord>>;

    async fn set_category(&self, email_id: &str, category: EmailCategory) -> AppResult<()>;

    async fn unclassified_ids(&self) -> AppResult<Vec<String>>;

    /// Create the content row for a travel-classified message if absent.
    /// Idempotent; the classification hand-off calls this before forwarding.
    async fn create_content_if_missing(&self, email_id: &str) -> AppResult<()>;

    async fn get_content(&self, email_id: &str) -> AppResult<Option<ExtractedContent>>;

    /// Travel-classified ids whose content extraction is pending or failed.
    async fn content_pending_ids(&self) -> AppResult<Vec<String>>;

    async fn update_extraction(
        &self,
        email_id: &str,
        status: ExtractionStatus,
        error: Option<String>,
    ) -> AppResult<()>;

    /// Store the fetched body and mark extraction completed in one commit,
    /// so a crash between the two cannot leave a completed row with no body.
    async fn complete_extraction(&self, email_id: &str, full: FullMessage) -> AppResult<()>;

    /// Content-completed travel ids whose booking extraction is pending or
    /// failed.
    async fn booking_pending_ids(&self) -> AppResult<Vec<String>>;

    async fn update_booking_extraction(
        &self,
        email_id: &str,
        status: BookingExtractionStatus,
        error: Option<String>,
    ) -> AppResult<()>;

    /// Persist the decoded booking and its terminal status in one commit.
    /// `booking_type: None` lands as `NoBooking`, otherwise `Completed`.
    async fn complete_booking(&self, email_id: &str, booking: BookingInfo) -> AppResult<()>;

    /// Candidate ids for trip detection: travel-classified, booking
    /// extraction completed with an actual booking, detection pending or
    /// failed. Ordered by message timestamp for chronological batching.
    async fn detection_candidates(&self, range: Option<&DateRange>) -> AppResult<Vec<String>>;

    /// Reset rows stuck in `Detecting` (a prior run died mid-batch) back to
    /// `Pending`. Returns how many were reset.
    async fn reset_stuck_detecting(&self) -> AppResult<usize>;

    async fn update_trip_detection(
        &self,
        email_ids: &[String],
        status: TripDetectionStatus,
        error: Option<String>,
    ) -> AppResult<()>;

    async fn load_trips(&self) -> AppResult<Vec<Trip>>;

    /// Replace the whole persisted trip set atomically (delete-all,
    /// insert-all in one transaction boundary). Returns the new count.
    async fn replace_all_trips(&self, trips: Vec<Trip>) -> AppResult<usize>;

    /// Clear all trips and reset detection statuses so a full re-detection
    /// can run. Returns the number of content rows reset.
    async fn reset_trip_detection(&self) -> AppResult<usize>;
}
