//! In-memory `EmailStore` used by tests and local runs.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::AppResult;
use crate::mail::{DateRange, FullMessage};
use crate::model::{
    BookingExtractionStatus, BookingInfo, EmailCategory, ExtractedContent, ExtractionStatus,
    MessageRecord, Trip, TripDetectionStatus,
};

use super::EmailStore;

#[derive(Default)]
pub struct MemoryStore {
    messages: RwLock<HashMap<String, MessageRecord>>,
    contents: RwLock<HashMap<String, ExtractedContent>>,
    trips: RwLock<Vec<Trip>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sorted by message timestamp, ties broken by id for determinism.
    fn ids_sorted_by_timestamp(&self, ids: Vec<String>) -> Vec<String> {
        let messages = self.messages.read().unwrap();
        let mut ids = ids;
        ids.sort_by(|a, b| {
            let ta = messages.get(a).map(|m| m.timestamp);
            let tb = messages.get(b).map(|m| m.timestamp);
            ta.cmp(&tb).then_with(|| a.cmp(b))
        });
        ids
    }
}

#[async_trait]
impl EmailStore for MemoryStore {
    async fn existing_message_ids(&self) -> AppResult<HashSet<String>> {
        Ok(self.messages.read().unwrap().keys().cloned().collect())
    }

    async fn insert_messages(&self, records: Vec<MessageRecord>) -> AppResult<usize> {
        let mut messages = self.messages.write().unwrap();
        let mut inserted = 0;
        for record in records {
            if !messages.contains_key(&record.email_id) {
                messages.insert(record.email_id.clone(), record);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn get_message(&self, email_id: &str) -> AppResult<Option<MessageRecord>> {
        Ok(self.messages.read().unwrap().get(email_id).cloned())
    }

    async fn set_category(&self, email_id: &str, category: EmailCategory) -> AppResult<()> {
        if let Some(msg) = self.messages.write().unwrap().get_mut(email_id) {
            msg.category = category;
        }
        Ok(())
    }

    async fn unclassified_ids(&self) -> AppResult<Vec<String>> {
        let ids = self
            .messages
            .read()
            .unwrap()
            .values()
            .filter(|m| m.category == EmailCategory::Unclassified)
            .map(|m| m.email_id.clone())
            .collect();
        Ok(self.ids_sorted_by_timestamp(ids))
    }

    async fn create_content_if_missing(&self, email_id: &str) -> AppResult<()> {
        let mut contents = self.contents.write().unwrap();
        contents
            .entry(email_id.to_string())
            .or_insert_with(|| ExtractedContent::new(email_id));
        Ok(())
    }

    async fn get_content(&self, email_id: &str) -> AppResult<Option<ExtractedContent>> {
        Ok(self.contents.read().unwrap().get(email_id).cloned())
    }

    async fn content_pending_ids(&self) -> AppResult<Vec<String>> {
        let messages = self.messages.read().unwrap();
        let ids: Vec<String> = self
            .contents
            .read()
            .unwrap()
            .values()
            .filter(|c| {
                matches!(
                    c.extraction_status,
                    ExtractionStatus::Pending | ExtractionStatus::Failed
                ) && messages
                    .get(&c.email_id)
                    .map(|m| m.category.is_travel())
                    .unwrap_or(false)
            })
            .map(|c| c.email_id.clone())
            .collect();
        drop(messages);
        Ok(self.ids_sorted_by_timestamp(ids))
    }

    async fn update_extraction(
        &self,
        email_id: &str,
        status: ExtractionStatus,
        error: Option<String>,
    ) -> AppResult<()> {
        if let Some(content) = self.contents.write().unwrap().get_mut(email_id) {
            content.extraction_status = status;
            content.extraction_error = error;
        }
        Ok(())
    }

    async fn complete_extraction(&self, email_id: &str, full: FullMessage) -> AppResult<()> {
        if let Some(content) = self.contents.write().unwrap().get_mut(email_id) {
            content.body_text = full.text;
            content.body_html = full.html;
            content.attachments = full.attachments;
            content.extraction_status = ExtractionStatus::Completed;
            content.extraction_error = None;
        }
        Ok(())
    }

    async fn booking_pending_ids(&self) -> AppResult<Vec<String>> {
        let messages = self.messages.read().unwrap();
        let ids: Vec<String> = self
            .contents
            .read()
            .unwrap()
            .values()
            .filter(|c| {
                c.extraction_status == ExtractionStatus::Completed
                    && matches!(
                        c.booking_extraction_status,
                        BookingExtractionStatus::Pending | BookingExtractionStatus::Failed
                    )
                    && messages
                        .get(&c.email_id)
                        .map(|m| m.category.is_travel())
                        .unwrap_or(false)
            })
            .map(|c| c.email_id.clone())
            .collect();
        drop(messages);
        Ok(self.ids_sorted_by_timestamp(ids))
    }

    async fn update_booking_extraction(
        &self,
        email_id: &str,
        status: BookingExtractionStatus,
        error: Option<String>,
    ) -> AppResult<()> {
        if let Some(content) = self.contents.write().unwrap().get_mut(email_id) {
            content.booking_extraction_status = status;
            content.booking_extraction_error = error;
        }
        Ok(())
    }

    async fn complete_booking(&self, email_id: &str, booking: BookingInfo) -> AppResult<()> {
        if let Some(content) = self.contents.write().unwrap().get_mut(email_id) {
            content.booking_extraction_status = if booking.is_booking() {
                BookingExtractionStatus::Completed
            } else {
                BookingExtractionStatus::NoBooking
            };
            content.booking_extraction_error = None;
            content.booking = Some(booking);
        }
        Ok(())
    }

    async fn detection_candidates(&self, range: Option<&DateRange>) -> AppResult<Vec<String>> {
        let messages = self.messages.read().unwrap();
        let ids: Vec<String> = self
            .contents
            .read()
            .unwrap()
            .values()
            .filter(|c| {
                c.extraction_status == ExtractionStatus::Completed
                    && c.booking_extraction_status == BookingExtractionStatus::Completed
                    && matches!(
                        c.trip_detection_status,
                        TripDetectionStatus::Pending | TripDetectionStatus::Failed
                    )
                    && c.booking.as_ref().map(|b| b.is_booking()).unwrap_or(false)
            })
            .filter(|c| match (range, messages.get(&c.email_id)) {
                (Some(range), Some(msg)) => range.contains(msg.timestamp),
                (Some(_), None) => false,
                (None, _) => messages.contains_key(&c.email_id),
            })
            .map(|c| c.email_id.clone())
            .collect();
        drop(messages);
        Ok(self.ids_sorted_by_timestamp(ids))
    }

    async fn reset_stuck_detecting(&self) -> AppResult<usize> {
        let mut contents = self.contents.write().unwrap();
        let mut reset = 0;
        for content in contents.values_mut() {
            if content.trip_detection_status == TripDetectionStatus::Detecting {
                content.trip_detection_status = TripDetectionStatus::Pending;
                content.trip_detection_error =
                    Some("Reset from stuck detecting status".to_string());
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn update_trip_detection(
        &self,
        email_ids: &[String],
        status: TripDetectionStatus,
        error: Option<String>,
    ) -> AppResult<()> {
        let mut contents = self.contents.write().unwrap();
        for id in email_ids {
            if let Some(content) = contents.get_mut(id) {
                content.trip_detection_status = status;
                content.trip_detection_error = error.clone();
            }
        }
        Ok(())
    }

    async fn load_trips(&self) -> AppResult<Vec<Trip>> {
        Ok(self.trips.read().unwrap().clone())
    }

    async fn replace_all_trips(&self, trips: Vec<Trip>) -> AppResult<usize> {
        let mut slot = self.trips.write().unwrap();
        *slot = trips;
        Ok(slot.len())
    }

    async fn reset_trip_detection(&self) -> AppResult<usize> {
        self.trips.write().unwrap().clear();
        let mut contents = self.contents.write().unwrap();
        let mut reset = 0;
        for content in contents.values_mut() {
            if matches!(
                content.booking_extraction_status,
                BookingExtractionStatus::Completed | BookingExtractionStatus::NoBooking
            ) {
                content.trip_detection_status = TripDetectionStatus::Pending;
                content.trip_detection_error = None;
                reset += 1;
            }
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn message(id: &str, day: u32) -> MessageRecord {
        MessageRecord {
            email_id: id.to_string(),
            subject: format!("subject {id}"),
            sender: "booking@example.com".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap(),
            category: EmailCategory::Unclassified,
        }
    }

    #[tokio::test]
    async fn insert_skips_existing_ids() {
        let store = MemoryStore::new();
        assert_eq!(
            store
                .insert_messages(vec![message("m1", 1), message("m2", 2)])
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            store
                .insert_messages(vec![message("m1", 1), message("m3", 3)])
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.existing_message_ids().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn content_pending_requires_travel_category() {
        let store = MemoryStore::new();
        store
            .insert_messages(vec![message("m1", 1), message("m2", 2)])
            .await
            .unwrap();
        store
            .set_category("m1", EmailCategory::Flight)
            .await
            .unwrap();
        store
            .set_category("m2", EmailCategory::Marketing)
            .await
            .unwrap();
        store.create_content_if_missing("m1").await.unwrap();
        store.create_content_if_missing("m2").await.unwrap();

        assert_eq!(store.content_pending_ids().await.unwrap(), vec!["m1"]);
    }

    #[tokio::test]
    async fn detection_candidates_ordered_by_timestamp() {
        let store = MemoryStore::new();
        store
            .insert_messages(vec![message("late", 20), message("early", 2)])
            .await
            .unwrap();
        for id in ["late", "early"] {
            store.set_category(id, EmailCategory::Flight).await.unwrap();
            store.create_content_if_missing(id).await.unwrap();
            store
                .complete_extraction(id, FullMessage::default())
                .await
                .unwrap();
            store
                .complete_booking(
                    id,
                    BookingInfo {
                        booking_type: Some(crate::model::BookingType::Flight),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let candidates = store.detection_candidates(None).await.unwrap();
        assert_eq!(candidates, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn stuck_detecting_rows_reset_to_pending() {
        let store = MemoryStore::new();
        store.insert_messages(vec![message("m1", 1)]).await.unwrap();
        store.create_content_if_missing("m1").await.unwrap();
        store
            .update_trip_detection(
                &["m1".to_string()],
                TripDetectionStatus::Detecting,
                None,
            )
            .await
            .unwrap();

        assert_eq!(store.reset_stuck_detecting().await.unwrap(), 1);
        let content = store.get_content("m1").await.unwrap().unwrap();
        assert_eq!(content.trip_detection_status, TripDetectionStatus::Pending);
    }
}
