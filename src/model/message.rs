//! Message records and the per-email status fields the pipeline resumes from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::booking::BookingInfo;

/// Category assigned at classification. Travel subtypes route an email into
/// content + booking extraction; everything else stops at classification.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EmailCategory {
    Flight,
    Hotel,
    CarRental,
    Train,
    Cruise,
    Tour,
    TravelInsurance,
    FlightChange,
    HotelChange,
    OtherTravel,
    Marketing,
    NotTravel,
    GeneralInfo,
    AccountManagement,
    RestaurantReservation,
    Security,
    ClassificationFailed,
    Unclassified,
}

impl EmailCategory {
    pub fn is_travel(&self) -> bool {
        matches!(
            self,
            EmailCategory::Flight
                | EmailCategory::Hotel
                | EmailCategory::CarRental
                | EmailCategory::Train
                | EmailCategory::Cruise
                | EmailCategory::Tour
                | EmailCategory::TravelInsurance
                | EmailCategory::FlightChange
                | EmailCategory::HotelChange
                | EmailCategory::OtherTravel
        )
    }
}

/// One record per source email. The identifier is opaque, stable and unique;
/// category is the only field mutated after import.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub email_id: String,
    pub subject: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub category: EmailCategory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExtractionStatus {
    Pending,
    Extracting,
    Completed,
    Failed,
    NotRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BookingExtractionStatus {
    Pending,
    Extracting,
    Completed,
    Failed,
    NoBooking,
    NotTravel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TripDetectionStatus {
    Pending,
    Detecting,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub filename: String,
    pub size_bytes: u64,
    pub saved_path: Option<String>,
}

/// One-to-one with a travel-classified message. Created at the
/// classification hand-off; body fields are filled by content extraction,
/// the booking payload by booking extraction.
#[derive(Debug, Clone)]
pub struct ExtractedContent {
    pub email_id: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Vec<AttachmentInfo>,
    pub extraction_status: ExtractionStatus,
    pub extraction_error: Option<String>,
    pub booking_extraction_status: BookingExtractionStatus,
    pub booking_extraction_error: Option<String>,
    pub booking: Option<BookingInfo>,
    pub trip_detection_status: TripDetectionStatus,
    pub trip_detection_error: Option<String>,
}

impl ExtractedContent {
    pub fn new(email_id: impl Into<String>) -> Self {
        Self {
            email_id: email_id.into(),
            body_text: None,
            body_html: None,
            attachments: Vec::new(),
            extraction_status: ExtractionStatus::Pending,
            extraction_error: None,
            booking_extraction_status: BookingExtractionStatus::Pending,
            booking_extraction_error: None,
            booking: None,
            trip_detection_status: TripDetectionStatus::Pending,
            trip_detection_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn travel_predicate_covers_subtypes() {
        assert!(EmailCategory::Flight.is_travel());
        assert!(EmailCategory::HotelChange.is_travel());
        assert!(!EmailCategory::Marketing.is_travel());
        assert!(!EmailCategory::Unclassified.is_travel());
        assert!(!EmailCategory::ClassificationFailed.is_travel());
    }

    #[test]
    fn category_snake_case_round_trip() {
        use std::str::FromStr;
        assert_eq!(EmailCategory::CarRental.to_string(), "car_rental");
        assert_eq!(
            EmailCategory::from_str("car_rental").unwrap(),
            EmailCategory::CarRental
        );
    }
}
