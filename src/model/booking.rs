//! Typed booking fragments decoded once at the LLM-response boundary.
//!
//! Every segment kind has a fixed schema; unknown or missing fields decode
//! to `None`/defaults rather than being carried around as raw JSON.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BookingType {
    Flight,
    Hotel,
    CarRental,
    Train,
    Cruise,
    Tour,
    TravelInsurance,
    Cancellation,
    Modification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
    Modified,
    Pending,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NonBookingType {
    Reminder,
    Marketing,
    StatusUpdate,
    CheckIn,
    GeneralInfo,
    Survey,
    ProgramEnrollment,
}

fn default_true() -> bool {
    true
}

fn default_confirmed() -> BookingStatus {
    BookingStatus::Confirmed
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CostInfo {
    pub total_cost: f64,
    pub currency: Option<String>,
}

/// Flight/train/bus/ferry leg. Shared between booking fragments and the
/// trip aggregate so a fragment segment carries straight into a trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSegment {
    pub segment_type: String,
    pub departure_location: Option<String>,
    pub arrival_location: Option<String>,
    pub departure_datetime: Option<NaiveDateTime>,
    pub arrival_datetime: Option<NaiveDateTime>,
    pub carrier_name: Option<String>,
    pub segment_number: Option<String>,
    pub cost: f64,
    pub confirmation_number: Option<String>,
    #[serde(default = "default_confirmed")]
    pub status: BookingStatus,
    #[serde(default = "default_true")]
    pub is_latest_version: bool,
    pub related_email_ids: Vec<String>,
}

impl Default for TransportSegment {
    fn default() -> Self {
        Self {
            segment_type: "other".to_string(),
            departure_location: None,
            arrival_location: None,
            departure_datetime: None,
            arrival_datetime: None,
            carrier_name: None,
            segment_number: None,
            cost: 0.0,
            confirmation_number: None,
            status: BookingStatus::Confirmed,
            is_latest_version: true,
            related_email_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Accommodation {
    pub property_name: Option<String>,
    pub check_in_date: Option<NaiveDate>,
    pub check_out_date: Option<NaiveDate>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub cost: f64,
    pub confirmation_number: Option<String>,
    #[serde(default = "default_confirmed")]
    pub status: BookingStatus,
    #[serde(default = "default_true")]
    pub is_latest_version: bool,
    pub related_email_ids: Vec<String>,
}

impl Default for Accommodation {
    fn default() -> Self {
        Self {
            property_name: None,
            check_in_date: None,
            check_out_date: None,
            address: None,
            city: None,
            country: None,
            cost: 0.0,
            confirmation_number: None,
            status: BookingStatus::Confirmed,
            is_latest_version: true,
            related_email_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Activity {
    pub activity_name: Option<String>,
    pub start_datetime: Option<NaiveDateTime>,
    pub end_datetime: Option<NaiveDateTime>,
    pub city: Option<String>,
    pub location: Option<String>,
    pub cost: f64,
    pub confirmation_number: Option<String>,
    #[serde(default = "default_confirmed")]
    pub status: BookingStatus,
    #[serde(default = "default_true")]
    pub is_latest_version: bool,
    pub related_email_ids: Vec<String>,
}

impl Default for Activity {
    fn default() -> Self {
        Self {
            activity_name: None,
            start_datetime: None,
            end_datetime: None,
            city: None,
            location: None,
            cost: 0.0,
            confirmation_number: None,
            status: BookingStatus::Confirmed,
            is_latest_version: true,
            related_email_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Cruise {
    pub cruise_line: Option<String>,
    pub ship_name: Option<String>,
    pub departure_port: Option<String>,
    pub arrival_port: Option<String>,
    pub departure_datetime: Option<NaiveDateTime>,
    pub arrival_datetime: Option<NaiveDateTime>,
    pub cost: f64,
    pub confirmation_number: Option<String>,
    #[serde(default = "default_confirmed")]
    pub status: BookingStatus,
    #[serde(default = "default_true")]
    pub is_latest_version: bool,
    pub related_email_ids: Vec<String>,
}

impl Default for Cruise {
    fn default() -> Self {
        Self {
            cruise_line: None,
            ship_name: None,
            departure_port: None,
            arrival_port: None,
            departure_datetime: None,
            arrival_datetime: None,
            cost: 0.0,
            confirmation_number: None,
            status: BookingStatus::Confirmed,
            is_latest_version: true,
            related_email_ids: Vec::new(),
        }
    }
}

/// Booking fragment extracted from one email. `booking_type: None` marks a
/// non-booking informational email (`non_booking_type`/`reason` say why).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BookingInfo {
    pub booking_type: Option<BookingType>,
    pub non_booking_type: Option<NonBookingType>,
    pub reason: Option<String>,
    pub status: BookingStatus,
    pub confirmation_numbers: Vec<String>,
    pub original_booking_reference: Option<String>,
    pub transport_segments: Vec<TransportSegment>,
    pub accommodations: Vec<Accommodation>,
    pub activities: Vec<Activity>,
    pub cruises: Vec<Cruise>,
    pub cost_info: Option<CostInfo>,
}

impl BookingInfo {
    pub fn is_booking(&self) -> bool {
        self.booking_type.is_some()
    }

    pub fn has_segments(&self) -> bool {
        !self.transport_segments.is_empty()
            || !self.accommodations.is_empty()
            || !self.activities.is_empty()
            || !self.cruises.is_empty()
    }

    /// Minimum required fields per booking kind. Incomplete fragments are
    /// excluded from trip detection; a flight without departure/arrival
    /// data cannot be placed on a timeline.
    pub fn is_complete(&self) -> bool {
        if !self.is_booking() || !self.has_segments() {
            return false;
        }

        for segment in &self.transport_segments {
            if segment.departure_location.is_none()
                || segment.arrival_location.is_none()
                || segment.departure_datetime.is_none()
                || segment.arrival_datetime.is_none()
            {
                return false;
            }
        }

        for acc in &self.accommodations {
            if acc.property_name.is_none()
                || acc.check_in_date.is_none()
                || acc.check_out_date.is_none()
            {
                return false;
            }
        }

        for activity in &self.activities {
            if activity.activity_name.is_none() || activity.start_datetime.is_none() {
                return false;
            }
        }

        for cruise in &self.cruises {
            if cruise.cruise_line.is_none()
                || cruise.departure_datetime.is_none()
                || cruise.arrival_datetime.is_none()
            {
                return false;
            }
        }

        true
    }

    /// True when every movement stays inside the configured home area.
    pub fn is_local_trip(&self, local_area: &[String]) -> bool {
        if !self.is_booking() {
            return false;
        }

        let in_area = |loc: &Option<String>| -> bool {
            loc.as_deref()
                .map(|l| {
                    let l = l.to_lowercase();
                    local_area.iter().any(|area| l.contains(area.as_str()))
                })
                .unwrap_or(false)
        };

        for segment in &self.transport_segments {
            if in_area(&segment.departure_location) && in_area(&segment.arrival_location) {
                return true;
            }
        }

        if !self.activities.is_empty() {
            let all_local = self
                .activities
                .iter()
                .all(|a| in_area(&a.city) || in_area(&a.location));
            if all_local {
                return true;
            }
        }

        false
    }

    fn is_test_booking(&self) -> bool {
        const TEST_INDICATORS: [&str; 4] = ["test", "demo", "sample", "example"];
        self.all_confirmation_numbers().iter().any(|number| {
            let number = number.to_lowercase();
            TEST_INDICATORS.iter().any(|i| number.contains(i))
        })
    }

    /// Gate applied before a fragment enters a trip-detection batch.
    /// Returns the rejection reason for invalid fragments.
    pub fn validate_for_trip_detection(&self, local_area: &[String]) -> Result<(), String> {
        if !self.is_booking() {
            let kind = self
                .non_booking_type
                .map(|t| t.to_string())
                .unwrap_or_else(|| "unspecified".to_string());
            return Err(format!("Non-booking email: {kind}"));
        }
        if !self.is_complete() {
            return Err("Incomplete booking information".to_string());
        }
        if self.is_local_trip(local_area) {
            return Err("Local trip within home area".to_string());
        }
        if self.is_test_booking() {
            return Err("Test booking detected".to_string());
        }
        Ok(())
    }

    pub fn all_confirmation_numbers(&self) -> Vec<String> {
        let mut numbers: Vec<String> = self.confirmation_numbers.clone();
        let extend = |numbers: &mut Vec<String>, n: &Option<String>| {
            if let Some(n) = n {
                if !numbers.contains(n) {
                    numbers.push(n.clone());
                }
            }
        };
        for s in &self.transport_segments {
            extend(&mut numbers, &s.confirmation_number);
        }
        for a in &self.accommodations {
            extend(&mut numbers, &a.confirmation_number);
        }
        for a in &self.activities {
            extend(&mut numbers, &a.confirmation_number);
        }
        for c in &self.cruises {
            extend(&mut numbers, &c.confirmation_number);
        }
        numbers
    }

    pub fn total_cost(&self) -> f64 {
        let segments: f64 = self.transport_segments.iter().map(|s| s.cost).sum::<f64>()
            + self.accommodations.iter().map(|a| a.cost).sum::<f64>()
            + self.activities.iter().map(|a| a.cost).sum::<f64>()
            + self.cruises.iter().map(|c| c.cost).sum::<f64>();

        match &self.cost_info {
            Some(info) if info.total_cost > segments => info.total_cost,
            _ => segments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").unwrap()
    }

    fn complete_flight() -> BookingInfo {
        BookingInfo {
            booking_type: Some(BookingType::Flight),
            transport_segments: vec![TransportSegment {
                segment_type: "flight".to_string(),
                departure_location: Some("Zurich".to_string()),
                arrival_location: Some("Oslo".to_string()),
                departure_datetime: Some(dt("2024-05-01T10:00:00")),
                arrival_datetime: Some(dt("2024-05-01T12:30:00")),
                confirmation_number: Some("ABC123".to_string()),
                cost: 240.0,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn complete_flight_passes_gate() {
        let booking = complete_flight();
        assert!(booking
            .validate_for_trip_detection(&["zrh".to_string()])
            .is_ok());
    }

    #[test]
    fn missing_departure_datetime_is_incomplete() {
        let mut booking = complete_flight();
        booking.transport_segments[0].departure_datetime = None;
        let reason = booking
            .validate_for_trip_detection(&[])
            .unwrap_err();
        assert!(reason.contains("Incomplete"));
    }

    #[test]
    fn non_booking_email_is_rejected_with_kind() {
        let booking = BookingInfo {
            non_booking_type: Some(NonBookingType::Marketing),
            ..Default::default()
        };
        let reason = booking.validate_for_trip_detection(&[]).unwrap_err();
        assert!(reason.contains("Non-booking"));
        assert!(reason.contains("marketing"));
    }

    #[test]
    fn local_transport_is_rejected() {
        let mut booking = complete_flight();
        booking.transport_segments[0].departure_location = Some("Zurich HB".to_string());
        booking.transport_segments[0].arrival_location = Some("Winterthur".to_string());
        let local: Vec<String> = ["zurich", "winterthur"]
            .into_iter()
            .map(str::to_string)
            .collect();
        let reason = booking.validate_for_trip_detection(&local).unwrap_err();
        assert!(reason.contains("Local trip"));
    }

    #[test]
    fn test_confirmation_number_is_rejected() {
        let mut booking = complete_flight();
        booking.transport_segments[0].confirmation_number = Some("TEST-9999".to_string());
        let reason = booking.validate_for_trip_detection(&[]).unwrap_err();
        assert!(reason.contains("Test booking"));
    }

    #[test]
    fn decodes_llm_payload_with_missing_fields() {
        let json = r#"{
            "booking_type": "hotel",
            "status": "confirmed",
            "accommodations": [{
                "property_name": "Hotel Bristol",
                "check_in_date": "2024-05-01",
                "check_out_date": "2024-05-03",
                "cost": 450.0
            }]
        }"#;
        let booking: BookingInfo = serde_json::from_str(json).unwrap();
        assert_eq!(booking.booking_type, Some(BookingType::Hotel));
        assert!(booking.is_complete());
        assert!(booking.accommodations[0].is_latest_version);
        assert!(booking.transport_segments.is_empty());
    }

    #[test]
    fn total_cost_prefers_larger_declared_total() {
        let mut booking = complete_flight();
        booking.cost_info = Some(CostInfo {
            total_cost: 300.0,
            currency: Some("CHF".to_string()),
        });
        assert_eq!(booking.total_cost(), 300.0);
        booking.cost_info = Some(CostInfo {
            total_cost: 100.0,
            currency: None,
        });
        assert_eq!(booking.total_cost(), 240.0);
    }
}
