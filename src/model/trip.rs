//! Trip aggregate and the merge backstop for dropped trips.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::booking::{Accommodation, Activity, Cruise, TransportSegment};

/// Aggregate root persisted independently of messages. Trips are replaced
/// wholesale on each successful detection cycle so a trip and its child
/// segments can never disagree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Trip {
    /// Merge key across detection cycles. Name-based matching is carried
    /// over from the extraction contract; see DESIGN.md for the trade-off.
    pub name: String,
    pub destination: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub cities: Vec<String>,
    pub total_cost: f64,
    pub transport_segments: Vec<TransportSegment>,
    pub accommodations: Vec<Accommodation>,
    pub activities: Vec<Activity>,
    pub cruises: Vec<Cruise>,
}

impl Trip {
    /// Message ids evidencing any segment of this trip.
    pub fn related_email_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        let mut extend = |more: &[String]| {
            for id in more {
                if !ids.contains(id) {
                    ids.push(id.clone());
                }
            }
        };
        for s in &self.transport_segments {
            extend(&s.related_email_ids);
        }
        for a in &self.accommodations {
            extend(&a.related_email_ids);
        }
        for a in &self.activities {
            extend(&a.related_email_ids);
        }
        for c in &self.cruises {
            extend(&c.related_email_ids);
        }
        ids
    }

    pub fn segment_count(&self) -> usize {
        self.transport_segments.len()
            + self.accommodations.len()
            + self.activities.len()
            + self.cruises.len()
    }
}

/// Safe merge used when the extraction function returns fewer trips than it
/// was given. Every existing trip survives: a returned trip with a matching
/// name replaces the existing one in place, genuinely new names are
/// appended, and existing trips absent from the response are kept as-is.
pub fn merge_preserving_existing(existing: &[Trip], returned: Vec<Trip>) -> Vec<Trip> {
    let mut merged: Vec<Trip> = existing.to_vec();

    for new_trip in returned {
        match merged.iter_mut().find(|t| t.name == new_trip.name) {
            Some(slot) => {
                tracing::info!("Updated existing trip: {}", new_trip.name);
                *slot = new_trip;
            }
            None => {
                tracing::info!("Added new trip: {}", new_trip.name);
                merged.push(new_trip);
            }
        }
    }

    tracing::info!(
        "Trip merge completed: {} existing -> {} total",
        existing.len(),
        merged.len()
    );
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trip(name: &str, cost: f64) -> Trip {
        Trip {
            name: name.to_string(),
            total_cost: cost,
            ..Default::default()
        }
    }

    #[test]
    fn merge_keeps_trips_missing_from_response() {
        let existing = vec![trip("Oslo Weekend", 500.0), trip("Tokyo Spring", 3200.0)];
        let returned = vec![trip("Oslo Weekend", 640.0)];

        let merged = merge_preserving_existing(&existing, returned);

        assert_eq!(merged.len(), 2);
        let oslo = merged.iter().find(|t| t.name == "Oslo Weekend").unwrap();
        assert_eq!(oslo.total_cost, 640.0);
        let tokyo = merged.iter().find(|t| t.name == "Tokyo Spring").unwrap();
        assert_eq!(tokyo.total_cost, 3200.0);
    }

    #[test]
    fn merge_appends_new_trips() {
        let existing = vec![trip("Oslo Weekend", 500.0)];
        let returned = vec![trip("Oslo Weekend", 500.0), trip("Lisbon Summer", 900.0)];

        let merged = merge_preserving_existing(&existing, returned);

        assert_eq!(merged.len(), 2);
        assert!(merged.iter().any(|t| t.name == "Lisbon Summer"));
    }

    #[test]
    fn related_email_ids_deduplicates_across_segments() {
        let mut t = trip("Oslo Weekend", 0.0);
        t.transport_segments.push(TransportSegment {
            related_email_ids: vec!["m1".to_string(), "m2".to_string()],
            ..Default::default()
        });
        t.accommodations.push(Accommodation {
            related_email_ids: vec!["m2".to_string(), "m3".to_string()],
            ..Default::default()
        });
        assert_eq!(t.related_email_ids(), vec!["m1", "m2", "m3"]);
    }
}
