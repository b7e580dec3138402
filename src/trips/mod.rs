pub mod detection;

pub use detection::{DetectionProgress, DetectionSummary, TripDetectionEngine};
