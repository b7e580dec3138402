pub mod booking;
pub mod message;
pub mod trip;

pub use booking::{
    Accommodation, Activity, BookingInfo, BookingStatus, BookingType, CostInfo, Cruise,
    NonBookingType, TransportSegment,
};
pub use message::{
    AttachmentInfo, BookingExtractionStatus, EmailCategory, ExtractedContent, ExtractionStatus,
    MessageRecord, TripDetectionStatus,
};
pub use trip::{merge_preserving_existing, Trip};
