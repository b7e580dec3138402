pub mod booking;
pub mod classification;
pub mod content;
pub mod import;

pub use booking::BookingExtractionStage;
pub use classification::ClassificationStage;
pub use content::ContentExtractionStage;
pub use import::ImportStage;
