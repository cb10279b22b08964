// Domain Layer - Pure business logic and entities

pub mod error;
pub mod listing;

// Re-exports
pub use error::{FieldViolation, ValidationError};
pub use listing::{CarListing, ListingId, StoredListing};
