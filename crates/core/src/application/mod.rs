// Application Layer - Use Cases and Business Logic

pub mod connection;
pub mod constants;
pub mod consumer;

// Re-exports
pub use connection::{ConnectionManager, ConnectionState};
pub use consumer::ListingConsumer;
