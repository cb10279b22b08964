// Central Error Type for the Application

use thiserror::Error;

/// Application-level error type
///
/// Broker errors are transient and stay inside the reconnect/retry loops; the
/// other variants are terminal for a single message (reject, never requeue).
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Broker error: {0}")]
    Broker(#[from] crate::port::broker::BrokerError),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(#[from] crate::domain::ValidationError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] crate::port::record_store::StoreError),
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
