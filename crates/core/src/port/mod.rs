// Port Layer - Interfaces for external dependencies

pub mod broker;
pub mod message_source;
pub mod record_store;
pub mod time_provider; // For deterministic testing

// Re-exports
pub use broker::{BrokerConnector, BrokerError, BrokerSession, CloseHook, DeliveryStream};
pub use message_source::{DeliveryAck, InboundMessage, MessageHandler, MessageSource};
pub use record_store::{MemoryRecordStore, RecordStore, StoreError};
pub use time_provider::{SystemTimeProvider, TimeProvider};
