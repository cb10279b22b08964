// Record Store Port (Interface)

use crate::domain::{CarListing, ListingId, StoredListing};
use crate::port::time_provider::TimeProvider;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Opaque persistence failure.
///
/// The pipeline never inspects the cause: any store error rejects the
/// message that produced it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("record store failure: {0}")]
pub struct StoreError(pub String);

/// Store interface for accepted car listings
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist a validated listing, assigning identity and creation time
    async fn create(&self, listing: &CarListing) -> Result<StoredListing, StoreError>;
}

/// In-memory record store (reference implementation)
///
/// Identities are assigned sequentially starting at 1. Suitable for local
/// runs and tests; a database-backed store plugs in behind the same trait
/// without touching the pipeline.
pub struct MemoryRecordStore {
    time: Arc<dyn TimeProvider>,
    inner: Mutex<MemoryInner>,
}

struct MemoryInner {
    next_id: ListingId,
    records: Vec<StoredListing>,
}

impl MemoryRecordStore {
    pub fn new(time: Arc<dyn TimeProvider>) -> Self {
        Self {
            time,
            inner: Mutex::new(MemoryInner {
                next_id: 1,
                records: Vec::new(),
            }),
        }
    }

    /// Snapshot of everything stored so far, in insertion order
    pub fn records(&self) -> Vec<StoredListing> {
        self.inner.lock().unwrap().records.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(&self, listing: &CarListing) -> Result<StoredListing, StoreError> {
        let created_at = self.time.now();
        let mut inner = self.inner.lock().unwrap();
        let stored = StoredListing::new(inner.next_id, listing, created_at);
        inner.next_id += 1;
        inner.records.push(stored.clone());
        Ok(stored)
    }
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use chrono::Utc;

    /// Mock store behavior
    #[derive(Debug, Clone)]
    pub enum MockBehavior {
        /// Accept every listing
        Accept,
        /// Fail every create with message
        Fail(String),
        /// Fail the first N creates, then accept
        FailTimes(usize, String),
    }

    /// Mock Record Store for testing
    pub struct MockRecordStore {
        behavior: Arc<Mutex<MockBehavior>>,
        call_count: Arc<Mutex<usize>>,
        created: Arc<Mutex<Vec<CarListing>>>,
    }

    impl MockRecordStore {
        pub fn new(behavior: MockBehavior) -> Self {
            Self {
                behavior: Arc::new(Mutex::new(behavior)),
                call_count: Arc::new(Mutex::new(0)),
                created: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn new_accepting() -> Self {
            Self::new(MockBehavior::Accept)
        }

        pub fn new_failing(message: impl Into<String>) -> Self {
            Self::new(MockBehavior::Fail(message.into()))
        }

        pub fn call_count(&self) -> usize {
            *self.call_count.lock().unwrap()
        }

        /// Listings accepted so far, in arrival order
        pub fn created(&self) -> Vec<CarListing> {
            self.created.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RecordStore for MockRecordStore {
        async fn create(&self, listing: &CarListing) -> Result<StoredListing, StoreError> {
            let count = {
                let mut count = self.call_count.lock().unwrap();
                *count += 1;
                *count
            };

            let behavior = self.behavior.lock().unwrap().clone();
            match behavior {
                MockBehavior::Accept => {}
                MockBehavior::Fail(msg) => return Err(StoreError(msg)),
                MockBehavior::FailTimes(n, msg) => {
                    if count <= n {
                        return Err(StoreError(msg));
                    }
                }
            }

            let mut created = self.created.lock().unwrap();
            created.push(listing.clone());
            Ok(StoredListing::new(
                created.len() as ListingId,
                listing,
                Utc::now(),
            ))
        }
    }
}
