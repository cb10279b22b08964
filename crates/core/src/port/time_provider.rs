// Time Provider Port (for testability)

use chrono::{DateTime, Utc};

/// Time provider interface (allows mocking in tests)
pub trait TimeProvider: Send + Sync {
    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;
}

/// System time provider (production)
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub mod mocks {
    use super::*;

    /// Fixed time provider for deterministic timestamps
    pub struct FixedTimeProvider(pub DateTime<Utc>);

    impl FixedTimeProvider {
        pub fn at_epoch_millis(millis: i64) -> Self {
            Self(DateTime::from_timestamp_millis(millis).expect("timestamp in range"))
        }
    }

    impl TimeProvider for FixedTimeProvider {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }
}
