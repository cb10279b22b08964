// Pipeline constants (no magic values)
use std::time::Duration;

/// Delay before redialing the broker after a failed or lost connection (3s)
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Delay before retrying consumer startup after a failed subscription (5s)
pub const DEFAULT_SUBSCRIBE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Consumer tag presented to the broker when registering on the queue
pub const CONSUMER_TAG: &str = "carfeed-ingest";
