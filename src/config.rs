//! Event bus configuration
//!
//! Defaults mirror the production platform settings: sender pools of five,
//! a five second borrow wait, two consumer sessions per subscription, a two
//! second reconnect backoff, and a thirty second housekeeper tick.

use std::time::Duration;

/// Sender pool tuning for one destination address
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle senders to keep alive through eviction runs
    pub min_idle: usize,

    /// Idle senders retained before give-backs are destroyed instead
    pub max_idle: usize,

    /// Maximum senders in existence (idle + borrowed)
    pub max_total: usize,

    /// How long a borrower waits for a sender before failing
    pub borrow_wait: Duration,

    /// Interval between idle eviction runs
    pub eviction_interval: Duration,

    /// Idle time after which a sender becomes eligible for eviction
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 1,
            max_idle: 5,
            max_total: 5,
            borrow_wait: Duration::from_secs(5),
            eviction_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Event bus configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Broker URL (e.g. "nats://127.0.0.1:4222")
    pub url: String,

    /// Broker username
    pub username: Option<String>,

    /// Broker password
    pub password: Option<String>,

    /// JetStream stream name backing the `events.>` subject space
    pub stream_name: String,

    /// Per-address sender pool tuning
    pub pool: PoolConfig,

    /// Parallel consumer sessions per subscription
    pub consumer_pool_size: usize,

    /// Delay between reconnection attempts
    pub reconnect_backoff: Duration,

    /// Delivery attempts before a message is dead-lettered (0 = unlimited)
    pub max_deliver: u64,

    /// Message codec name (resolved at start)
    pub codec: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            username: None,
            password: None,
            stream_name: "NIMBUS_EVENTS".to_string(),
            pool: PoolConfig::default(),
            consumer_pool_size: 2,
            reconnect_backoff: Duration::from_secs(2),
            max_deliver: 10,
            codec: "json".to_string(),
        }
    }
}

impl BusConfig {
    /// Set broker credentials
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the broker URL
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

/// Reconciliation housekeeper configuration
#[derive(Debug, Clone)]
pub struct HousekeeperConfig {
    /// Interval between reconciliation ticks
    pub interval: Duration,

    /// Upper bound for the randomized delay before the first tick
    /// (zero disables the jitter)
    pub first_run_jitter: Duration,

    /// Polling iterations a stop() caller waits for the current tick
    pub max_wait_loops: u32,

    /// Delay between stop() polling iterations
    pub wait_step: Duration,
}

impl Default for HousekeeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            first_run_jitter: Duration::from_secs(30),
            max_wait_loops: 30,
            wait_step: Duration::from_secs(1),
        }
    }
}
