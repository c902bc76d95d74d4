use std::time::Duration;

/// Timing knobs for sessions and presence. The presence window and the
/// reconciliation period are independent of each other.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How often a connected session refreshes `last_active`.
    pub heartbeat_interval: Duration,
    /// How often a session re-pulls its directory.
    pub reconcile_interval: Duration,
    /// A user is online while their last heartbeat is younger than this.
    pub online_window: Duration,
    /// A pull slower than this is abandoned until the next tick.
    pub pull_timeout: Duration,
    /// Consecutive transient failures tolerated before the client is told.
    pub transient_budget: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
            reconcile_interval: Duration::from_secs(10),
            online_window: Duration::from_secs(70),
            pull_timeout: Duration::from_secs(5),
            transient_budget: 3,
        }
    }
}
