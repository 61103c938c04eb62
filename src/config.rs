//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Shortest discoverable window accepted by advertisers.
pub const MIN_DISCOVERABLE_DURATION: Duration = Duration::from_secs(10);
/// Longest discoverable window accepted by advertisers.
pub const MAX_DISCOVERABLE_DURATION: Duration = Duration::from_secs(300);
/// Discoverable window used when none is configured.
pub const DEFAULT_DISCOVERABLE_DURATION: Duration = Duration::from_secs(120);

/// Configuration for a [`DiscoveryCoordinator`](crate::DiscoveryCoordinator).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Also match announced identifiers in reversed byte order.
    pub check_reversed_identifier_bytes: bool,
    /// Notify listeners about every announced service, not only registered ones.
    pub notify_about_all_services: bool,
    discoverable_duration: Duration,
    /// Timeout for each outbound connection attempt.
    pub connect_timeout: Option<Duration>,
    /// Consecutive accept failures a server connector tolerates.
    pub accept_retry_budget: u32,
    /// Upper bound of the random pause before reopening a listening endpoint.
    pub accept_retry_jitter: Duration,
    /// Period of the stale connection sweep. `None` disables it.
    pub prune_interval: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            check_reversed_identifier_bytes: true,
            notify_about_all_services: false,
            discoverable_duration: DEFAULT_DISCOVERABLE_DURATION,
            connect_timeout: None,
            accept_retry_budget: 3,
            accept_retry_jitter: Duration::from_millis(50),
            prune_interval: Some(Duration::from_secs(5)),
        }
    }
}

impl EngineConfig {
    /// Toggle matching of byte-reversed identifiers.
    pub fn check_reversed_identifier_bytes(mut self, enabled: bool) -> Self {
        self.check_reversed_identifier_bytes = enabled;
        self
    }

    /// Toggle notifications for services nobody registered interest in.
    pub fn notify_about_all_services(mut self, enabled: bool) -> Self {
        self.notify_about_all_services = enabled;
        self
    }

    /// Set how long the device stays discoverable. Out-of-range values are
    /// clamped to [`MIN_DISCOVERABLE_DURATION`]..=[`MAX_DISCOVERABLE_DURATION`].
    pub fn with_discoverable_duration(mut self, duration: Duration) -> Self {
        self.discoverable_duration = clamp_discoverable(duration);
        self
    }

    /// The discoverable window, clamped to the accepted range.
    pub fn discoverable_duration(&self) -> Duration {
        clamp_discoverable(self.discoverable_duration)
    }

    /// Set the per-attempt connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set how many consecutive accept failures are tolerated.
    pub fn with_accept_retry_budget(mut self, budget: u32) -> Self {
        self.accept_retry_budget = budget;
        self
    }

    /// Set the maximum pause before reopening a listening endpoint.
    pub fn with_accept_retry_jitter(mut self, jitter: Duration) -> Self {
        self.accept_retry_jitter = jitter;
        self
    }

    /// Set the stale connection sweep period.
    pub fn with_prune_interval(mut self, interval: Option<Duration>) -> Self {
        self.prune_interval = interval;
        self
    }
}

fn clamp_discoverable(duration: Duration) -> Duration {
    duration.clamp(MIN_DISCOVERABLE_DURATION, MAX_DISCOVERABLE_DURATION)
}
