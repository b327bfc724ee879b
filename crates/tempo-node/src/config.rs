use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings consumed by the request deliverer at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelivererConfig {
    /// Time to wait for responses before retrying with fallback peers.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Capacity of the inbound delivery-request queue.
    pub request_queue_capacity: usize,
    /// Number of workers answering inbound delivery requests.
    pub request_processor_threads: usize,
    /// Maximum entries sent back for one inbound request.
    pub response_limit: usize,
}

impl Default for DelivererConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            request_queue_capacity: 8192,
            request_processor_threads: 2,
            response_limit: 1024,
        }
    }
}

impl DelivererConfig {
    /// Returns a copy with zero sizes raised to their smallest usable value.
    pub fn normalized(&self) -> Self {
        Self {
            request_timeout: self.request_timeout,
            request_queue_capacity: self.request_queue_capacity.max(1),
            request_processor_threads: self.request_processor_threads.max(1),
            response_limit: self.response_limit.max(1),
        }
    }
}

/// Settings for the discovery-driven maintenance epics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Highest backoff exponent; failed deliveries past it are abandoned.
    pub max_backoff: u32,
    /// Base delay doubled for each re-delivery attempt.
    #[serde(with = "humantime_serde")]
    pub retry_base_delay: Duration,
    /// Period of the housekeeping action.
    #[serde(with = "humantime_serde")]
    pub housekeeping_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_backoff: 4,
            retry_base_delay: Duration::from_secs(1),
            housekeeping_interval: Duration::from_secs(30),
        }
    }
}

impl DiscoveryConfig {
    /// Delay before re-delivery attempt `attempt` (0-based), or `None` once the
    /// backoff ceiling has been passed.
    pub fn retry_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.max_backoff {
            return None;
        }
        Some(
            self.retry_base_delay
                .saturating_mul(1_u32 << attempt.min(31)),
        )
    }
}

/// Aggregated node configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TempoConfig {
    pub deliverer: DelivererConfig,
    pub discovery: DiscoveryConfig,
}
