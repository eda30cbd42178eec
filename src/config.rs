use std::time::Duration;

use serde::Deserialize;

/// Resolver tuning knobs. All fields have protocol-sensible defaults; the
/// struct deserializes from a partial document.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    /// Interval between retransmissions of an unanswered query, in
    /// milliseconds.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Total send attempts per transaction before the lookup fails with a
    /// timeout.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_retry_interval_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ResolverConfig {
    pub(crate) fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

fn default_retry_interval_ms() -> u64 {
    1000
}

fn default_max_attempts() -> usize {
    5
}
