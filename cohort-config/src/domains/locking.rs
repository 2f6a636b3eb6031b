//! Distributed lock configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigResult;
use crate::validation::{validate_non_zero_duration, Validatable};

/// Distributed lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    /// Pause after a lock is handed over from an exclusive holder, giving
    /// slow shared resources (such as file-system writes) time to settle
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,

    /// How often the coordinator re-checks its own queue position when it
    /// waits for a lock itself
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(1),
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl Validatable for LockingConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_non_zero_duration(self.poll_interval, "poll_interval", self.domain_name())
    }

    fn domain_name(&self) -> &'static str {
        "locking"
    }
}
