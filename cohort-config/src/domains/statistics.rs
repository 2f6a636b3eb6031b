//! Accumulative statistics configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigResult;
use crate::validation::{validate_non_zero_duration, Validatable};

/// Accumulative statistics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsConfig {
    /// Interval between progress reports of changed accumulators
    #[serde(with = "humantime_serde")]
    pub report_interval: Duration,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            report_interval: Duration::from_secs(600),
        }
    }
}

impl Validatable for StatisticsConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_non_zero_duration(self.report_interval, "report_interval", self.domain_name())
    }

    fn domain_name(&self) -> &'static str {
        "statistics"
    }
}
