//! Domain-specific configuration modules

pub mod data_cache;
pub mod jobs;
pub mod locking;
pub mod logging;
pub mod statistics;

use serde::{Deserialize, Serialize};

use crate::backend::BackendSpec;
use crate::error::ConfigResult;
use crate::validation::Validatable;

/// Main cohort configuration combining all domains
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CohortConfig {
    /// Transport backend, e.g. `null` or `local-4`
    pub backend: BackendSpec,

    /// Distributed lock configuration
    pub locking: locking::LockingConfig,

    /// Job distribution and resumption configuration
    pub jobs: jobs::JobsConfig,

    /// Accumulative statistics configuration
    pub statistics: statistics::StatisticsConfig,

    /// Shared data cache configuration
    pub data_cache: data_cache::DataCacheConfig,

    /// Logging configuration
    pub logging: logging::LoggingConfig,
}

impl CohortConfig {
    /// Configuration for a given backend with every other domain defaulted
    pub fn with_backend(backend: BackendSpec) -> Self {
        Self {
            backend,
            ..Self::default()
        }
    }

    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.locking.validate()?;
        self.jobs.validate()?;
        self.statistics.validate()?;
        self.data_cache.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let config = CohortConfig::default();
        serde_yaml::to_string(&config)
            .unwrap_or_else(|_| "# Failed to generate sample config".to_string())
    }
}
