//! Domain-driven configuration management for cohort
//!
//! Configuration is split by functional domain (backend selection, locking,
//! job distribution, statistics, data cache, logging), each with defaults,
//! validation and environment variable overrides.

pub mod backend;
pub mod domains;
pub mod error;
pub mod loader;
pub mod validation;

// Re-export main types
pub use backend::BackendSpec;
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;

// Re-export domain configurations
pub use domains::{
    data_cache::DataCacheConfig, jobs::JobsConfig, locking::LockingConfig,
    logging::LoggingConfig, statistics::StatisticsConfig, CohortConfig,
};
