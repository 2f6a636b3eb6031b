//! Configuration loading and environment variable handling

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::backend::BackendSpec;
use crate::domains::logging::{LogFormat, LogLevel};
use crate::domains::CohortConfig;
use crate::error::{ConfigError, ConfigResult};

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "COHORT".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<CohortConfig> {
        let content = std::fs::read_to_string(path)?;
        self.from_yaml(&content)
    }

    /// Load configuration from a YAML document with environment overrides
    pub fn from_yaml(&self, content: &str) -> ConfigResult<CohortConfig> {
        let mut config: CohortConfig = serde_yaml::from_str(content)?;
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<CohortConfig> {
        let mut config = CohortConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<CohortConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut CohortConfig) -> ConfigResult<()> {
        if let Ok(backend) = self.get_env_var("BACKEND") {
            config.backend = BackendSpec::from_str(&backend)?;
        }

        if let Ok(grace) = self.get_env_var("LOCK_GRACE_PERIOD") {
            config.locking.grace_period = parse_duration("LOCK_GRACE_PERIOD", &grace)?;
        }

        if let Ok(poll) = self.get_env_var("LOCK_POLL_INTERVAL") {
            config.locking.poll_interval = parse_duration("LOCK_POLL_INTERVAL", &poll)?;
        }

        if let Ok(path) = self.get_env_var("RESUMPTION_FILE") {
            config.jobs.resumption_file = PathBuf::from(path);
        }

        if let Ok(resume) = self.get_env_var("RESUME") {
            config.jobs.resume = resume
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid RESUME: {}", e)))?;
        }

        if let Ok(interval) = self.get_env_var("STATS_REPORT_INTERVAL") {
            config.statistics.report_interval = parse_duration("STATS_REPORT_INTERVAL", &interval)?;
        }

        if let Ok(shared) = self.get_env_var("SHARED_MEMORY") {
            config.data_cache.shared_memory = shared
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid SHARED_MEMORY: {}", e)))?;
        }

        if let Ok(level) = self.get_env_var("LOG_LEVEL") {
            config.logging.level = LogLevel::from_str(&level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.logging.format = LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_duration(name: &str, value: &str) -> ConfigResult<Duration> {
    humantime_serde::re::humantime::parse_duration(value)
        .map_err(|e| ConfigError::EnvError(format!("Invalid {}: {}", name, e)))
}
