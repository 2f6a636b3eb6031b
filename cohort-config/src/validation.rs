//! Configuration validation traits and utilities

use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Trait for validatable configuration
pub trait Validatable {
    /// Validate the configuration
    fn validate(&self) -> ConfigResult<()>;

    /// Get the domain name for error reporting
    fn domain_name(&self) -> &'static str;

    /// Helper to create a domain-specific validation error
    fn validation_error(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::DomainError {
            domain: self.domain_name().to_string(),
            message: message.into(),
        }
    }
}

/// Validate a required string field
pub fn validate_required_string(value: &str, field_name: &str, domain: &str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} cannot be empty", field_name),
        });
    }
    Ok(())
}

/// Validate a non-zero duration
pub fn validate_non_zero_duration(
    value: Duration,
    field_name: &str,
    domain: &str,
) -> ConfigResult<()> {
    if value.is_zero() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} must be greater than zero", field_name),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_string() {
        assert!(validate_required_string("x", "field", "domain").is_ok());
        let err = validate_required_string("  ", "field", "domain").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Domain configuration error in domain: field cannot be empty"
        );
    }

    #[test]
    fn test_non_zero_duration() {
        assert!(validate_non_zero_duration(Duration::from_millis(1), "d", "x").is_ok());
        assert!(validate_non_zero_duration(Duration::ZERO, "d", "x").is_err());
    }
}
