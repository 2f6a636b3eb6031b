//! Job distribution configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigResult;
use crate::validation::Validatable;

/// Job distribution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Append-only file holding the completion state of resumable loops
    pub resumption_file: PathBuf,

    /// Whether loops pick up completion state left by an earlier run
    pub resume: bool,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            resumption_file: PathBuf::from(".cohort-resume.jsonl"),
            resume: true,
        }
    }
}

impl Validatable for JobsConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.resumption_file.as_os_str().is_empty() {
            return Err(self.validation_error("resumption_file cannot be empty"));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "jobs"
    }
}
