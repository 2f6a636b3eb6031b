//! Shared data cache configuration

use serde::{Deserialize, Serialize};

use crate::error::ConfigResult;
use crate::validation::{validate_required_string, Validatable};

/// Shared data cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataCacheConfig {
    /// Prefer zero-copy shared memory transfer when the transport supports it
    pub shared_memory: bool,

    /// Prefix of the segment names published for the resident dataset
    pub segment_prefix: String,
}

impl Default for DataCacheConfig {
    fn default() -> Self {
        Self {
            shared_memory: false,
            segment_prefix: "cohort".to_string(),
        }
    }
}

impl Validatable for DataCacheConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(&self.segment_prefix, "segment_prefix", self.domain_name())
    }

    fn domain_name(&self) -> &'static str {
        "data_cache"
    }
}
