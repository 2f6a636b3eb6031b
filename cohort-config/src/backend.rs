//! Backend selection string
//!
//! A backend is selected with a single string of the form `name` or
//! `name-count`, e.g. `null` or `local-4`. The count is only meaningful for
//! transports that spawn a fixed number of processes themselves.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Transport backend and, where applicable, the number of processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "String", into = "String")]
pub enum BackendSpec {
    /// Single process, no message traffic
    #[default]
    Null,
    /// All ranks inside this OS process; `processes` counts the coordinator
    Local { processes: usize },
}

impl BackendSpec {
    /// Total number of processes in a session using this backend
    pub fn processes(&self) -> usize {
        match self {
            BackendSpec::Null => 1,
            BackendSpec::Local { processes } => *processes,
        }
    }

    /// Whether coordination messages will actually be exchanged
    pub fn is_parallel(&self) -> bool {
        self.processes() > 1
    }
}

impl FromStr for BackendSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidBackend {
            spec: s.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = s.trim();
        let (name, count) = match trimmed.rsplit_once('-') {
            Some((name, count)) => {
                let count: usize = count
                    .parse()
                    .map_err(|_| invalid("process count must be a positive integer"))?;
                (name, Some(count))
            }
            None => (trimmed, None),
        };

        match (name, count) {
            ("null", None) => Ok(BackendSpec::Null),
            ("null", Some(_)) => Err(invalid("the null backend does not take a process count")),
            ("local", None) => Err(invalid(
                "the local backend needs a process count, e.g. local-4",
            )),
            ("local", Some(processes)) if processes < 2 => Err(invalid(
                "a parallel session needs at least 2 processes (one coordinator, one worker)",
            )),
            ("local", Some(processes)) => Ok(BackendSpec::Local { processes }),
            _ => Err(invalid("unknown backend name")),
        }
    }
}

impl TryFrom<String> for BackendSpec {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BackendSpec> for String {
    fn from(spec: BackendSpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for BackendSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendSpec::Null => write!(f, "null"),
            BackendSpec::Local { processes } => write!(f, "local-{}", processes),
        }
    }
}
