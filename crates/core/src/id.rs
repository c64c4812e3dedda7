//! Identifiers for controlled applications.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier of one controller instance.
///
/// Only used to correlate log lines; it carries no lifecycle meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppId(Ulid);

impl AppId {
    /// Generate a new AppId
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for AppId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AppId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "app_{}", self.0)
    }
}

impl std::str::FromStr for AppId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("app_").unwrap_or(s);
        Ok(Self(raw.parse()?))
    }
}
