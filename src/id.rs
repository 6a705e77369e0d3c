//! Instance Identity
//!
//! Every running instance (tab, window, worker) gets a random identifier
//! when it starts. The identifier tags outgoing envelopes, filters targeted
//! ones, and breaks ties during leader election.
//!
//! Format: a version-4 UUID in hyphenated lowercase form, e.g.
//! `8f14e45f-ceea-4e7a-9b3c-2f6a1d0c9e11`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Instance identifier wrapper type
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }

    /// Wrap an existing identifier without validation
    pub fn from_raw(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Get the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether the identifier has the version-4 UUID shape
    pub fn is_uuid_v4(&self) -> bool {
        Uuid::parse_str(&self.0)
            .map(|u| u.get_version_num() == 4)
            .unwrap_or(false)
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for InstanceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for InstanceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
