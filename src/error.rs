//! TabSync Error Types

use thiserror::Error;

/// Result type alias for TabSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// TabSync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Configuration serialization failed: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    // Store errors
    #[error("Module not registered: {0}")]
    ModuleNotFound(String),

    #[error("Invalid operation name: {0}")]
    InvalidOperationName(String),

    #[error("Unknown operation {operation} on module {module}")]
    UnknownOperation { module: String, operation: String },

    #[error("Invalid payload for {operation}: {reason}")]
    InvalidPayload { operation: String, reason: String },

    // Channel errors
    #[error("Channel {name} unavailable: {reason}")]
    ChannelUnavailable { name: String, reason: String },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    // Identity provider errors
    #[error("Identity provider error: {0}")]
    Identity(String),

    // Networking errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API request {method} {path} failed with status {status}")]
    Api { method: String, path: String, status: u16 },

    #[error("Unauthorized after {attempts} attempt(s): {method} {path}")]
    Unauthorized { method: String, path: String, attempts: u32 },

    // Signal errors
    #[error("Deferred signal rejected: {0}")]
    Rejected(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error came from the identity provider boundary
    pub fn is_identity(&self) -> bool {
        matches!(self, Error::Identity(_))
    }

    /// Check if this error means a module should run without replication
    pub fn is_channel_failure(&self) -> bool {
        matches!(
            self,
            Error::ChannelUnavailable { .. } | Error::ChannelClosed(_) | Error::Transport(_)
        )
    }

    /// Check if the networking layer gave up because of authentication
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Error::Unauthorized { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert!(Error::Identity("popup blocked".into()).is_identity());
        assert!(Error::ChannelClosed("auth".into()).is_channel_failure());
        assert!(!Error::ModuleNotFound("auth".into()).is_channel_failure());

        let err = Error::Unauthorized {
            method: "GET".into(),
            path: "/me".into(),
            attempts: 2,
        };
        assert!(err.is_unauthorized());
        assert_eq!(err.to_string(), "Unauthorized after 2 attempt(s): GET /me");
    }
}
