//! TabSync Configuration
//!
//! This module provides configuration structures for coordinating
//! instances: the bus and its election, session startup, the API client,
//! and logging.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::bus::{BusConfig, ElectionConfig};
use crate::session::SessionConfig;

/// Main TabSync configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TabSyncConfig {
    /// Coordination bus configuration
    #[serde(default)]
    pub bus: BusSection,

    /// Leader election timings
    #[serde(default)]
    pub election: ElectionSection,

    /// Session startup configuration
    #[serde(default)]
    pub session: SessionSection,

    /// API client configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Coordination bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSection {
    /// Channel carrying election traffic
    #[serde(default = "default_main_channel")]
    pub main_channel_name: String,

    /// Module holding the leadership flag
    #[serde(default = "default_coordination_module")]
    pub coordination_module: String,

    /// Run leader election
    #[serde(default = "default_true")]
    pub enable_leader_election: bool,

    /// Maximum wait for an election outcome during startup, in milliseconds
    #[serde(default = "default_election_wait_ms")]
    pub election_wait_ms: u64,
}

/// Leader election timings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionSection {
    /// Re-application interval while not leader, in milliseconds
    #[serde(default = "default_fallback_interval_ms")]
    pub fallback_interval_ms: u64,

    /// Response window per application round, in milliseconds
    #[serde(default = "default_response_time_ms")]
    pub response_time_ms: u64,
}

/// Session startup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    /// How long a non-leader waits for the leader's session, in milliseconds
    #[serde(default = "default_leader_answer_timeout_ms")]
    pub leader_answer_timeout_ms: u64,

    /// Scopes requested for API tokens
    #[serde(default)]
    pub api_scopes: Vec<String>,
}

/// API client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL prepended to request paths
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Value of the Accept-Language header
    #[serde(default = "default_accept_language")]
    pub accept_language: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_main_channel() -> String {
    "tabsync".to_string()
}

fn default_coordination_module() -> String {
    "broadcast".to_string()
}

fn default_true() -> bool {
    true
}

fn default_election_wait_ms() -> u64 {
    1000
}

fn default_fallback_interval_ms() -> u64 {
    1000
}

fn default_response_time_ms() -> u64 {
    300
}

fn default_leader_answer_timeout_ms() -> u64 {
    1000
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_accept_language() -> String {
    "de".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            main_channel_name: default_main_channel(),
            coordination_module: default_coordination_module(),
            enable_leader_election: true,
            election_wait_ms: default_election_wait_ms(),
        }
    }
}

impl Default for ElectionSection {
    fn default() -> Self {
        Self {
            fallback_interval_ms: default_fallback_interval_ms(),
            response_time_ms: default_response_time_ms(),
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            leader_answer_timeout_ms: default_leader_answer_timeout_ms(),
            api_scopes: Vec::new(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            accept_language: default_accept_language(),
        }
    }
}

impl ApiConfig {
    /// Get request timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl TabSyncConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: TabSyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.bus.main_channel_name.is_empty() {
            return Err(crate::Error::Config("bus.main_channel_name cannot be empty".into()));
        }

        if self.bus.coordination_module.is_empty() || self.bus.coordination_module.contains('/') {
            return Err(crate::Error::Config(
                "bus.coordination_module must be a non-empty name without '/'".into(),
            ));
        }

        if self.election.response_time_ms == 0 {
            return Err(crate::Error::Config("election.response_time_ms must be positive".into()));
        }

        if self.election.fallback_interval_ms == 0 {
            return Err(crate::Error::Config("election.fallback_interval_ms must be positive".into()));
        }

        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://") {
            return Err(crate::Error::Config("api.base_url must be an http(s) URL".into()));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "compact") {
            return Err(crate::Error::Config("logging.format must be pretty or compact".into()));
        }

        Ok(())
    }

    /// Get election wait as Duration
    pub fn election_wait(&self) -> Duration {
        Duration::from_millis(self.bus.election_wait_ms)
    }

    /// Get fallback interval as Duration
    pub fn fallback_interval(&self) -> Duration {
        Duration::from_millis(self.election.fallback_interval_ms)
    }

    /// Get response time as Duration
    pub fn response_time(&self) -> Duration {
        Duration::from_millis(self.election.response_time_ms)
    }

    /// Get leader answer timeout as Duration
    pub fn leader_answer_timeout(&self) -> Duration {
        Duration::from_millis(self.session.leader_answer_timeout_ms)
    }

    /// Bus settings
    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            main_channel_name: self.bus.main_channel_name.clone(),
            coordination_module_name: self.bus.coordination_module.clone(),
            enable_leader_election: self.bus.enable_leader_election,
            election_wait: self.election_wait(),
            election: ElectionConfig {
                fallback_interval: self.fallback_interval(),
                response_time: self.response_time(),
            },
        }
    }

    /// Session settings
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            leader_answer_timeout: self.leader_answer_timeout(),
            api_scopes: self.session.api_scopes.clone(),
        }
    }
}
