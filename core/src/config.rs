// Profile document parsing — the configuration surface of the overlay
//
// A profile document is a JSON object holding named profiles; `join` selects
// one by name. Where the document comes from (file, literal, remote fetch)
// is the caller's business.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// What a send attempt does while the connection is not online.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendPolicy {
    /// Quietly skip the message (historical behavior, survives transient
    /// reconnects without spurious failures).
    #[default]
    Silent,
    /// Fail the call with `NotOnline`.
    Strict,
}

/// One parsed profile: everything a membership session needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Fixed node id; a fresh UUID is generated per join when absent.
    #[serde(default)]
    pub node_id: Option<String>,

    /// Mesh network to join. Scopes the transport link.
    pub network_name: String,

    /// Ask the transport for a secured link.
    #[serde(default)]
    pub use_secure_transport: bool,

    /// Credential handed to the transport when securing the link.
    #[serde(default)]
    pub credential_secret: Option<String>,

    /// Seconds between neighbor discovery rounds.
    #[serde(default = "default_query_interval")]
    pub neighbor_query_interval_secs: u64,

    /// Advisory listen address; the mesh transport decides its own binding.
    #[serde(default)]
    pub listen_address: Option<String>,

    /// Behavior of sends while not online.
    #[serde(default)]
    pub send_policy: SendPolicy,
}

fn default_query_interval() -> u64 {
    10
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            network_name: String::new(),
            use_secure_transport: false,
            credential_secret: None,
            neighbor_query_interval_secs: default_query_interval(),
            listen_address: None,
            send_policy: SendPolicy::Silent,
        }
    }
}

impl OverlayConfig {
    /// Discovery round interval as a duration.
    pub fn query_interval(&self) -> Duration {
        Duration::from_secs(self.neighbor_query_interval_secs)
    }

    /// Reject parameter combinations no session can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network_name.trim().is_empty() {
            return Err(ConfigError::EmptyNetworkName);
        }
        if self.neighbor_query_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        if self.use_secure_transport && self.credential_secret.is_none() {
            return Err(ConfigError::MissingCredential);
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct ProfileDocument {
    profiles: HashMap<String, OverlayConfig>,
}

/// Why a profile document was rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("malformed profile document: {0}")]
    Malformed(String),
    #[error("no profile named {0:?} in document")]
    ProfileNotFound(String),
    #[error("network_name must not be empty")]
    EmptyNetworkName,
    #[error("neighbor_query_interval_secs must be at least 1")]
    ZeroInterval,
    #[error("use_secure_transport requires credential_secret")]
    MissingCredential,
}

/// Parse a profile document and select one profile by name.
pub fn parse_document(document: &str, selector: &str) -> Result<OverlayConfig, ConfigError> {
    let doc: ProfileDocument =
        serde_json::from_str(document).map_err(|e| ConfigError::Malformed(e.to_string()))?;

    let config = doc
        .profiles
        .get(selector)
        .cloned()
        .ok_or_else(|| ConfigError::ProfileNotFound(selector.to_string()))?;

    config.validate()?;
    Ok(config)
}
