use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Who simulates physics for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OperatingModel {
    /// The first client to join drives physics; re-elected when it leaves.
    PeerAuthoritative,
    /// No client is elected; only grabbing clients may move rigid bodies.
    ServerAuthoritative,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("heartbeat minimum ({min:?}) exceeds maximum ({max:?})")]
    HeartbeatRange { min: Duration, max: Duration },
    #[error("handshake timeout must be greater than zero")]
    ZeroHandshakeTimeout,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub operating_model: OperatingModel,
    pub handshake_timeout: Duration,
    pub heartbeat_min: Duration,
    pub heartbeat_max: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            operating_model: OperatingModel::PeerAuthoritative,
            handshake_timeout: Duration::from_secs(30),
            heartbeat_min: Duration::from_secs(5),
            heartbeat_max: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_min > self.heartbeat_max {
            return Err(ConfigError::HeartbeatRange {
                min: self.heartbeat_min,
                max: self.heartbeat_max,
            });
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::ZeroHandshakeTimeout);
        }
        Ok(())
    }

    pub fn with_operating_model(mut self, operating_model: OperatingModel) -> Self {
        self.operating_model = operating_model;
        self
    }

    pub fn is_peer_authoritative(&self) -> bool {
        self.operating_model == OperatingModel::PeerAuthoritative
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn defaults_are_valid() {
        let config = SessionConfig::default();
        config.validate().unwrap();
        assert!(config.is_peer_authoritative());
    }

    #[test_timeout::timeout]
    fn inverted_heartbeat_range_is_rejected() {
        let config = SessionConfig {
            heartbeat_min: Duration::from_secs(10),
            heartbeat_max: Duration::from_secs(5),
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::HeartbeatRange { .. })
        ));
    }

    #[test_timeout::timeout]
    fn operating_model_wire_names() {
        assert_eq!(
            serde_json::to_string(&OperatingModel::ServerAuthoritative).unwrap(),
            "\"server-authoritative\""
        );
    }
}
