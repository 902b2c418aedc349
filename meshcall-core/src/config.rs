//! Call configuration

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 1:1 call manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallManagerConfig {
    /// How long an invitation rings before it is given up, both ways
    #[serde(with = "duration_secs")]
    pub ring_timeout: Duration,
    /// ICE restarts allowed before a connectivity failure is terminal
    pub ice_restart_attempts: u32,
    /// Event channel capacity
    pub event_capacity: usize,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(30),
            ice_restart_attempts: 1,
            event_capacity: 100,
        }
    }
}

/// Group call manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupCallConfig {
    /// Mesh size bound, local user included. Every participant holds one
    /// peer link per other participant, so this stays small.
    pub max_participants: usize,
    /// ICE restarts allowed per link before the link is dropped
    pub ice_restart_attempts: u32,
    /// Event channel capacity
    pub event_capacity: usize,
}

impl Default for GroupCallConfig {
    fn default() -> Self {
        Self {
            max_participants: 4,
            ice_restart_attempts: 1,
            event_capacity: 100,
        }
    }
}

/// Configuration for a [`crate::CallAgent`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// 1:1 calls
    pub call: CallManagerConfig,
    /// Group calls
    pub group: GroupCallConfig,
}

impl AgentConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.call.ring_timeout, Duration::from_secs(30));
        assert_eq!(config.call.ice_restart_attempts, 1);
        assert_eq!(config.group.max_participants, 4);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"call":{"ring_timeout":5},"group":{"max_participants":3}}"#)
                .unwrap();
        assert_eq!(config.call.ring_timeout, Duration::from_secs(5));
        assert_eq!(config.call.event_capacity, 100);
        assert_eq!(config.group.max_participants, 3);
        assert_eq!(config.group.ice_restart_attempts, 1);
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");

        let mut config = AgentConfig::default();
        config.call.ring_timeout = Duration::from_secs(12);
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

        assert_eq!(AgentConfig::from_json_file(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file_is_error() {
        let err = AgentConfig::from_json_file("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("reading /definitely/not/here.json"));
        assert!(err.chain().count() > 1);
    }

    #[test]
    fn test_malformed_file_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = AgentConfig::from_json_file(&path).unwrap_err();
        assert_eq!(err.to_string(), format!("parsing {}", path.display()));
        assert!(err.root_cause().is::<serde_json::Error>());
    }
}
