//! Reflector configuration.
//!
//! A flat struct with defaults matching a small standalone reflector.
//! Deserializable from a TOML file; the `reflectord` binary layers CLI
//! overrides on top. [`ReflectorConfig::validate`] is called once at
//! startup; an unusable configuration is an initialization failure,
//! not something to limp along with.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::ReflectorError;

/// A random-QSY pool: talkgroups `lo ..= lo + size - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct QsyRange {
    pub lo: u32,
    pub size: u32,
}

/// Runtime configuration for the reflector.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReflectorConfig {
    /// TCP and UDP listen port. Both channels share the port number.
    /// Port 0 lets the OS pick (useful in tests).
    pub listen_port: u16,

    /// Maximum talker silence in seconds before the talker slot is
    /// reclaimed. 0 disables the squelch timeout.
    pub sql_timeout: u64,

    /// Seconds a timed-out talker stays on the block list.
    pub sql_timeout_blocktime: u64,

    /// The talkgroup implicitly shared by every v1 node. Talker events
    /// on this talkgroup are additionally translated to the v1 shim
    /// messages.
    pub tg_for_v1_clients: u32,

    /// Pool for random QSY allocation. Unset disables random QSY.
    pub random_qsy_range: Option<QsyRange>,

    /// Shared key for the challenge/response handshake. Must be
    /// non-empty; there is no anonymous mode.
    pub auth_key: String,

    /// Seconds between keep-alive messages on each channel. A client
    /// silent for three intervals is disconnected.
    pub heartbeat_interval: u64,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            listen_port: 5300,
            sql_timeout: 0,
            sql_timeout_blocktime: 60,
            tg_for_v1_clients: 1,
            random_qsy_range: None,
            auth_key: String::new(),
            heartbeat_interval: 10,
        }
    }
}

impl ReflectorConfig {
    /// Loads a configuration from a TOML file.
    ///
    /// # Errors
    /// Returns [`ReflectorError::ConfigFile`] if the file cannot be read
    /// or does not parse.
    pub fn from_toml_file(path: &Path) -> Result<Self, ReflectorError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ReflectorError::ConfigFile(format!("{}: {e}", path.display())))?;
        toml::from_str(&text)
            .map_err(|e| ReflectorError::ConfigFile(format!("{}: {e}", path.display())))
    }

    /// Checks the configuration for values the reflector cannot run with.
    ///
    /// # Errors
    /// Returns [`ReflectorError::Config`] naming the offending key.
    pub fn validate(&self) -> Result<(), ReflectorError> {
        if self.auth_key.is_empty() {
            return Err(ReflectorError::Config("auth_key must be set".into()));
        }
        if self.heartbeat_interval == 0 {
            return Err(ReflectorError::Config(
                "heartbeat_interval must be at least 1 second".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    /// A client silent for this long on both channels is disconnected.
    pub(crate) fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval * 3)
    }

    pub(crate) fn sql_timeout(&self) -> Duration {
        Duration::from_secs(self.sql_timeout)
    }

    pub(crate) fn sql_timeout_blocktime(&self) -> Duration {
        Duration::from_secs(self.sql_timeout_blocktime)
    }
}
