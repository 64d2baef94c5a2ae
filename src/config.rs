//! Client configuration
//!
//! The configuration surface consumed by the core. The binary loads it
//! from a JSON file and/or CLI flags; everything has a default, and
//! `validate` rejects out-of-range values at startup.

use crate::error::{Result, TorError};
use crate::isolation::{IsolationLevel, IsolationPolicy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Bounds on the link handshake timeout.
const HANDSHAKE_TIMEOUT_RANGE: (u64, u64) = (5, 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SOCKS5 listen port
    pub socks_port: u16,

    /// Control surface listen port (events only; the text protocol is an
    /// external collaborator)
    pub control_port: Option<u16>,

    /// Where guard state and other persistent files live
    pub data_directory: PathBuf,

    /// Base isolation level
    pub isolation_level: IsolationLevel,

    /// Additive isolation flags
    pub isolate_destination: bool,
    pub isolate_socks_auth: bool,
    pub isolate_client_port: bool,

    /// Keep warm circuits prebuilt
    pub enable_circuit_prebuilding: bool,

    /// Pool bounds
    pub circuit_pool_min: usize,
    pub circuit_pool_max: usize,

    /// Age (seconds) past which a circuit takes no new streams
    pub max_circuit_dirtiness_secs: u64,

    /// Deadline (seconds) for one circuit build
    pub circuit_build_timeout_secs: u64,

    /// Link handshake deadline (seconds), valid range [5, 60]
    pub handshake_timeout_secs: u64,

    /// Per-authority directory fetch deadline (seconds)
    pub directory_timeout_secs: u64,

    /// Concurrent SOCKS session cap
    pub max_socks_sessions: usize,

    /// Metrics are emitted to an external sink; these only wire it up
    pub metrics_port: Option<u16>,
    pub enable_metrics: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socks_port: 9050,
            control_port: None,
            data_directory: PathBuf::from("tor-data"),
            isolation_level: IsolationLevel::Destination,
            isolate_destination: false,
            isolate_socks_auth: false,
            isolate_client_port: false,
            enable_circuit_prebuilding: true,
            circuit_pool_min: 2,
            circuit_pool_max: 10,
            max_circuit_dirtiness_secs: 600,
            circuit_build_timeout_secs: 30,
            handshake_timeout_secs: 10,
            directory_timeout_secs: 30,
            max_socks_sessions: 1000,
            metrics_port: None,
            enable_metrics: false,
        }
    }
}

impl Config {
    /// Load a JSON config file.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| TorError::InvalidConfig(format!("read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_slice(&bytes)
            .map_err(|e| TorError::InvalidConfig(format!("parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range values. Called at startup; failures are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.socks_port == 0 {
            return Err(TorError::InvalidConfig("socks_port must be nonzero".into()));
        }
        let (lo, hi) = HANDSHAKE_TIMEOUT_RANGE;
        if self.handshake_timeout_secs < lo || self.handshake_timeout_secs > hi {
            return Err(TorError::InvalidConfig(format!(
                "handshake_timeout_secs {} outside [{}, {}]",
                self.handshake_timeout_secs, lo, hi
            )));
        }
        if self.circuit_pool_max == 0 {
            return Err(TorError::InvalidConfig(
                "circuit_pool_max must be nonzero".into(),
            ));
        }
        if self.circuit_pool_min > self.circuit_pool_max {
            return Err(TorError::InvalidConfig(format!(
                "circuit_pool_min {} exceeds circuit_pool_max {}",
                self.circuit_pool_min, self.circuit_pool_max
            )));
        }
        if self.circuit_build_timeout_secs == 0 {
            return Err(TorError::InvalidConfig(
                "circuit_build_timeout_secs must be nonzero".into(),
            ));
        }
        if self.max_circuit_dirtiness_secs == 0 {
            return Err(TorError::InvalidConfig(
                "max_circuit_dirtiness_secs must be nonzero".into(),
            ));
        }
        if self.directory_timeout_secs == 0 {
            return Err(TorError::InvalidConfig(
                "directory_timeout_secs must be nonzero".into(),
            ));
        }
        if self.max_socks_sessions == 0 {
            return Err(TorError::InvalidConfig(
                "max_socks_sessions must be nonzero".into(),
            ));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn circuit_build_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_build_timeout_secs)
    }

    pub fn max_circuit_dirtiness(&self) -> Duration {
        Duration::from_secs(self.max_circuit_dirtiness_secs)
    }

    pub fn directory_timeout(&self) -> Duration {
        Duration::from_secs(self.directory_timeout_secs)
    }

    /// The isolation policy this configuration describes.
    pub fn isolation_policy(&self) -> IsolationPolicy {
        IsolationPolicy {
            level: self.isolation_level,
            isolate_destination: self.isolate_destination,
            isolate_socks_auth: self.isolate_socks_auth,
            isolate_client_port: self.isolate_client_port,
        }
    }
}
