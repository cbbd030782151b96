//! Connection and engine configuration.

use std::io::prelude::*;
use std::path::Path;
use std::time::Duration;
use std::{fs, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rdma::{ConnectAttr, QpCaps};

/// Configuration error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file cannot be read.
    #[error("cannot read configuration file")]
    Io(#[from] io::Error),

    /// The configuration is not valid TOML, or has fields of wrong types.
    #[error("malformed configuration")]
    Parse(#[from] toml::de::Error),

    /// The `[rdxfer]` table is absent.
    #[error("rdxfer configuration not found")]
    Missing,

    /// A field holds a value that cannot work.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Per-connection tunables.
///
/// Every field has a default, so an empty table is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Send queue depth.
    pub max_send_wr: u32,

    /// Receive queue depth. Unused by reads, but the QP still needs one.
    pub max_recv_wr: u32,

    /// Completion queue depth.
    pub cq_depth: u32,

    /// Maximum number of completions drained per poll.
    pub poll_batch: usize,

    /// How long the poller waits for completions when the CQ is empty, in
    /// microseconds.
    pub poll_idle_timeout_us: u64,

    /// Outstanding RDMA READs the QP may issue as an initiator.
    pub max_rd_atomic: u8,
    pub min_rnr_timer: u8,
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,

    /// IP hop limit for GID-routed (RoCE) packets.
    pub hop_limit: u8,

    /// Largest single work request, in bytes. Longer reads are split.
    pub max_read_chunk: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_send_wr: 8192,
            max_recv_wr: 8192,
            cq_depth: 16384,
            poll_batch: 64,
            poll_idle_timeout_us: 1000,
            max_rd_atomic: 16,
            min_rnr_timer: 12,
            timeout: 14,
            retry_cnt: 7,
            rnr_retry: 7,
            hop_limit: 1,
            max_read_chunk: 1 << 30,
        }
    }
}

impl ConnectionConfig {
    /// Check that the configuration can drive a connection.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_send_wr == 0 {
            return Err(ConfigError::Invalid("max_send_wr must be positive".into()));
        }
        if self.cq_depth < self.max_send_wr {
            return Err(ConfigError::Invalid(format!(
                "cq_depth ({}) must be at least max_send_wr ({})",
                self.cq_depth, self.max_send_wr
            )));
        }
        if self.poll_batch == 0 {
            return Err(ConfigError::Invalid("poll_batch must be positive".into()));
        }
        if self.max_read_chunk == 0 || self.max_read_chunk > u32::MAX as u64 {
            return Err(ConfigError::Invalid(format!(
                "max_read_chunk must fit a work request length, got {}",
                self.max_read_chunk
            )));
        }
        Ok(())
    }

    /// QP capabilities derived from this configuration.
    pub fn qp_caps(&self) -> QpCaps {
        QpCaps {
            max_send_wr: self.max_send_wr,
            max_recv_wr: self.max_recv_wr,
            max_send_sge: 1,
            max_recv_sge: 1,
            cq_depth: self.cq_depth,
        }
    }

    /// RC transport attributes derived from this configuration.
    pub fn connect_attr(&self) -> ConnectAttr {
        ConnectAttr {
            max_rd_atomic: self.max_rd_atomic,
            min_rnr_timer: self.min_rnr_timer,
            timeout: self.timeout,
            retry_cnt: self.retry_cnt,
            rnr_retry: self.rnr_retry,
            hop_limit: self.hop_limit,
        }
    }

    #[inline]
    pub fn poll_idle_timeout(&self) -> Duration {
        Duration::from_micros(self.poll_idle_timeout_us)
    }
}

/// Engine-wide configuration, stored under the `[rdxfer]` table of a TOML
/// file.
///
/// ```toml
/// [rdxfer.connection]
/// max_send_wr = 4096
/// poll_batch = 32
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Configuration applied to every connection the engine creates.
    pub connection: ConnectionConfig,
}

impl EngineConfig {
    /// Load the configuration from a TOML file.
    pub fn load_toml(config_file: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut file = fs::File::open(config_file)?;
        let mut toml_str = String::new();
        file.read_to_string(&mut toml_str)?;
        Self::from_toml_str(&toml_str)
    }

    /// Parse the configuration from TOML text.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let mut toml: toml::Table = toml::from_str(toml_str)?;
        let table = toml.remove("rdxfer").ok_or(ConfigError::Missing)?;
        let config: Self = table.try_into()?;
        config.connection.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_gives_defaults() {
        let config = EngineConfig::from_toml_str("[rdxfer]\n").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.connection.max_send_wr, 8192);
        assert_eq!(config.connection.max_read_chunk, 1 << 30);
    }

    #[test]
    fn partial_override() {
        let config = EngineConfig::from_toml_str(
            r#"
            [rdxfer.connection]
            max_send_wr = 128
            cq_depth = 256
            poll_idle_timeout_us = 50
            "#,
        )
        .unwrap();
        let conn = &config.connection;
        assert_eq!(conn.max_send_wr, 128);
        assert_eq!(conn.cq_depth, 256);
        assert_eq!(conn.poll_batch, 64);
        assert_eq!(conn.poll_idle_timeout(), Duration::from_micros(50));
        assert_eq!(conn.qp_caps().max_send_wr, 128);
        assert_eq!(conn.connect_attr().max_rd_atomic, 16);
    }

    #[test]
    fn rejects_bad_configs() {
        assert!(matches!(
            EngineConfig::from_toml_str("[other]\n"),
            Err(ConfigError::Missing)
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[rdxfer.connection]\npoll_batch = 0\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[rdxfer.connection]\nmax_read_chunk = 0\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[rdxfer.connection]\nno_such_knob = 1\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_from_file() -> anyhow::Result<()> {
        let path = std::env::temp_dir().join(format!("rdxfer-config-{}.toml", std::process::id()));
        fs::write(&path, "[rdxfer.connection]\nretry_cnt = 3\n")?;
        let config = EngineConfig::load_toml(&path);
        fs::remove_file(&path)?;
        assert_eq!(config?.connection.retry_cnt, 3);
        Ok(())
    }
}
