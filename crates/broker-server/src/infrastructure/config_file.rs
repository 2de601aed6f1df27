//! Optional TOML configuration file.
//!
//! Every key is optional; whatever is present overrides the built-in
//! defaults, and command-line flags override the file in turn.
//!
//! ```toml
//! bind_addr = "0.0.0.0:8000"
//! commit = "4f2a9c1"
//! handshake_timeout_secs = 10
//! keepalive_interval_secs = 5
//! keepalive_timeout_secs = 20
//! max_message_size = 16777216
//! outbox_capacity = 1024
//! worker_command = ["python3", "worker.py"]
//! worker_transport = "handoff"
//!
//! [retention]
//! management = 0
//! compute_process = 1
//! ```
//!
//! # Serde and missing keys (for beginners)
//!
//! Each field is an `Option`.  Serde maps an absent key to `None`, so a file
//! that only sets `bind_addr` leaves every other setting at its default.
//! `deny_unknown_fields` turns a misspelt key into a parse error instead of
//! a silently ignored line.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::domain::{BrokerConfig, WorkerTransport};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("I/O error reading config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Per-type retention overrides.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetentionSection {
    pub management: Option<usize>,
    pub compute_process: Option<usize>,
    pub tunnel: Option<usize>,
}

/// On-disk schema.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub bind_addr: Option<SocketAddr>,
    pub commit: Option<String>,
    pub version: Option<String>,
    pub handshake_timeout_secs: Option<u64>,
    pub keepalive_interval_secs: Option<u64>,
    pub keepalive_timeout_secs: Option<u64>,
    pub max_message_size: Option<usize>,
    pub outbox_capacity: Option<usize>,
    pub worker_command: Option<Vec<String>>,
    pub worker_transport: Option<WorkerTransport>,
    #[serde(default)]
    pub retention: RetentionSection,
}

impl FileConfig {
    /// Reads and parses the file at `path`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file cannot be read, [`ConfigError::Parse`]
    /// if it is not valid TOML for this schema.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Overwrites the fields of `config` that this file sets.
    pub fn apply_to(&self, config: &mut BrokerConfig) {
        if let Some(addr) = self.bind_addr {
            config.bind_addr = addr;
        }
        if let Some(commit) = &self.commit {
            config.commit = commit.clone();
        }
        if let Some(version) = &self.version {
            config.version = version.clone();
        }
        if let Some(secs) = self.handshake_timeout_secs {
            config.handshake_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.keepalive_interval_secs {
            config.keepalive_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.keepalive_timeout_secs {
            config.keepalive_timeout = Duration::from_secs(secs);
        }
        if let Some(size) = self.max_message_size {
            config.max_message_size = size;
        }
        if let Some(capacity) = self.outbox_capacity {
            config.outbox_capacity = capacity;
        }
        if let Some(command) = &self.worker_command {
            config.worker_command = command.clone();
        }
        if let Some(transport) = self.worker_transport {
            config.worker_transport = transport;
        }
        if let Some(n) = self.retention.management {
            config.retention.management = n;
        }
        if let Some(n) = self.retention.compute_process {
            config.retention.compute_process = n;
        }
        if let Some(n) = self.retention.tunnel {
            config.retention.tunnel = n;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
