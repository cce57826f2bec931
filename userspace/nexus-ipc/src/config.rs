// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Channel sizing loaded from TOML
//! OWNERS: @runtime
//!
//! ```toml
//! [ump]
//! msg_size = 64
//! frame_size = 4096
//!
//! [datachan]
//! buffer_len = 4096
//!
//! [rpc]
//! buf_page_size = 16384
//!
//! [host]
//! queue_depth = 16
//! ```
//!
//! Every section and key is optional; missing values take the defaults above.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::ump::validate_msg_size;

/// Errors raised while loading an [`IpcConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read ipc config {path}: {source}")]
    Read {
        /// File that was requested.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse ipc config {path}: {source}")]
    Parse {
        /// File that was parsed.
        path: PathBuf,
        /// Underlying decode failure.
        #[source]
        source: toml::de::Error,
    },
    /// Inline TOML is not valid for this schema.
    #[error("failed to parse ipc config: {0}")]
    ParseStr(#[source] toml::de::Error),
    /// A value parsed but cannot size a channel.
    #[error("invalid ipc config value {key} = {value}")]
    Invalid {
        /// Dotted key of the offending value.
        key: &'static str,
        /// Rejected value.
        value: usize,
    },
}

/// Shared-memory channel sizing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UmpConfig {
    /// Slot size in bytes, flag word included.
    pub msg_size: usize,
    /// Size of the frame split into the two panes.
    pub frame_size: usize,
}

impl Default for UmpConfig {
    fn default() -> Self {
        Self { msg_size: 64, frame_size: 4096 }
    }
}

/// Data channel sizing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataChanConfig {
    /// Ring buffer length, one byte of which is never usable.
    pub buffer_len: usize,
}

impl Default for DataChanConfig {
    fn default() -> Self {
        Self { buffer_len: 4096 }
    }
}

/// RPC engine sizing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RpcConfig {
    /// Size of the per-binding string buffer page.
    pub buf_page_size: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self { buf_page_size: 16 * 1024 }
    }
}

/// Host kernel emulation sizing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Messages an endpoint queues before senders see a transient failure.
    pub queue_depth: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self { queue_depth: 16 }
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IpcConfig {
    /// `[ump]` section.
    pub ump: UmpConfig,
    /// `[datachan]` section.
    pub datachan: DataChanConfig,
    /// `[rpc]` section.
    pub rpc: RpcConfig,
    /// `[host]` section.
    pub host: HostConfig,
}

impl IpcConfig {
    /// Reads and validates the configuration stored at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let config: Self = toml::from_str(&data)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates inline TOML.
    pub fn from_toml_str(data: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(data).map_err(ConfigError::ParseStr)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every value can size the structure it configures.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let msg_size = self.ump.msg_size;
        if validate_msg_size(msg_size).is_err() {
            return Err(ConfigError::Invalid { key: "ump.msg_size", value: msg_size });
        }
        let frame = self.ump.frame_size;
        if frame == 0 || frame % (2 * msg_size) != 0 {
            return Err(ConfigError::Invalid { key: "ump.frame_size", value: frame });
        }
        if self.datachan.buffer_len < 2 {
            return Err(ConfigError::Invalid {
                key: "datachan.buffer_len",
                value: self.datachan.buffer_len,
            });
        }
        if self.rpc.buf_page_size == 0 {
            return Err(ConfigError::Invalid { key: "rpc.buf_page_size", value: 0 });
        }
        if self.host.queue_depth == 0 {
            return Err(ConfigError::Invalid { key: "host.queue_depth", value: 0 });
        }
        Ok(())
    }
}
