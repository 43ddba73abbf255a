//! Pusher configuration: JSON file, `BLEPUSH_CONFIG`, defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ble::gatt::max_notification_payload;
use crate::ble::simulated::DEFAULT_SIM_MTU;
use crate::transfer::{RearmPolicy, TransferConfig, TransferError};

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "BLEPUSH_CONFIG";

/// Length of the default counter payload.
pub const DEFAULT_PAYLOAD_LEN: usize = 1000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid hex payload: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("Payload is empty")]
    EmptyPayload,

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Where the bytes to push come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadSource {
    /// `len` bytes where byte `i` is `i mod 256`.
    Counter { len: usize },
    /// Hex-encoded literal.
    Hex { data: String },
    /// Raw contents of a file.
    File { path: PathBuf },
}

impl Default for PayloadSource {
    fn default() -> Self {
        PayloadSource::Counter {
            len: DEFAULT_PAYLOAD_LEN,
        }
    }
}

impl PayloadSource {
    pub fn load(&self) -> Result<Vec<u8>, ConfigError> {
        let bytes = match self {
            PayloadSource::Counter { len } => counter_payload(*len),
            PayloadSource::Hex { data } => hex::decode(data.trim())?,
            PayloadSource::File { path } => {
                std::fs::read(path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?
            }
        };
        if bytes.is_empty() {
            return Err(ConfigError::EmptyPayload);
        }
        Ok(bytes)
    }
}

/// `len` bytes counting up from zero, wrapping at 256.
pub fn counter_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| i as u8).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PusherConfig {
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub payload: PayloadSource,
    #[serde(default)]
    pub rearm_policy: RearmPolicy,
}

fn default_block_size() -> usize {
    crate::transfer::DEFAULT_BLOCK_SIZE
}

fn default_interval_ms() -> u64 {
    crate::transfer::DEFAULT_INTERVAL.as_millis() as u64
}

impl Default for PusherConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            interval_ms: default_interval_ms(),
            payload: PayloadSource::default(),
            rearm_policy: RearmPolicy::default(),
        }
    }
}

impl PusherConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&s)
    }

    /// Load from `path`, else from `$BLEPUSH_CONFIG`, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transfer_config()?;
        let limit = max_notification_payload(DEFAULT_SIM_MTU);
        if self.block_size > limit {
            log::warn!(
                "Block size {} exceeds the {} byte notification limit at MTU {}; \
                 notifications will fail unless the link negotiates a larger MTU",
                self.block_size,
                limit,
                DEFAULT_SIM_MTU
            );
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn transfer_config(&self) -> Result<TransferConfig, TransferError> {
        Ok(TransferConfig::new(self.block_size, self.interval())?
            .with_rearm_policy(self.rearm_policy))
    }
}
