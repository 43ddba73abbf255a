//! Transfer scheduling core
//!
//! Slices a payload into notification-sized blocks and pushes one block per
//! tick to every connected peer. There is a single shared cursor: a peer
//! joining mid-stream only sees blocks from its join point onward, and a
//! reconnecting peer is not replayed earlier blocks.

pub mod dispatcher;
pub mod payload;
pub mod peers;
pub mod scheduler;
pub mod session;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ble::transport::BleAddress;

pub use dispatcher::{GattNotifier, NotificationDispatcher};
pub use payload::{NextBlock, PayloadStore};
pub use peers::{PeerRegistry, SharedPeerRegistry};
pub use scheduler::{Block, BlockScheduler, SchedulerState, TickDecision};
pub use session::TransferSession;

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 160;

/// Default delay between ticks.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(60);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Notification to {peer} failed: {reason}")]
    DispatchFailed { peer: BleAddress, reason: String },

    #[error("A transfer is already in progress")]
    SchedulerAlreadyActive,

    #[error("Block size must be greater than zero")]
    InvalidBlockSize,

    #[error("Interval must be greater than zero")]
    InvalidInterval,

    #[error("Cannot commit offset {requested} (current {offset}, length {len})")]
    InvalidCommit {
        offset: usize,
        requested: usize,
        len: usize,
    },
}

/// What `arm` does while a transfer is still sending or waiting for peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RearmPolicy {
    /// Cancel the running transfer and start over with the new payload.
    #[default]
    Reset,
    /// Refuse with `SchedulerAlreadyActive`.
    Reject,
}

/// Validated scheduling parameters for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    block_size: usize,
    interval: Duration,
    rearm_policy: RearmPolicy,
}

impl TransferConfig {
    pub fn new(block_size: usize, interval: Duration) -> Result<Self, TransferError> {
        if block_size == 0 {
            return Err(TransferError::InvalidBlockSize);
        }
        if interval.is_zero() {
            return Err(TransferError::InvalidInterval);
        }
        Ok(Self {
            block_size,
            interval,
            rearm_policy: RearmPolicy::default(),
        })
    }

    pub fn with_rearm_policy(mut self, policy: RearmPolicy) -> Self {
        self.rearm_policy = policy;
        self
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn rearm_policy(&self) -> RearmPolicy {
        self.rearm_policy
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            interval: DEFAULT_INTERVAL,
            rearm_policy: RearmPolicy::default(),
        }
    }
}

/// Observable transfer progress, broadcast to session subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransferEvent {
    Armed { len: usize },
    Started,
    /// The last peer left (or none had joined); ticks continue without sending.
    Waiting,
    PeerConnected { peer: BleAddress },
    PeerDisconnected { peer: BleAddress },
    BlockSent {
        index: usize,
        offset: usize,
        len: usize,
        peers: usize,
    },
    PeerNotified { peer: BleAddress, index: usize },
    DispatchFailed {
        peer: BleAddress,
        index: usize,
        reason: String,
    },
    Completed { total_bytes: usize, blocks: usize },
    Stopped,
}
