//! Peer registry: who is connected right now.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::ble::transport::BleAddress;

/// Set of currently connected centrals. Holds no per-peer transfer state.
#[derive(Debug, Default, Clone)]
pub struct PeerRegistry {
    peers: HashSet<BleAddress>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the peer was not already present.
    pub fn add(&mut self, peer: BleAddress) -> bool {
        self.peers.insert(peer)
    }

    /// Returns `true` if the peer was present.
    pub fn remove(&mut self, peer: &BleAddress) -> bool {
        self.peers.remove(peer)
    }

    /// Point-in-time copy of the membership.
    pub fn snapshot(&self) -> HashSet<BleAddress> {
        self.peers.clone()
    }

    pub fn contains(&self, peer: &BleAddress) -> bool {
        self.peers.contains(peer)
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }
}

/// Registry shared between connection callbacks and the tick loop.
///
/// Callbacks mutate it under the lock; the tick loop only reads snapshots, so
/// a fan-out never observes a half-applied add or remove.
#[derive(Debug, Default, Clone)]
pub struct SharedPeerRegistry {
    inner: Arc<Mutex<PeerRegistry>>,
}

impl SharedPeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, peer: BleAddress) -> bool {
        self.inner.lock().await.add(peer)
    }

    pub async fn remove(&self, peer: &BleAddress) -> bool {
        self.inner.lock().await.remove(peer)
    }

    pub async fn snapshot(&self) -> HashSet<BleAddress> {
        self.inner.lock().await.snapshot()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}
