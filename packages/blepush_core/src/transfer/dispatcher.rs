//! Notification dispatcher: the boundary between the scheduler and the radio.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;
use uuid::Uuid;

use crate::ble::transport::{BleAddress, GattServer};
use crate::ble::BleError;

/// Turns a (peer, block) pair into one transport-level notification.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn notify(&self, peer: &BleAddress, block: &Bytes) -> Result<(), BleError>;
}

/// Dispatches blocks as GATT notifications on one characteristic.
pub struct GattNotifier {
    server: Arc<dyn GattServer>,
    characteristic: Uuid,
}

impl GattNotifier {
    pub fn new(server: Arc<dyn GattServer>, characteristic: Uuid) -> Self {
        Self {
            server,
            characteristic,
        }
    }
}

#[async_trait]
impl NotificationDispatcher for GattNotifier {
    async fn notify(&self, peer: &BleAddress, block: &Bytes) -> Result<(), BleError> {
        self.server
            .notify_characteristic_changed(peer, self.characteristic, block, false)
            .await
    }
}

/// Notify every peer concurrently. One failure does not stop the others.
pub async fn fan_out(
    dispatcher: &dyn NotificationDispatcher,
    peers: &[BleAddress],
    block: &Bytes,
) -> Vec<(BleAddress, Result<(), BleError>)> {
    let results = join_all(peers.iter().map(|peer| dispatcher.notify(peer, block))).await;
    peers.iter().cloned().zip(results).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every notify call and fails for one chosen peer.
    struct FlakyDispatcher {
        unreachable: BleAddress,
        calls: Mutex<Vec<(BleAddress, Vec<u8>)>>,
    }

    #[async_trait]
    impl NotificationDispatcher for FlakyDispatcher {
        async fn notify(&self, peer: &BleAddress, block: &Bytes) -> Result<(), BleError> {
            self.calls.lock().unwrap().push((peer.clone(), block.to_vec()));
            if *peer == self.unreachable {
                Err(BleError::Disconnected)
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_fan_out_continues_past_failure() {
        let a = BleAddress::Real([1, 0, 0, 0, 0, 0]);
        let b = BleAddress::Real([2, 0, 0, 0, 0, 0]);
        let c = BleAddress::Real([3, 0, 0, 0, 0, 0]);
        let dispatcher = FlakyDispatcher {
            unreachable: b.clone(),
            calls: Mutex::new(Vec::new()),
        };

        let block = Bytes::from_static(b"block");
        let results = fan_out(&dispatcher, &[a.clone(), b.clone(), c.clone()], &block).await;

        assert_eq!(results.len(), 3);
        assert!(results[0].1.is_ok());
        assert_eq!(results[1], (b, Err(BleError::Disconnected)));
        assert!(results[2].1.is_ok());
        assert_eq!(dispatcher.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_fan_out_to_nobody() {
        let dispatcher = FlakyDispatcher {
            unreachable: BleAddress::Real([0; 6]),
            calls: Mutex::new(Vec::new()),
        };
        let results = fan_out(&dispatcher, &[], &Bytes::from_static(b"x")).await;
        assert!(results.is_empty());
        assert!(dispatcher.calls.lock().unwrap().is_empty());
    }
}
