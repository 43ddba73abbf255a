//! Central-side probe: find the pusher by its service UUID, then exercise
//! the characteristic with two write/read rounds.

use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;

use crate::ble::advertising::ParsedAdvertisement;
use crate::ble::gatt::{CHARACTERISTIC_UUID, SERVICE_UUID};
use crate::ble::transport::{BleAddress, BleCentral, WriteType};
use crate::ble::BleError;

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// How long to listen for advertisements.
    pub scan_window: Duration,
    /// Pause between each write and the read that checks it.
    pub settle: Duration,
    /// Values written in order; each is read back after `settle`.
    pub writes: Vec<Vec<u8>>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            scan_window: Duration::from_secs(2),
            settle: Duration::from_secs(1),
            writes: vec![vec![0x01, 0x02, 0x03, 0x04], vec![0x05, 0x06, 0x07, 0x08]],
        }
    }
}

/// One write and the value read back afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRound {
    pub written: Vec<u8>,
    pub read: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub address: BleAddress,
    pub rounds: Vec<ProbeRound>,
}

impl ProbeReport {
    /// Every read returned what was just written.
    pub fn all_echoed(&self) -> bool {
        self.rounds.iter().all(|r| r.written == r.read)
    }
}

/// Listen for `window` and return the first advertiser of the pusher service.
pub async fn scan_for_pusher(
    central: &dyn BleCentral,
    window: Duration,
) -> Result<Option<BleAddress>, BleError> {
    let mut adv_rx = central.advertisements();
    central.start_scan().await?;
    log::info!("Scanning for {} ({:?})", SERVICE_UUID, window);

    let deadline = tokio::time::Instant::now() + window;
    let mut found = None;
    while found.is_none() {
        let adv = match tokio::time::timeout_at(deadline, adv_rx.recv()).await {
            Ok(Ok(adv)) => adv,
            Ok(Err(RecvError::Lagged(skipped))) => {
                log::debug!("Scanner lagged, skipped {} advertisements", skipped);
                continue;
            }
            Ok(Err(RecvError::Closed)) | Err(_) => break,
        };
        let matches = ParsedAdvertisement::parse(&adv.data)
            .map(|parsed| parsed.advertises_service(&SERVICE_UUID))
            .unwrap_or(false);
        if matches {
            log::info!("Found target device: {}", adv.source_address);
            found = Some(adv.source_address);
        }
    }

    central.stop_scan().await?;
    Ok(found)
}

/// Scan, connect, and run the write/read rounds. `Ok(None)` if nothing
/// advertising the service was seen.
pub async fn run_probe(
    central: &dyn BleCentral,
    config: &ProbeConfig,
) -> Result<Option<ProbeReport>, BleError> {
    let address = match scan_for_pusher(central, config.scan_window).await? {
        Some(address) => address,
        None => {
            log::info!("Target device not found");
            return Ok(None);
        }
    };

    let client = central.connect(&address).await?;
    log::info!("Connected to {}", address);

    let mut rounds = Vec::with_capacity(config.writes.len());
    for value in &config.writes {
        client
            .write(CHARACTERISTIC_UUID, value, WriteType::WithoutResponse)
            .await?;
        log::info!("Written value: {}", hex::encode(value));

        tokio::time::sleep(config.settle).await;

        let read = client.read(CHARACTERISTIC_UUID).await?;
        log::info!("Read value: {}", hex::encode(&read));
        rounds.push(ProbeRound {
            written: value.clone(),
            read,
        });
    }

    client.disconnect().await?;
    Ok(Some(ProbeReport { address, rounds }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::advertising::{AdvertiseData, AdvertiseSettings};
    use crate::ble::simulated::SimBleNetwork;
    use crate::ble::transport::BlePeripheral;
    use uuid::Uuid;

    #[tokio::test(start_paused = true)]
    async fn test_scan_ignores_other_services() {
        let network = SimBleNetwork::new();
        let other = network.create_device();
        other
            .start_advertising(
                AdvertiseSettings::default(),
                AdvertiseData::for_service(Uuid::new_v4()),
            )
            .await
            .unwrap();

        let central = network.create_device();
        let found = scan_for_pusher(&central, Duration::from_secs(2)).await.unwrap();
        assert_eq!(found, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_finds_pusher() {
        let network = SimBleNetwork::new();
        let pusher = network.create_device();
        pusher
            .start_advertising(
                AdvertiseSettings::default(),
                AdvertiseData::for_service(SERVICE_UUID),
            )
            .await
            .unwrap();

        let central = network.create_device();
        let found = scan_for_pusher(&central, Duration::from_secs(2)).await.unwrap();
        assert_eq!(found.as_ref(), Some(pusher.address()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_without_target() {
        let network = SimBleNetwork::new();
        let central = network.create_device();
        let report = run_probe(&central, &ProbeConfig::default()).await.unwrap();
        assert!(report.is_none());
    }
}
