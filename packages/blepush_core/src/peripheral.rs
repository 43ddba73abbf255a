//! PusherPeripheral: the GATT peripheral that owns a transfer session
//!
//! Registers the pusher service, advertises it, and runs the GATT server
//! event loop: connection events feed the session's peer registry, and
//! read/write requests are served from a characteristic-local value that
//! notifications never touch.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ble::advertising::{AdvertiseData, AdvertiseSettings};
use crate::ble::gatt::{pusher_service, GattStatus, CHARACTERISTIC_UUID, SERVICE_UUID};
use crate::ble::transport::{BleAddress, BlePeripheral, GattServer, GattServerEvent};
use crate::ble::BleError;
use crate::transfer::{
    GattNotifier, SchedulerState, TransferConfig, TransferError, TransferEvent, TransferSession,
};

#[derive(Error, Debug)]
pub enum PeripheralError {
    #[error("BLE error: {0}")]
    Ble(#[from] BleError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),
}

/// The value a central reads and writes directly.
#[derive(Debug)]
pub struct CharacteristicValue {
    value: Mutex<Vec<u8>>,
}

impl CharacteristicValue {
    pub fn new(initial: Vec<u8>) -> Self {
        Self {
            value: Mutex::new(initial),
        }
    }

    pub fn get(&self) -> Vec<u8> {
        self.value.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set(&self, value: Vec<u8>) {
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = value;
    }
}

pub struct PusherPeripheral {
    advertiser: Arc<dyn BlePeripheral>,
    server: Arc<dyn GattServer>,
    session: TransferSession,
    payload: Bytes,
    characteristic: CharacteristicValue,
    shutdown_tx: broadcast::Sender<()>,
}

impl PusherPeripheral {
    /// `payload` is re-armed from the start on every `start_advertising`.
    pub fn new(
        advertiser: Arc<dyn BlePeripheral>,
        server: Arc<dyn GattServer>,
        config: TransferConfig,
        payload: impl Into<Bytes>,
    ) -> Arc<Self> {
        let notifier = GattNotifier::new(Arc::clone(&server), CHARACTERISTIC_UUID);
        let session = TransferSession::new(config, Arc::new(notifier));
        let initial = pusher_service()
            .characteristic(&CHARACTERISTIC_UUID)
            .map(|c| c.initial_value.clone())
            .unwrap_or_default();
        let (shutdown_tx, _) = broadcast::channel(1);

        Arc::new(Self {
            advertiser,
            server,
            session,
            payload: payload.into(),
            characteristic: CharacteristicValue::new(initial),
            shutdown_tx,
        })
    }

    /// Register the service and start serving GATT events.
    /// Call once, before `start_advertising`.
    pub async fn open(self: &Arc<Self>) -> Result<(), PeripheralError> {
        self.server.add_service(pusher_service()).await?;
        log::info!("GATT service {} registered", SERVICE_UUID);

        let peripheral = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = peripheral.server.next_event() => {
                        match result {
                            Ok(event) => peripheral.handle_event(event).await,
                            Err(e) => {
                                log::warn!("GATT server event stream ended: {}", e);
                                break;
                            }
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
        Ok(())
    }

    /// Restart advertising and re-arm the payload at offset 0.
    pub async fn start_advertising(&self) -> Result<(), PeripheralError> {
        self.advertiser.stop_advertising().await?;
        self.advertiser
            .start_advertising(
                AdvertiseSettings::default(),
                AdvertiseData::for_service(SERVICE_UUID),
            )
            .await?;
        log::info!("Advertising started");

        self.session.arm(self.payload.clone()).await?;
        Ok(())
    }

    /// Stop advertising and cancel the transfer.
    pub async fn stop_advertising(&self) -> Result<(), PeripheralError> {
        self.advertiser.stop_advertising().await?;
        self.session.stop();
        log::info!("Advertising stopped");
        Ok(())
    }

    /// Stop the event loop. Connected peers stay connected.
    pub fn shutdown(&self) {
        self.session.stop();
        let _ = self.shutdown_tx.send(());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.session.subscribe()
    }

    pub fn session(&self) -> &TransferSession {
        &self.session
    }

    pub fn state(&self) -> SchedulerState {
        self.session.state()
    }

    pub fn is_advertising(&self) -> bool {
        self.advertiser.is_advertising()
    }

    pub fn characteristic_value(&self) -> Vec<u8> {
        self.characteristic.get()
    }

    async fn handle_event(&self, event: GattServerEvent) {
        match event {
            GattServerEvent::Connected { peer } => {
                self.session.on_peer_connected(peer).await;
            }
            GattServerEvent::Disconnected { peer } => {
                self.session.on_peer_disconnected(&peer).await;
            }
            GattServerEvent::ReadRequest {
                peer,
                request_id,
                characteristic,
                offset,
            } => {
                self.handle_read(&peer, request_id, characteristic, offset)
                    .await;
            }
            GattServerEvent::WriteRequest {
                peer,
                request_id,
                characteristic,
                value,
                response_needed,
                offset,
            } => {
                self.handle_write(
                    &peer,
                    request_id,
                    characteristic,
                    value,
                    response_needed,
                    offset,
                )
                .await;
            }
        }
    }

    async fn handle_read(
        &self,
        peer: &BleAddress,
        request_id: u32,
        characteristic: Uuid,
        offset: usize,
    ) {
        if characteristic != CHARACTERISTIC_UUID {
            log::debug!("Read for unknown characteristic {} from {}", characteristic, peer);
            self.respond(peer, request_id, GattStatus::RequestNotSupported, offset, None)
                .await;
            return;
        }

        let value = self.characteristic.get();
        log::info!("Read request for characteristic: {}", characteristic);
        log::info!("Read value: {}", hex::encode(&value));
        self.respond(peer, request_id, GattStatus::Success, offset, Some(&value))
            .await;
    }

    async fn handle_write(
        &self,
        peer: &BleAddress,
        request_id: u32,
        characteristic: Uuid,
        value: Vec<u8>,
        response_needed: bool,
        offset: usize,
    ) {
        if characteristic != CHARACTERISTIC_UUID {
            log::debug!("Write for unknown characteristic {} from {}", characteristic, peer);
            if response_needed {
                self.respond(peer, request_id, GattStatus::RequestNotSupported, offset, None)
                    .await;
            }
            return;
        }

        log::info!("Write request for characteristic: {}", characteristic);
        let logged = hex::encode(&value);
        self.characteristic.set(value);
        if response_needed {
            self.respond(peer, request_id, GattStatus::Success, offset, None)
                .await;
        }
        log::info!("Written value: {}", logged);
    }

    async fn respond(
        &self,
        peer: &BleAddress,
        request_id: u32,
        status: GattStatus,
        offset: usize,
        value: Option<&[u8]>,
    ) {
        if let Err(e) = self
            .server
            .send_response(peer, request_id, status, offset, value)
            .await
        {
            log::warn!("Failed to answer request {} from {}: {}", request_id, peer, e);
        }
    }
}
