//! In-process BLE simulator
//!
//! Provides a simulated BLE network where devices can advertise, scan,
//! connect, exchange GATT reads/writes and push notifications entirely
//! in-process. Used for integration testing and for running the pusher
//! without real BLE hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::advertising::{AdvertiseData, AdvertiseSettings};
use super::gatt::{max_notification_payload, CharacteristicProperties, GattService, GattStatus};
use super::transport::{
    BleAddress, BleAdvertisement, BleCentral, BlePeripheral, GattClient, GattServer,
    GattServerEvent, Notification, WriteType,
};
use super::BleError;

/// MTU negotiated by simulated devices unless overridden.
pub const DEFAULT_SIM_MTU: usize = 247;

/// Notifications a central can have queued before further ones are dropped.
pub const DEFAULT_NOTIFICATION_QUEUE: usize = 64;

/// How long a central waits for the peripheral to answer a read or write.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type PendingResponse = oneshot::Sender<(GattStatus, Option<Vec<u8>>)>;

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The simulated "air": a shared medium through which all simulated
/// devices communicate.
pub struct SimBleNetwork {
    /// Broadcast channel for advertisements.
    adv_tx: broadcast::Sender<BleAdvertisement>,
    /// GATT servers of peripherals currently accepting connections.
    peripherals: Mutex<HashMap<BleAddress, Arc<ServerShared>>>,
}

impl SimBleNetwork {
    /// Create a new simulated BLE network.
    pub fn new() -> Arc<Self> {
        let (adv_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            adv_tx,
            peripherals: Mutex::new(HashMap::new()),
        })
    }

    /// Create a new simulated BLE device on this network.
    pub fn create_device(self: &Arc<Self>) -> SimBleDevice {
        let address = BleAddress::Simulated(Uuid::new_v4());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        SimBleDevice {
            address: address.clone(),
            network: Arc::clone(self),
            mtu: DEFAULT_SIM_MTU,
            latency: Duration::ZERO,
            notification_queue: DEFAULT_NOTIFICATION_QUEUE,
            server: Arc::new(ServerShared {
                address,
                services: StdMutex::new(Vec::new()),
                events_tx,
                events_rx: Mutex::new(events_rx),
                links: StdMutex::new(HashMap::new()),
                pending: StdMutex::new(HashMap::new()),
                next_request_id: AtomicU32::new(1),
            }),
            advertising: AtomicBool::new(false),
            adv_task: StdMutex::new(None),
        }
    }
}

/// Server-side state of a simulated peripheral, shared with its clients.
struct ServerShared {
    address: BleAddress,
    services: StdMutex<Vec<GattService>>,
    events_tx: mpsc::UnboundedSender<GattServerEvent>,
    events_rx: Mutex<mpsc::UnboundedReceiver<GattServerEvent>>,
    /// Connected centrals keyed by their address.
    links: StdMutex<HashMap<BleAddress, SimLink>>,
    /// Requests waiting for `send_response`, keyed by request id.
    pending: StdMutex<HashMap<u32, PendingResponse>>,
    next_request_id: AtomicU32,
}

impl ServerShared {
    /// Tear down a link from either side. Emits `Disconnected` once.
    fn drop_link(&self, central: &BleAddress) -> bool {
        let removed = lock(&self.links).remove(central);
        match removed {
            Some(link) => {
                link.connected.store(false, Ordering::SeqCst);
                let _ = self.events_tx.send(GattServerEvent::Disconnected {
                    peer: central.clone(),
                });
                true
            }
            None => false,
        }
    }

    fn characteristic_properties(&self, uuid: &Uuid) -> Option<CharacteristicProperties> {
        lock(&self.services)
            .iter()
            .find_map(|s| s.characteristic(uuid))
            .map(|c| c.properties)
    }
}

/// Link state the peripheral keeps for one connected central.
struct SimLink {
    notify_tx: mpsc::Sender<Notification>,
    connected: Arc<AtomicBool>,
    mtu: usize,
    latency: Duration,
}

/// A simulated BLE device that can act as both central and peripheral.
pub struct SimBleDevice {
    address: BleAddress,
    network: Arc<SimBleNetwork>,
    mtu: usize,
    /// Link-layer latency applied to notifications on links opened as central.
    latency: Duration,
    notification_queue: usize,
    server: Arc<ServerShared>,
    advertising: AtomicBool,
    adv_task: StdMutex<Option<JoinHandle<()>>>,
}

impl SimBleDevice {
    /// Get this device's BLE address.
    pub fn address(&self) -> &BleAddress {
        &self.address
    }

    /// Set the ATT MTU used by links this device opens as a central.
    pub fn set_mtu(&mut self, mtu: usize) {
        self.mtu = mtu;
    }

    /// Set the link-layer latency applied to notifications on links this
    /// device opens as a central. Uses tokio virtual time, so paused clocks
    /// advance instantly in tests.
    pub fn set_latency(&mut self, latency: Duration) {
        self.latency = latency;
    }

    /// Set how many notifications this device buffers per link as a central.
    pub fn set_notification_queue(&mut self, depth: usize) {
        self.notification_queue = depth.max(1);
    }

    /// Drop the link to a connected central, as if the radio link was lost.
    pub fn disconnect_central(&self, central: &BleAddress) -> bool {
        self.server.drop_link(central)
    }

    /// Addresses of centrals currently connected to this device's GATT server.
    pub fn connected_centrals(&self) -> Vec<BleAddress> {
        lock(&self.server.links).keys().cloned().collect()
    }
}

impl Drop for SimBleDevice {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.adv_task).take() {
            task.abort();
        }
    }
}

#[async_trait]
impl BlePeripheral for SimBleDevice {
    async fn start_advertising(
        &self,
        settings: AdvertiseSettings,
        data: AdvertiseData,
    ) -> Result<(), BleError> {
        let raw = data.encode(&settings)?;

        // Register this device as a connectable peripheral.
        {
            let mut peripherals = self.network.peripherals.lock().await;
            if settings.connectable {
                peripherals.insert(self.address.clone(), Arc::clone(&self.server));
            } else {
                peripherals.remove(&self.address);
            }
        }

        let adv = BleAdvertisement {
            data: raw,
            rssi: None,
            source_address: self.address.clone(),
        };
        let adv_tx = self.network.adv_tx.clone();
        let interval = Duration::from_millis(settings.mode.interval_ms());
        let task = tokio::spawn(async move {
            loop {
                let _ = adv_tx.send(adv.clone());
                tokio::time::sleep(interval).await;
            }
        });

        if let Some(previous) = lock(&self.adv_task).replace(task) {
            previous.abort();
        }
        self.advertising.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), BleError> {
        if let Some(task) = lock(&self.adv_task).take() {
            task.abort();
        }
        self.advertising.store(false, Ordering::SeqCst);
        let mut peripherals = self.network.peripherals.lock().await;
        peripherals.remove(&self.address);
        Ok(())
    }

    fn is_advertising(&self) -> bool {
        self.advertising.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GattServer for SimBleDevice {
    async fn add_service(&self, service: GattService) -> Result<(), BleError> {
        let mut services = lock(&self.server.services);
        if services.iter().any(|s| s.uuid == service.uuid) {
            return Err(BleError::GattError(format!(
                "Service {} already registered",
                service.uuid
            )));
        }
        services.push(service);
        Ok(())
    }

    async fn next_event(&self) -> Result<GattServerEvent, BleError> {
        let mut rx = self.server.events_rx.lock().await;
        rx.recv().await.ok_or(BleError::Disconnected)
    }

    async fn send_response(
        &self,
        _peer: &BleAddress,
        request_id: u32,
        status: GattStatus,
        _offset: usize,
        value: Option<&[u8]>,
    ) -> Result<(), BleError> {
        let waiter = lock(&self.server.pending).remove(&request_id);
        let waiter = waiter.ok_or_else(|| {
            BleError::GattError(format!("No pending request with id {}", request_id))
        })?;
        waiter
            .send((status, value.map(|v| v.to_vec())))
            .map_err(|_| BleError::Disconnected)
    }

    async fn notify_characteristic_changed(
        &self,
        peer: &BleAddress,
        characteristic: Uuid,
        value: &[u8],
        confirm: bool,
    ) -> Result<(), BleError> {
        let required = if confirm {
            CharacteristicProperties::INDICATE
        } else {
            CharacteristicProperties::NOTIFY
        };
        match self.server.characteristic_properties(&characteristic) {
            Some(props) if props.contains(required) => {}
            Some(_) => {
                return Err(BleError::GattError(format!(
                    "Characteristic {} does not support {}",
                    characteristic,
                    if confirm { "indications" } else { "notifications" }
                )))
            }
            None => {
                return Err(BleError::GattError(format!(
                    "Unknown characteristic {}",
                    characteristic
                )))
            }
        }

        let (tx, mtu, latency) = {
            let links = lock(&self.server.links);
            let link = links.get(peer).ok_or(BleError::Disconnected)?;
            (link.notify_tx.clone(), link.mtu, link.latency)
        };

        let limit = max_notification_payload(mtu);
        if value.len() > limit {
            return Err(BleError::MtuExceeded {
                size: value.len(),
                mtu: limit,
            });
        }

        // Simulate BLE link-layer latency.
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let notification = Notification {
            characteristic,
            value: value.to_vec(),
        };
        if confirm {
            tx.send(notification)
                .await
                .map_err(|_| BleError::Disconnected)
        } else {
            tx.try_send(notification).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    BleError::GattError("Notification queue full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => BleError::Disconnected,
            })
        }
    }
}

#[async_trait]
impl BleCentral for SimBleDevice {
    async fn start_scan(&self) -> Result<(), BleError> {
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        Ok(())
    }

    fn advertisements(&self) -> broadcast::Receiver<BleAdvertisement> {
        self.network.adv_tx.subscribe()
    }

    async fn connect(&self, address: &BleAddress) -> Result<Box<dyn GattClient>, BleError> {
        let server = {
            let peripherals = self.network.peripherals.lock().await;
            peripherals.get(address).cloned().ok_or_else(|| {
                BleError::ConnectionError(format!("No connectable peripheral at {}", address))
            })?
        };

        let (notify_tx, notify_rx) = mpsc::channel(self.notification_queue);
        let connected = Arc::new(AtomicBool::new(true));
        let mtu = self.mtu;

        let link = SimLink {
            notify_tx,
            connected: Arc::clone(&connected),
            mtu,
            latency: self.latency,
        };
        let replaced = lock(&server.links).insert(self.address.clone(), link);
        if let Some(old) = replaced {
            old.connected.store(false, Ordering::SeqCst);
        }
        server
            .events_tx
            .send(GattServerEvent::Connected {
                peer: self.address.clone(),
            })
            .map_err(|_| BleError::ConnectionError("Peripheral is gone".to_string()))?;

        Ok(Box::new(SimGattClient {
            local_address: self.address.clone(),
            peer_address: server.address.clone(),
            server,
            notify_rx: Mutex::new(notify_rx),
            connected,
            mtu,
        }))
    }
}

/// Central side of a simulated GATT connection.
pub struct SimGattClient {
    local_address: BleAddress,
    peer_address: BleAddress,
    server: Arc<ServerShared>,
    notify_rx: Mutex<mpsc::Receiver<Notification>>,
    connected: Arc<AtomicBool>,
    mtu: usize,
}

impl SimGattClient {
    /// Issue a request and wait for the peripheral's response.
    async fn request(
        &self,
        event: impl FnOnce(u32) -> GattServerEvent,
    ) -> Result<(GattStatus, Option<Vec<u8>>), BleError> {
        let request_id = self.server.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.server.pending).insert(request_id, tx);

        if self.server.events_tx.send(event(request_id)).is_err() {
            lock(&self.server.pending).remove(&request_id);
            return Err(BleError::Disconnected);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(BleError::Disconnected),
            Err(_) => {
                lock(&self.server.pending).remove(&request_id);
                Err(BleError::Timeout)
            }
        }
    }
}

#[async_trait]
impl GattClient for SimGattClient {
    async fn write(
        &self,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), BleError> {
        if !self.is_connected() {
            return Err(BleError::Disconnected);
        }
        let limit = self.mtu.saturating_sub(3);
        if value.len() > limit {
            return Err(BleError::MtuExceeded {
                size: value.len(),
                mtu: limit,
            });
        }

        let peer = self.local_address.clone();
        match write_type {
            WriteType::WithoutResponse => {
                let request_id = self.server.next_request_id.fetch_add(1, Ordering::SeqCst);
                self.server
                    .events_tx
                    .send(GattServerEvent::WriteRequest {
                        peer,
                        request_id,
                        characteristic,
                        value: value.to_vec(),
                        response_needed: false,
                        offset: 0,
                    })
                    .map_err(|_| BleError::Disconnected)
            }
            WriteType::WithResponse => {
                let value = value.to_vec();
                let (status, _) = self
                    .request(|request_id| GattServerEvent::WriteRequest {
                        peer,
                        request_id,
                        characteristic,
                        value,
                        response_needed: true,
                        offset: 0,
                    })
                    .await?;
                match status {
                    GattStatus::Success => Ok(()),
                    other => Err(BleError::GattError(format!(
                        "Write rejected with status 0x{:02x}",
                        other.code()
                    ))),
                }
            }
        }
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, BleError> {
        if !self.is_connected() {
            return Err(BleError::Disconnected);
        }
        let peer = self.local_address.clone();
        let (status, value) = self
            .request(|request_id| GattServerEvent::ReadRequest {
                peer,
                request_id,
                characteristic,
                offset: 0,
            })
            .await?;
        match status {
            GattStatus::Success => Ok(value.unwrap_or_default()),
            other => Err(BleError::GattError(format!(
                "Read rejected with status 0x{:02x}",
                other.code()
            ))),
        }
    }

    async fn next_notification(&self) -> Result<Notification, BleError> {
        let mut rx = self.notify_rx.lock().await;
        rx.recv().await.ok_or(BleError::Disconnected)
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.server.drop_link(&self.local_address);
        }
        Ok(())
    }

    fn peer_address(&self) -> &BleAddress {
        &self.peer_address
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

impl Drop for SimGattClient {
    fn drop(&mut self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.server.drop_link(&self.local_address);
        }
    }
}
