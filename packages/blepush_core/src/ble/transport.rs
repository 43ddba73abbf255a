//! BLE transport trait definitions and core types
//!
//! Defines the abstract peripheral/central interface. The simulated network
//! implements it in-process; a platform radio stack would implement the same
//! traits.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::advertising::{AdvertiseData, AdvertiseSettings};
use super::gatt::{GattService, GattStatus};
use super::BleError;

/// A BLE device address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BleAddress {
    /// A real 6-byte BLE MAC address.
    Real([u8; 6]),
    /// A simulated address identified by UUID.
    Simulated(Uuid),
}

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BleAddress::Real(mac) => write!(
                f,
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
            ),
            BleAddress::Simulated(id) => write!(f, "sim-{}", id.simple()),
        }
    }
}

/// A received BLE advertisement.
#[derive(Debug, Clone)]
pub struct BleAdvertisement {
    /// Raw advertisement data (AD structures).
    pub data: Vec<u8>,
    /// Received signal strength indicator (if available).
    pub rssi: Option<i16>,
    /// Address of the advertising device.
    pub source_address: BleAddress,
}

/// Events delivered by a GATT server to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum GattServerEvent {
    /// A central connected.
    Connected { peer: BleAddress },
    /// A central disconnected or the link was lost.
    Disconnected { peer: BleAddress },
    /// A central read a characteristic. Must be answered with `send_response`.
    ReadRequest {
        peer: BleAddress,
        request_id: u32,
        characteristic: Uuid,
        offset: usize,
    },
    /// A central wrote a characteristic. Answered only if `response_needed`.
    WriteRequest {
        peer: BleAddress,
        request_id: u32,
        characteristic: Uuid,
        value: Vec<u8>,
        response_needed: bool,
        offset: usize,
    },
}

/// How a central writes a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// A value pushed by the peripheral to a subscribed central.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

/// BLE peripheral role: advertising so centrals can find and connect.
#[async_trait]
pub trait BlePeripheral: Send + Sync {
    /// Start advertising. Connectable advertisements also accept connections.
    async fn start_advertising(
        &self,
        settings: AdvertiseSettings,
        data: AdvertiseData,
    ) -> Result<(), BleError>;

    /// Stop advertising. Stopping when not advertising is a no-op.
    async fn stop_advertising(&self) -> Result<(), BleError>;

    /// Whether an advertisement is currently active.
    fn is_advertising(&self) -> bool;
}

/// Server side of the GATT protocol, owned by the peripheral.
#[async_trait]
pub trait GattServer: Send + Sync {
    /// Register a primary service and its characteristics.
    async fn add_service(&self, service: GattService) -> Result<(), BleError>;

    /// Wait for the next connection or request event.
    async fn next_event(&self) -> Result<GattServerEvent, BleError>;

    /// Answer a read or write request.
    async fn send_response(
        &self,
        peer: &BleAddress,
        request_id: u32,
        status: GattStatus,
        offset: usize,
        value: Option<&[u8]>,
    ) -> Result<(), BleError>;

    /// Push a characteristic value to one connected central.
    ///
    /// `confirm = false` sends a notification, `true` an indication.
    async fn notify_characteristic_changed(
        &self,
        peer: &BleAddress,
        characteristic: Uuid,
        value: &[u8],
        confirm: bool,
    ) -> Result<(), BleError>;
}

/// BLE central role: scanning for advertisements and connecting to peripherals.
#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Start scanning for BLE advertisements.
    async fn start_scan(&self) -> Result<(), BleError>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Subscribe to discovered advertisements.
    fn advertisements(&self) -> broadcast::Receiver<BleAdvertisement>;

    /// Connect to a peripheral at the given address.
    async fn connect(&self, address: &BleAddress) -> Result<Box<dyn GattClient>, BleError>;
}

/// Client side of an established GATT connection.
#[async_trait]
pub trait GattClient: Send + Sync {
    /// Write a characteristic value.
    async fn write(
        &self,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), BleError>;

    /// Read a characteristic value.
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, BleError>;

    /// Wait for the next notification from the peripheral.
    async fn next_notification(&self) -> Result<Notification, BleError>;

    /// Disconnect from the peripheral.
    async fn disconnect(&self) -> Result<(), BleError>;

    /// Get the peripheral's BLE address.
    fn peer_address(&self) -> &BleAddress;

    /// Check whether the connection is still active.
    fn is_connected(&self) -> bool;

    /// Negotiated ATT MTU for this connection.
    fn mtu(&self) -> usize;
}
