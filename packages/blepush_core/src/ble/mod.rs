//! BLE boundary layer for the pusher
//!
//! Provides the peripheral/central transport traits, the GATT service
//! definition, the advertisement codec, and a simulated in-process BLE
//! network used for testing and for running without a radio.

pub mod advertising;
pub mod gatt;
pub mod simulated;
pub mod transport;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Advertising error: {0}")]
    AdvertisingError(String),

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("GATT error: {0}")]
    GattError(String),

    #[error("Payload exceeds MTU ({size} > {mtu})")]
    MtuExceeded { size: usize, mtu: usize },

    #[error("Advertisement too large ({size} > {max} bytes)")]
    AdvertisementTooLarge { size: usize, max: usize },

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,
}
