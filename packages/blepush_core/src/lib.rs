// blepush - BLE notification data pusher

pub mod ble;
pub mod config;
pub mod peripheral;
pub mod probe;
pub mod transfer;

pub use ble::BleError;
pub use config::{ConfigError, PayloadSource, PusherConfig};
pub use peripheral::{PeripheralError, PusherPeripheral};
pub use probe::{run_probe, ProbeConfig, ProbeReport};
pub use transfer::{
    RearmPolicy, SchedulerState, TransferConfig, TransferError, TransferEvent, TransferSession,
};
