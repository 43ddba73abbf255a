//! GATT service definition
//!
//! The pusher exposes one primary service with one characteristic that is
//! readable, writable without response, and notifiable. The service and the
//! characteristic share the same UUID.

use std::ops::BitOr;

use uuid::{uuid, Uuid};

/// Primary pusher GATT service UUID.
pub const SERVICE_UUID: Uuid = uuid!("e9b49a22-4c8a-4bc1-a163-baf7a7a07b1b");

/// Data characteristic UUID (notifications, reads and writes).
pub const CHARACTERISTIC_UUID: Uuid = uuid!("e9b49a22-4c8a-4bc1-a163-baf7a7a07b1b");

/// ATT MTU every connection starts with before an exchange.
pub const DEFAULT_ATT_MTU: usize = 23;

/// Bytes of ATT header (opcode + handle) in a notification PDU.
pub const ATT_NOTIFICATION_HEADER: usize = 3;

/// Largest notification value that fits a link with the given ATT MTU.
pub fn max_notification_payload(mtu: usize) -> usize {
    mtu.saturating_sub(ATT_NOTIFICATION_HEADER)
}

/// Characteristic property bits, as carried in the characteristic declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    pub const READ: Self = Self(0x02);
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x04);
    pub const WRITE: Self = Self(0x08);
    pub const NOTIFY: Self = Self(0x10);
    pub const INDICATE: Self = Self(0x20);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Attribute permissions enforced by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttributePermissions(u16);

impl AttributePermissions {
    pub const READ: Self = Self(0x01);
    pub const WRITE: Self = Self(0x10);

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AttributePermissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Status codes returned to a central in a read/write response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    ReadNotPermitted,
    WriteNotPermitted,
    InvalidOffset,
    RequestNotSupported,
}

impl GattStatus {
    /// ATT error code for this status (0 for success).
    pub fn code(self) -> u8 {
        match self {
            GattStatus::Success => 0x00,
            GattStatus::ReadNotPermitted => 0x02,
            GattStatus::WriteNotPermitted => 0x03,
            GattStatus::RequestNotSupported => 0x06,
            GattStatus::InvalidOffset => 0x07,
        }
    }
}

/// A characteristic inside a service.
#[derive(Debug, Clone, PartialEq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub permissions: AttributePermissions,
    pub initial_value: Vec<u8>,
}

/// A primary service with its characteristics.
#[derive(Debug, Clone, PartialEq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| &c.uuid == uuid)
    }
}

/// Build the pusher service: one characteristic, initial value four zero bytes.
pub fn pusher_service() -> GattService {
    GattService {
        uuid: SERVICE_UUID,
        characteristics: vec![GattCharacteristic {
            uuid: CHARACTERISTIC_UUID,
            properties: CharacteristicProperties::READ
                | CharacteristicProperties::NOTIFY
                | CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
            permissions: AttributePermissions::READ | AttributePermissions::WRITE,
            initial_value: vec![0u8; 4],
        }],
    }
}
