//! Advertising parameters and the legacy advertisement payload codec
//!
//! The payload is a sequence of AD structures (`len || type || data`) that
//! must fit the 31-byte legacy advertising PDU. Scanners decode it to find
//! the pusher by its service UUID.

use uuid::Uuid;

use super::BleError;

/// Maximum legacy advertisement payload.
pub const MAX_ADVERTISEMENT_LEN: usize = 31;

const AD_TYPE_FLAGS: u8 = 0x01;
const AD_TYPE_INCOMPLETE_UUID128: u8 = 0x06;
const AD_TYPE_COMPLETE_UUID128: u8 = 0x07;
const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;
const AD_TYPE_TX_POWER_LEVEL: u8 = 0x0A;

/// LE General Discoverable Mode | BR/EDR Not Supported.
const FLAGS_GENERAL_DISCOVERABLE: u8 = 0x06;

/// Advertising interval trade-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdvertiseMode {
    LowPower,
    #[default]
    Balanced,
    LowLatency,
}

impl AdvertiseMode {
    /// Nominal advertising interval in milliseconds.
    pub fn interval_ms(self) -> u64 {
        match self {
            AdvertiseMode::LowPower => 1000,
            AdvertiseMode::Balanced => 250,
            AdvertiseMode::LowLatency => 100,
        }
    }
}

/// Transmit power setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxPowerLevel {
    UltraLow,
    Low,
    #[default]
    Medium,
    High,
}

impl TxPowerLevel {
    /// Radiated power in dBm, as advertised in the TX power AD structure.
    pub fn dbm(self) -> i8 {
        match self {
            TxPowerLevel::UltraLow => -21,
            TxPowerLevel::Low => -15,
            TxPowerLevel::Medium => -7,
            TxPowerLevel::High => 1,
        }
    }
}

/// How to advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertiseSettings {
    pub mode: AdvertiseMode,
    pub tx_power: TxPowerLevel,
    pub connectable: bool,
}

impl Default for AdvertiseSettings {
    fn default() -> Self {
        Self {
            mode: AdvertiseMode::LowLatency,
            tx_power: TxPowerLevel::Medium,
            connectable: true,
        }
    }
}

/// What to advertise.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdvertiseData {
    pub service_uuids: Vec<Uuid>,
    /// Local name, included only when `include_device_name` is set.
    pub device_name: Option<String>,
    pub include_device_name: bool,
    pub include_tx_power_level: bool,
}

impl AdvertiseData {
    /// Advertise a single service, TX power included, no device name.
    pub fn for_service(service: Uuid) -> Self {
        Self {
            service_uuids: vec![service],
            device_name: None,
            include_device_name: false,
            include_tx_power_level: true,
        }
    }

    /// Encode into AD structures. Fails if the result exceeds 31 bytes.
    pub fn encode(&self, settings: &AdvertiseSettings) -> Result<Vec<u8>, BleError> {
        let mut buf = Vec::with_capacity(MAX_ADVERTISEMENT_LEN);

        if settings.connectable {
            push_ad(&mut buf, AD_TYPE_FLAGS, &[FLAGS_GENERAL_DISCOVERABLE]);
        }

        if !self.service_uuids.is_empty() {
            let mut uuids = Vec::with_capacity(16 * self.service_uuids.len());
            for uuid in &self.service_uuids {
                // 128-bit UUIDs go over the air little-endian.
                uuids.extend(uuid.as_bytes().iter().rev());
            }
            push_ad(&mut buf, AD_TYPE_COMPLETE_UUID128, &uuids);
        }

        if self.include_tx_power_level {
            push_ad(
                &mut buf,
                AD_TYPE_TX_POWER_LEVEL,
                &[settings.tx_power.dbm() as u8],
            );
        }

        if self.include_device_name {
            if let Some(name) = &self.device_name {
                push_ad(&mut buf, AD_TYPE_COMPLETE_LOCAL_NAME, name.as_bytes());
            }
        }

        if buf.len() > MAX_ADVERTISEMENT_LEN {
            return Err(BleError::AdvertisementTooLarge {
                size: buf.len(),
                max: MAX_ADVERTISEMENT_LEN,
            });
        }
        Ok(buf)
    }
}

fn push_ad(buf: &mut Vec<u8>, ad_type: u8, data: &[u8]) {
    buf.push((data.len() + 1) as u8);
    buf.push(ad_type);
    buf.extend_from_slice(data);
}

/// Fields recovered from a received advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedAdvertisement {
    pub flags: Option<u8>,
    pub service_uuids: Vec<Uuid>,
    pub tx_power_level: Option<i8>,
    pub local_name: Option<String>,
}

impl ParsedAdvertisement {
    /// Decode AD structures. Returns `None` if a structure overruns the buffer.
    /// Unknown AD types are skipped; a zero length byte ends the payload.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let mut out = Self::default();
        let mut pos = 0usize;
        while pos < raw.len() {
            let len = raw[pos] as usize;
            if len == 0 {
                break;
            }
            if pos + 1 + len > raw.len() {
                return None;
            }
            let ad_type = raw[pos + 1];
            let data = &raw[pos + 2..pos + 1 + len];
            match ad_type {
                AD_TYPE_FLAGS => out.flags = data.first().copied(),
                AD_TYPE_INCOMPLETE_UUID128 | AD_TYPE_COMPLETE_UUID128 => {
                    if data.len() % 16 != 0 {
                        return None;
                    }
                    for chunk in data.chunks_exact(16) {
                        let mut bytes = [0u8; 16];
                        for (dst, src) in bytes.iter_mut().zip(chunk.iter().rev()) {
                            *dst = *src;
                        }
                        out.service_uuids.push(Uuid::from_bytes(bytes));
                    }
                }
                AD_TYPE_TX_POWER_LEVEL => out.tx_power_level = data.first().map(|b| *b as i8),
                AD_TYPE_COMPLETE_LOCAL_NAME => {
                    out.local_name = Some(String::from_utf8_lossy(data).into_owned());
                }
                _ => {}
            }
            pos += 1 + len;
        }
        Some(out)
    }

    pub fn advertises_service(&self, service: &Uuid) -> bool {
        self.service_uuids.contains(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::SERVICE_UUID;

    #[test]
    fn test_pusher_advertisement_fits_legacy_pdu() {
        let data = AdvertiseData::for_service(SERVICE_UUID);
        let raw = data.encode(&AdvertiseSettings::default()).unwrap();
        // flags (3) + uuid128 (18) + tx power (3)
        assert_eq!(raw.len(), 24);
        assert_eq!(&raw[..3], &[0x02, 0x01, 0x06]);
        assert_eq!(raw[3], 17);
        assert_eq!(raw[4], AD_TYPE_COMPLETE_UUID128);
        // Little-endian: last UUID byte first.
        assert_eq!(raw[5], 0x1b);
        assert_eq!(raw[20], 0xe9);
    }

    #[test]
    fn test_parse_recovers_fields() {
        let data = AdvertiseData::for_service(SERVICE_UUID);
        let settings = AdvertiseSettings {
            tx_power: TxPowerLevel::High,
            ..AdvertiseSettings::default()
        };
        let raw = data.encode(&settings).unwrap();
        let parsed = ParsedAdvertisement::parse(&raw).unwrap();

        assert_eq!(parsed.flags, Some(FLAGS_GENERAL_DISCOVERABLE));
        assert!(parsed.advertises_service(&SERVICE_UUID));
        assert_eq!(parsed.tx_power_level, Some(1));
        assert_eq!(parsed.local_name, None);
    }

    #[test]
    fn test_non_connectable_has_no_flags() {
        let data = AdvertiseData::for_service(SERVICE_UUID);
        let settings = AdvertiseSettings {
            connectable: false,
            ..AdvertiseSettings::default()
        };
        let raw = data.encode(&settings).unwrap();
        let parsed = ParsedAdvertisement::parse(&raw).unwrap();
        assert_eq!(parsed.flags, None);
    }

    #[test]
    fn test_oversize_advertisement_rejected() {
        // Flags (3) + two 128-bit UUIDs (2 + 32).
        let mut data = AdvertiseData {
            service_uuids: vec![SERVICE_UUID, Uuid::nil()],
            ..AdvertiseData::default()
        };
        let result = data.encode(&AdvertiseSettings::default());
        assert!(matches!(
            result,
            Err(BleError::AdvertisementTooLarge { size: 37, max: 31 })
        ));

        // TX power adds another 3.
        data.include_tx_power_level = true;
        let result = data.encode(&AdvertiseSettings::default());
        assert!(matches!(
            result,
            Err(BleError::AdvertisementTooLarge { size: 40, max: 31 })
        ));

        // Nothing is silently dropped: once one UUID goes, the other parses back whole.
        data.service_uuids.pop();
        let raw = data.encode(&AdvertiseSettings::default()).unwrap();
        assert_eq!(raw.len(), 24);
        let parsed = ParsedAdvertisement::parse(&raw).unwrap();
        assert_eq!(parsed.service_uuids, vec![SERVICE_UUID]);
        assert!(!parsed.advertises_service(&Uuid::nil()));
    }

    #[test]
    fn test_device_name_only_when_requested() {
        let mut data = AdvertiseData::for_service(SERVICE_UUID);
        data.device_name = Some("push".into());
        let raw = data.encode(&AdvertiseSettings::default()).unwrap();
        assert_eq!(ParsedAdvertisement::parse(&raw).unwrap().local_name, None);

        data.include_device_name = true;
        let raw = data.encode(&AdvertiseSettings::default()).unwrap();
        assert_eq!(
            ParsedAdvertisement::parse(&raw).unwrap().local_name.as_deref(),
            Some("push")
        );
    }

    #[test]
    fn test_truncated_structure_rejected() {
        assert!(ParsedAdvertisement::parse(&[0x05, 0x01, 0x06]).is_none());
        assert!(ParsedAdvertisement::parse(&[0x03, 0x07, 0xAA, 0xBB]).is_none());
    }
}
