use std::fmt;
use std::time::Instant;
use time::OffsetDateTime;

use crate::protocol::frame::Opcode;

/// Hardware address of a sensor, normalised to upper case (`A4:C1:38:86:6B:E0`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RadioAddress(String);

impl RadioAddress {
    pub fn new(address: &str) -> Self {
        RadioAddress(address.trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RadioAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Telemetry decoded from a single advertisement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdvertisementSample {
    pub temperature: f32,
    pub humidity: f32,
    pub battery: i16,
}

impl fmt::Display for AdvertisementSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "temp={:.1}°C humidity={:.1}% battery={}%",
            self.temperature, self.humidity, self.battery
        )
    }
}

/// Version strings reported by a device over the control characteristic
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceMetadata {
    pub hardware: Option<String>,
    pub firmware: Option<String>,
    pub secondary_firmware: Option<String>,
}

impl DeviceMetadata {
    pub fn apply(&mut self, field: MetadataField) {
        match field {
            MetadataField::Hardware(v) => self.hardware = Some(v),
            MetadataField::Firmware(v) => self.firmware = Some(v),
            MetadataField::SecondaryFirmware(v) => self.secondary_firmware = Some(v),
        }
    }
}

impl fmt::Display for DeviceMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "?".to_string());
        write!(
            f,
            "hardware={} firmware={}",
            show(&self.hardware),
            show(&self.firmware)
        )?;
        if let Some(secondary) = &self.secondary_firmware {
            write!(f, " aa20={}", secondary)?;
        }
        Ok(())
    }
}

/// One field update decoded from a control-characteristic response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataField {
    Hardware(String),
    Firmware(String),
    SecondaryFirmware(String),
}

/// A request written to the device that has not been answered yet
#[derive(Debug, Clone, Copy)]
pub struct PendingRequest {
    pub opcode: Opcode,
    pub issued_at: Instant,
}

/// Inclusive range of minute indices requested from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadWindow {
    pub from_index: u32,
    pub to_index: u32,
}

impl DownloadWindow {
    /// Command type carried in the first two bytes of a download request
    const COMMAND_TYPE: i16 = 0;

    /// Build the 10-byte download request: `i16 command, u32 from, u32 to`, little-endian
    pub fn encode_request(&self) -> [u8; 10] {
        let mut packet = [0u8; 10];
        packet[0..2].copy_from_slice(&Self::COMMAND_TYPE.to_le_bytes());
        packet[2..6].copy_from_slice(&self.from_index.to_le_bytes());
        packet[6..10].copy_from_slice(&self.to_index.to_le_bytes());
        packet
    }

    /// Number of minutes covered by the window
    pub fn minutes(&self) -> u64 {
        u64::from(self.to_index.saturating_sub(self.from_index)) + 1
    }

    pub fn contains(&self, minute_index: i64) -> bool {
        minute_index >= i64::from(self.from_index) && minute_index <= i64::from(self.to_index)
    }
}

impl fmt::Display for DownloadWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.from_index, self.to_index)
    }
}

/// A reconstructed history sample
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub minute_index: i64,
    pub timestamp: OffsetDateTime,
    pub temperature: f32,
    pub humidity: f32,
}

/// Progress of a bulk download as reported on the status characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Accepted,
    InProgress,
    Finished,
    Rejected,
    Unknown(i8),
}

impl DownloadStatus {
    pub fn from_code(code: i8) -> Self {
        match code {
            0 => DownloadStatus::Accepted,
            1 => DownloadStatus::Rejected,
            2 => DownloadStatus::Finished,
            other => DownloadStatus::Unknown(other),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Finished | DownloadStatus::Rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_is_normalised() {
        assert_eq!(RadioAddress::new(" a4:c1:38:86:6b:e0").as_str(), "A4:C1:38:86:6B:E0");
    }

    #[test]
    fn download_request_layout() {
        let window = DownloadWindow {
            from_index: 27365606,
            to_index: 27366342,
        };
        assert_eq!(
            window.encode_request(),
            [0x00, 0x00, 0xE6, 0x90, 0xA1, 0x01, 0xC6, 0x93, 0xA1, 0x01]
        );
        assert_eq!(window.minutes(), 737);
    }

    #[test]
    fn status_codes() {
        assert_eq!(DownloadStatus::from_code(0), DownloadStatus::Accepted);
        assert_eq!(DownloadStatus::from_code(1), DownloadStatus::Rejected);
        assert_eq!(DownloadStatus::from_code(2), DownloadStatus::Finished);
        assert_eq!(DownloadStatus::from_code(7), DownloadStatus::Unknown(7));
        assert!(!DownloadStatus::Accepted.is_terminal());
        assert!(!DownloadStatus::Unknown(-3).is_terminal());
        assert!(DownloadStatus::Rejected.is_terminal());
    }

    #[test]
    fn metadata_fields_apply() {
        let mut meta = DeviceMetadata::default();
        meta.apply(MetadataField::Hardware("1.00.01".into()));
        meta.apply(MetadataField::Firmware("1.02.03".into()));
        assert_eq!(meta.hardware.as_deref(), Some("1.00.01"));
        assert_eq!(meta.to_string(), "hardware=1.00.01 firmware=1.02.03");
    }
}
