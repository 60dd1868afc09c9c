/// Govee sensor models: classification and payload layouts
use log::warn;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::models::{AdvertisementSample, MetadataField};
use crate::protocol::frame::{self, FrameContent, Opcode};

// Manufacturer ids the sensors advertise under
const H5174_MANUFACTURER_ID: u16 = 0x0001;
const H5179_MANUFACTURER_ID: u16 = 0x8801; // 34817

// Fixed prefixes of the advertisement payloads
const H5174_MARKER: [u8; 2] = [0x01, 0x01];
const H5179_MARKER: [u8; 4] = [0xEC, 0x00, 0x01, 0x01];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("{model} advertisement has unexpected marker {found:02X?}")]
    UnexpectedMarker { model: DeviceModel, found: Vec<u8> },

    #[error("{model} advertisement too short: {len} bytes, need {needed}")]
    TooShort {
        model: DeviceModel,
        len: usize,
        needed: usize,
    },

    #[error("{model} advertisement has {extra} unexpected trailing bytes")]
    TrailingBytes { model: DeviceModel, extra: usize },
}

/// The sensor models this logger understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceModel {
    /// Bluetooth-only thermo-hygrometer
    H5174,
    /// WiFi + Bluetooth thermo-hygrometer with on-device history
    H5179,
}

impl DeviceModel {
    /// Every supported model, in classification order
    pub const ALL: [DeviceModel; 2] = [DeviceModel::H5174, DeviceModel::H5179];

    /// Prefix of the advertised local name
    pub fn name_prefix(&self) -> &'static str {
        match self {
            DeviceModel::H5174 => "GVH5174_",
            DeviceModel::H5179 => "Govee_H5179_",
        }
    }

    pub fn accepts(&self, name: &str) -> bool {
        name.starts_with(self.name_prefix())
    }

    /// Pick the model whose name prefix matches, if any
    pub fn classify(name: Option<&str>) -> Option<DeviceModel> {
        let name = name?;
        Self::ALL.into_iter().find(|model| model.accepts(name))
    }

    pub fn supports_download(&self) -> bool {
        matches!(self, DeviceModel::H5179)
    }

    /// Opcodes written to the control characteristic during a metadata query
    pub fn metadata_opcodes(&self) -> &'static [Opcode] {
        match self {
            DeviceModel::H5174 => &[Opcode::HARDWARE_VERSION, Opcode::FIRMWARE_VERSION],
            DeviceModel::H5179 => &[
                Opcode::SECONDARY_FIRMWARE,
                Opcode::HARDWARE_VERSION,
                Opcode::FIRMWARE_VERSION,
            ],
        }
    }

    /// Pause between consecutive metadata writes
    pub fn write_gap(&self) -> Duration {
        match self {
            DeviceModel::H5174 => Duration::from_millis(100),
            DeviceModel::H5179 => Duration::ZERO,
        }
    }

    /// How long to listen for responses after the last metadata write
    pub fn settle_interval(&self) -> Duration {
        match self {
            DeviceModel::H5174 => Duration::from_secs(2),
            DeviceModel::H5179 => Duration::from_millis(500),
        }
    }

    /// Decode the model's manufacturer data into a sample
    ///
    /// Returns `Ok(None)` when the advertisement carries no payload for this
    /// model's manufacturer id; some advertisement cycles only carry the
    /// iBeacon block.
    ///
    /// # Arguments
    /// * `manufacturer_data` - Manufacturer data keyed by company id
    ///
    /// # Returns
    /// The decoded sample, or an error if the payload layout is not recognised
    pub fn decode_advertisement(
        &self,
        manufacturer_data: &HashMap<u16, Vec<u8>>,
    ) -> Result<Option<AdvertisementSample>, DecodeError> {
        match self {
            DeviceModel::H5174 => manufacturer_data
                .get(&H5174_MANUFACTURER_ID)
                .map(|data| self.decode_h5174(data))
                .transpose(),
            DeviceModel::H5179 => manufacturer_data
                .get(&H5179_MANUFACTURER_ID)
                .map(|data| self.decode_h5179(data))
                .transpose(),
        }
    }

    fn check_layout(&self, data: &[u8], marker: &[u8], needed: usize) -> Result<(), DecodeError> {
        if data.len() < needed {
            return Err(DecodeError::TooShort {
                model: *self,
                len: data.len(),
                needed,
            });
        }
        if &data[..marker.len()] != marker {
            return Err(DecodeError::UnexpectedMarker {
                model: *self,
                found: data[..marker.len()].to_vec(),
            });
        }
        Ok(())
    }

    // 01 01 | 24-bit BE: temperature*10000 + humidity*10 | battery
    fn decode_h5174(&self, data: &[u8]) -> Result<AdvertisementSample, DecodeError> {
        self.check_layout(data, &H5174_MARKER, 6)?;

        let ds = u32::from_be_bytes([0, data[2], data[3], data[4]]);
        Ok(AdvertisementSample {
            temperature: (ds / 1000) as f32 / 10.0,
            humidity: (ds % 1000) as f32 / 10.0,
            battery: i16::from(data[5]),
        })
    }

    // EC 00 01 01 | i16 LE temp*100 | i16 LE humidity*100 | i8 battery
    fn decode_h5179(&self, data: &[u8]) -> Result<AdvertisementSample, DecodeError> {
        self.check_layout(data, &H5179_MARKER, 9)?;
        if data.len() > 9 {
            return Err(DecodeError::TrailingBytes {
                model: *self,
                extra: data.len() - 9,
            });
        }

        let temperature = i16::from_le_bytes([data[4], data[5]]);
        let humidity = i16::from_le_bytes([data[6], data[7]]);
        Ok(AdvertisementSample {
            temperature: f32::from(temperature) / 100.0,
            humidity: f32::from(humidity) / 100.0,
            battery: i16::from(data[8] as i8),
        })
    }

    /// Map a decoded control-characteristic response onto a metadata field
    pub fn decode_response(&self, content: &FrameContent) -> Option<MetadataField> {
        let opcode = Opcode::of(content);
        let text = || frame::strip_trailing_nulls(frame::value(content));

        match opcode {
            Opcode::HARDWARE_VERSION => Some(MetadataField::Hardware(text())),
            Opcode::FIRMWARE_VERSION => Some(MetadataField::Firmware(text())),
            Opcode::SECONDARY_FIRMWARE if *self == DeviceModel::H5179 => {
                Some(MetadataField::SecondaryFirmware(text()))
            }
            _ => {
                warn!("{}: unknown response opcode {}", self, opcode);
                None
            }
        }
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceModel::H5174 => write!(f, "Govee H5174"),
            DeviceModel::H5179 => write!(f, "Govee H5179"),
        }
    }
}
