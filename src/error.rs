//! Errors raised while talking to a device or loading configuration.
//!
//! Frame, advertisement and history decoding errors live next to their
//! decoders in [`crate::protocol`]; they are handled where they occur and
//! never abort a probe.
use bluer::Uuid;
use std::time::Duration;

use crate::models::{DownloadWindow, RadioAddress};
use crate::protocol::{DeviceModel, FrameError};

/// Failures of the Bluetooth transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] bluer::Error),

    #[error("connection not established within {0:?}")]
    ConnectTimeout(Duration),

    #[error("invalid device address {0}")]
    InvalidAddress(RadioAddress),

    #[error("characteristic {0} not found on device")]
    CharacteristicNotFound(Uuid),

    #[error("not subscribed to characteristic {0}")]
    NotSubscribed(Uuid),
}

/// Failures that abort the probe of a single device
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("could not build request frame: {0}")]
    Frame(#[from] FrameError),

    #[error("{0} does not support history download")]
    DownloadUnsupported(DeviceModel),

    #[error("download of {0} rejected by device (lower bound too low?)")]
    DownloadRejected(DownloadWindow),

    #[error("notification channel closed by the device")]
    NotificationsClosed,

    #[error("no terminal download status within {0:?}")]
    DownloadTimedOut(Duration),
}

/// Invalid or missing configuration, fatal before scanning starts
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} has invalid value '{value}'")]
    InvalidValue { name: &'static str, value: String },

    #[error("DOWNLOAD_FROM and DOWNLOAD_TO must be set together")]
    IncompleteWindow,

    #[error("download window {from}..={to} is empty")]
    EmptyWindow { from: u32, to: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = SessionError::DownloadRejected(DownloadWindow {
            from_index: 10,
            to_index: 20,
        });
        assert_eq!(
            e.to_string(),
            "download of 10..=20 rejected by device (lower bound too low?)"
        );

        let e = SessionError::from(TransportError::ConnectTimeout(Duration::from_secs(30)));
        assert_eq!(e.to_string(), "connection not established within 30s");

        let e = ConfigError::InvalidValue {
            name: "SCAN_DURATION_SECS",
            value: "ten".into(),
        };
        assert_eq!(e.to_string(), "SCAN_DURATION_SECS has invalid value 'ten'");
    }
}
