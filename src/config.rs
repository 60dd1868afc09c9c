use log::{debug, info};
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use time::OffsetDateTime;

use crate::error::ConfigError;
use crate::models::{DownloadWindow, RadioAddress};
use crate::utils::recent_window;

const DEFAULT_SCAN_DURATION_SECS: u64 = 10;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_HISTORY_MINUTES: u32 = 720; // 12 hours

/// Which minutes to request from devices that keep history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowSpec {
    /// Fixed minute-index range from DOWNLOAD_FROM / DOWNLOAD_TO
    Fixed(DownloadWindow),
    /// The most recent N minutes at the time of the download
    Recent(u32),
}

impl WindowSpec {
    pub fn resolve(&self, now: &OffsetDateTime) -> Option<DownloadWindow> {
        match self {
            WindowSpec::Fixed(window) => Some(*window),
            WindowSpec::Recent(minutes) => recent_window(now, *minutes),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub scan_duration: Duration,
    pub connect_timeout: Duration,
    pub download_history: bool,
    pub window: WindowSpec,
    pub download_timeout: Option<Duration>,
    /// Optional allow-list of device addresses with display names
    pub devices: HashMap<RadioAddress, String>,
}

impl LoggerConfig {
    pub fn new() -> Result<Self, ConfigError> {
        // Load environment variables
        dotenv::dotenv().ok();

        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let scan_duration = Duration::from_secs(
            parse_var(&lookup, "SCAN_DURATION_SECS")?.unwrap_or(DEFAULT_SCAN_DURATION_SECS),
        );
        let connect_timeout = Duration::from_secs(
            parse_var(&lookup, "CONNECT_TIMEOUT_SECS")?.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        );
        let download_timeout =
            parse_var::<u64, _>(&lookup, "DOWNLOAD_TIMEOUT_SECS")?.map(Duration::from_secs);
        let download_history = parse_var(&lookup, "DOWNLOAD_HISTORY")?.unwrap_or(true);

        let from = parse_var::<u32, _>(&lookup, "DOWNLOAD_FROM")?;
        let to = parse_var::<u32, _>(&lookup, "DOWNLOAD_TO")?;
        let window = match (from, to) {
            (Some(from), Some(to)) if from > to => {
                return Err(ConfigError::EmptyWindow { from, to });
            }
            (Some(from_index), Some(to_index)) => WindowSpec::Fixed(DownloadWindow {
                from_index,
                to_index,
            }),
            (None, None) => {
                let minutes =
                    parse_var(&lookup, "HISTORY_MINUTES")?.unwrap_or(DEFAULT_HISTORY_MINUTES);
                if minutes == 0 {
                    return Err(ConfigError::InvalidValue {
                        name: "HISTORY_MINUTES",
                        value: "0".into(),
                    });
                }
                WindowSpec::Recent(minutes)
            }
            _ => return Err(ConfigError::IncompleteWindow),
        };

        let mut devices = HashMap::new();

        // Same MAC=name,MAC=name format as the device list of our other loggers
        if let Some(list) = lookup("GOVEE_DEVICES") {
            debug!("Found GOVEE_DEVICES: '{}'", list);
            for pair in list.split(',') {
                let pair = pair.trim();
                if pair.is_empty() {
                    continue;
                }
                match pair.split_once('=') {
                    Some((mac, name)) if !mac.trim().is_empty() && !name.trim().is_empty() => {
                        devices.insert(RadioAddress::new(mac), name.trim().to_string());
                    }
                    _ => {
                        return Err(ConfigError::InvalidValue {
                            name: "GOVEE_DEVICES",
                            value: pair.to_string(),
                        })
                    }
                }
            }
        }

        if devices.is_empty() {
            info!("No GOVEE_DEVICES configured, accepting every supported sensor");
        } else {
            for (mac, name) in &devices {
                info!("Device: {} -> {}", mac, name);
            }
        }

        Ok(LoggerConfig {
            scan_duration,
            connect_timeout,
            download_history,
            window,
            download_timeout,
            devices,
        })
    }
}

fn parse_var<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value }),
    }
}
