//! Address-keyed registry of classified sensors.
//!
//! Only the discovery handler mutates the registry. Each advertisement is
//! matched by address first, since later advertisements may omit the name,
//! and only unknown addresses go through model classification.
use std::collections::{HashMap, HashSet};

use crate::models::{AdvertisementSample, RadioAddress};
use crate::protocol::{DecodeError, DeviceModel};

#[derive(Debug, Clone)]
pub struct KnownDevice {
    pub model: DeviceModel,
    pub alias: Option<String>,
    pub latest: Option<AdvertisementSample>,
    pub advertisements: usize,
    distinct_payloads: HashSet<Vec<u8>>,
}

impl KnownDevice {
    /// Number of different raw payloads seen from this device
    pub fn distinct_payloads(&self) -> usize {
        self.distinct_payloads.len()
    }
}

/// Result of feeding one advertisement to the registry
#[derive(Debug)]
pub struct Sighting {
    pub model: DeviceModel,
    /// True the first time this address is classified
    pub first_seen: bool,
    pub sample: Result<Option<AdvertisementSample>, DecodeError>,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<RadioAddress, KnownDevice>,
    aliases: HashMap<RadioAddress, String>,
}

impl DeviceRegistry {
    /// Create a registry; a non-empty alias map restricts it to those addresses
    pub fn new(aliases: HashMap<RadioAddress, String>) -> Self {
        DeviceRegistry {
            devices: HashMap::new(),
            aliases,
        }
    }

    /// Classify and decode one advertisement
    ///
    /// # Arguments
    /// * `address` - Address the advertisement came from
    /// * `name` - Advertised local name, if present in this event
    /// * `manufacturer_data` - Manufacturer data keyed by company id
    ///
    /// # Returns
    /// None if the device is not a supported sensor (or not on the allow-list)
    pub fn observe(
        &mut self,
        address: &RadioAddress,
        name: Option<&str>,
        manufacturer_data: &HashMap<u16, Vec<u8>>,
    ) -> Option<Sighting> {
        let first_seen = !self.devices.contains_key(address);
        if first_seen {
            if !self.aliases.is_empty() && !self.aliases.contains_key(address) {
                return None;
            }
            let model = DeviceModel::classify(name)?;
            self.devices.insert(
                address.clone(),
                KnownDevice {
                    model,
                    alias: self.aliases.get(address).cloned(),
                    latest: None,
                    advertisements: 0,
                    distinct_payloads: HashSet::new(),
                },
            );
        }

        let device = self.devices.get_mut(address)?;
        device.advertisements += 1;
        device
            .distinct_payloads
            .extend(manufacturer_data.values().cloned());

        let sample = device.model.decode_advertisement(manufacturer_data);
        if let Ok(Some(latest)) = &sample {
            device.latest = Some(*latest);
        }

        Some(Sighting {
            model: device.model,
            first_seen,
            sample,
        })
    }

    pub fn get(&self, address: &RadioAddress) -> Option<&KnownDevice> {
        self.devices.get(address)
    }

    /// Display label: alias if configured, otherwise model and address
    pub fn label(&self, address: &RadioAddress) -> String {
        match self.devices.get(address) {
            Some(KnownDevice {
                alias: Some(alias), ..
            }) => format!("{} ({})", alias, address),
            Some(device) => format!("{} {}", device.model, address),
            None => address.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RadioAddress, &KnownDevice)> {
        self.devices.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h5179_data() -> HashMap<u16, Vec<u8>> {
        HashMap::from([(34817, b"\xec\x00\x01\x01\xea\x06\xd6\x15X".to_vec())])
    }

    #[test]
    fn classifies_new_devices_once() {
        let mut registry = DeviceRegistry::default();
        let address = RadioAddress::new("E3:32:80:C1:E0:E2");

        let sighting = registry
            .observe(&address, Some("Govee_H5179_E0E2"), &h5179_data())
            .unwrap();
        assert!(sighting.first_seen);
        assert_eq!(sighting.model, DeviceModel::H5179);
        assert_eq!(sighting.sample.unwrap().unwrap().battery, 88);

        // Later advertisements without a name still match by address
        let sighting = registry.observe(&address, None, &h5179_data()).unwrap();
        assert!(!sighting.first_seen);

        let device = registry.get(&address).unwrap();
        assert_eq!(device.advertisements, 2);
        assert_eq!(device.distinct_payloads(), 1);
        assert_eq!(device.latest.unwrap().temperature, 17.7);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn ignores_unsupported_devices() {
        let mut registry = DeviceRegistry::default();
        let address = RadioAddress::new("00:11:22:33:44:55");
        assert!(registry
            .observe(&address, Some("LYWSD03MMC"), &HashMap::new())
            .is_none());
        assert!(registry.observe(&address, None, &HashMap::new()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn registers_device_even_if_payload_is_bad() {
        let mut registry = DeviceRegistry::default();
        let address = RadioAddress::new("A4:C1:38:86:6B:E0");
        let data = HashMap::from([(1, b"\x09\x09\x02\xf7\xd6d".to_vec())]);

        let sighting = registry
            .observe(&address, Some("GVH5174_6BE0"), &data)
            .unwrap();
        assert!(sighting.first_seen);
        assert!(sighting.sample.is_err());
        assert!(registry.get(&address).unwrap().latest.is_none());
    }

    #[test]
    fn allow_list_restricts_and_names() {
        let allowed = RadioAddress::new("E3:32:80:C1:E0:E2");
        let mut registry =
            DeviceRegistry::new(HashMap::from([(allowed.clone(), "Greenhouse".to_string())]));

        let other = RadioAddress::new("E3:32:80:C1:00:01");
        assert!(registry
            .observe(&other, Some("Govee_H5179_0001"), &h5179_data())
            .is_none());
        assert!(registry
            .observe(&allowed, Some("Govee_H5179_E0E2"), &h5179_data())
            .is_some());

        assert_eq!(registry.label(&allowed), "Greenhouse (E3:32:80:C1:E0:E2)");
        assert_eq!(registry.label(&other), "E3:32:80:C1:00:01");
        assert_eq!(registry.iter().count(), 1);
    }
}
