/// Bluetooth Low Energy scanning for Govee sensors
use futures_util::stream::{LocalBoxStream, SelectAll};
use futures_util::{pin_mut, StreamExt};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use tokio::time::{sleep, Duration};

use bluer::{
    Adapter, AdapterEvent, Address, DeviceEvent, DeviceProperty, DiscoveryFilter,
    DiscoveryTransport,
};

use crate::dispatcher::{ProbeJob, WorkQueue};
use crate::models::RadioAddress;
use crate::registry::DeviceRegistry;

/// Open the default Bluetooth adapter and make sure it is powered on
pub async fn open_adapter() -> Result<Adapter, bluer::Error> {
    // Initialize Bluetooth session
    let session = match bluer::Session::new().await {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to create Bluetooth session: {}", e);
            return Err(e);
        }
    };

    // Get the default Bluetooth adapter
    let adapter = match session.default_adapter().await {
        Ok(adapter) => adapter,
        Err(e) => {
            error!("Failed to get default Bluetooth adapter: {}", e);
            return Err(e);
        }
    };

    // Ensure Bluetooth adapter is powered on
    if let Err(e) = adapter.set_powered(true).await {
        error!("Failed to power on adapter: {}", e);
        return Err(e);
    }

    info!("Using Bluetooth adapter {}", adapter.name());
    Ok(adapter)
}

/// Feed one advertisement to the registry and queue newly found sensors
///
/// # Arguments
/// * `registry` - Registry of classified devices
/// * `queue` - Work queue of the dispatcher
/// * `address` - Address the advertisement came from
/// * `name` - Advertised local name, if known
/// * `manufacturer_data` - Manufacturer data keyed by company id
pub fn handle_advertisement(
    registry: &mut DeviceRegistry,
    queue: &WorkQueue,
    address: &RadioAddress,
    name: Option<&str>,
    manufacturer_data: &HashMap<u16, Vec<u8>>,
) {
    let Some(sighting) = registry.observe(address, name, manufacturer_data) else {
        return;
    };
    let label = registry.label(address);

    if sighting.first_seen {
        info!("Found {}", label);
        queue.enqueue(ProbeJob {
            address: address.clone(),
            model: sighting.model,
            label: label.clone(),
        });
    }

    match sighting.sample {
        Ok(Some(sample)) => info!(" {} {}", label, sample),
        Ok(None) => debug!("No sensor payload from {}", label),
        Err(e) => warn!("Undecodable advertisement from {}: {}", label, e),
    }
}

// Read the current name and manufacturer data BlueZ holds for a device
async fn read_advertisement(
    adapter: &Adapter,
    addr: Address,
) -> Option<(Option<String>, HashMap<u16, Vec<u8>>)> {
    let device = adapter.device(addr).ok()?;
    let name = match device.name().await {
        Ok(name) => name,
        Err(e) => {
            debug!("Failed to get name for {}: {}", addr, e);
            None
        }
    };
    let manufacturer_data = match device.manufacturer_data().await {
        Ok(data) => data.unwrap_or_default(),
        Err(e) => {
            debug!("Failed to get manufacturer data for {}: {}", addr, e);
            HashMap::new()
        }
    };
    Some((name, manufacturer_data))
}

/// Scan for sensors, feeding every advertisement to the registry
///
/// Runs for `duration`, queueing each newly classified sensor for probing
/// and decoding every advertisement it sends while the scan lasts.
///
/// # Arguments
/// * `adapter` - Powered Bluetooth adapter
/// * `duration` - How long to scan
/// * `registry` - Registry of classified devices, updated in place
/// * `queue` - Work queue receiving newly found sensors
pub async fn scan_for_devices(
    adapter: &Adapter,
    duration: Duration,
    registry: &mut DeviceRegistry,
    queue: &WorkQueue,
) -> Result<(), bluer::Error> {
    // Report every advertisement, not only the first one per device
    let filter = DiscoveryFilter {
        transport: DiscoveryTransport::Le,
        duplicate_data: true,
        ..Default::default()
    };

    // Apply the discovery filter (warn if it fails, but continue)
    if let Err(e) = adapter.set_discovery_filter(filter).await {
        warn!("Failed to set discovery filter: {}", e);
    }

    let discovery = adapter.discover_devices().await?;
    pin_mut!(discovery);

    let mut changes: SelectAll<LocalBoxStream<'static, (Address, DeviceEvent)>> =
        SelectAll::new();

    let deadline = sleep(duration);
    pin_mut!(deadline);

    info!("Scanning for devices for {:?}", duration);
    loop {
        tokio::select! {
            event = discovery.next() => match event {
                Some(AdapterEvent::DeviceAdded(addr)) => {
                    if let Some((name, data)) = read_advertisement(adapter, addr).await {
                        handle_advertisement(
                            registry,
                            queue,
                            &RadioAddress::new(&addr.to_string()),
                            name.as_deref(),
                            &data,
                        );
                    }

                    // Names and payloads often arrive after the device is added
                    match adapter.device(addr) {
                        Ok(device) => match device.events().await {
                            Ok(events) => {
                                changes.push(events.map(move |e| (addr, e)).boxed_local())
                            }
                            Err(e) => debug!("No property events for {}: {}", addr, e),
                        },
                        Err(e) => debug!("Device {} vanished: {}", addr, e),
                    }
                }
                Some(AdapterEvent::DeviceRemoved(addr)) => debug!("Device removed: {}", addr),
                Some(event) => debug!("Discovery event: {:?}", event),
                None => break,
            },
            Some((addr, event)) = changes.next(), if !changes.is_empty() => {
                if let DeviceEvent::PropertyChanged(
                    DeviceProperty::Name(_) | DeviceProperty::ManufacturerData(_),
                ) = event
                {
                    if let Some((name, data)) = read_advertisement(adapter, addr).await {
                        handle_advertisement(
                            registry,
                            queue,
                            &RadioAddress::new(&addr.to_string()),
                            name.as_deref(),
                            &data,
                        );
                    }
                }
            }
            _ = &mut deadline => break,
        }
    }

    info!("Stopped scanning, discovered the following:");
    for (address, device) in registry.iter() {
        match device.latest {
            Some(sample) => info!(
                " {} {} ({} advertisements, {} distinct payloads, last {})",
                device.model,
                address,
                device.advertisements,
                device.distinct_payloads(),
                sample
            ),
            None => info!(
                " {} {} ({} advertisements, no decoded telemetry)",
                device.model, address, device.advertisements
            ),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{work_queue, WorkItem};
    use crate::protocol::DeviceModel;

    #[test]
    fn queues_each_sensor_once() {
        let (queue, mut dispatcher) = work_queue();
        let mut registry = DeviceRegistry::default();
        let address = RadioAddress::new("A4:C1:38:86:6B:E0");
        let data = HashMap::from([(1, b"\x01\x01\x02\xf7\xd6d".to_vec())]);

        handle_advertisement(&mut registry, &queue, &address, Some("GVH5174_6BE0"), &data);
        handle_advertisement(&mut registry, &queue, &address, None, &data);
        handle_advertisement(
            &mut registry,
            &queue,
            &RadioAddress::new("11:22:33:44:55:66"),
            Some("Speaker"),
            &HashMap::new(),
        );
        queue.finish();

        match dispatcher.try_next() {
            Some(WorkItem::Probe(job)) => {
                assert_eq!(job.address, address);
                assert_eq!(job.model, DeviceModel::H5174);
                assert_eq!(job.label, "Govee H5174 A4:C1:38:86:6B:E0");
            }
            other => panic!("expected a probe job, got {:?}", other),
        }
        assert!(matches!(dispatcher.try_next(), Some(WorkItem::Shutdown)));
        assert_eq!(registry.get(&address).unwrap().advertisements, 2);
    }
}
