/// GATT connections to sensors through BlueZ
use futures_util::StreamExt;
use log::{debug, warn};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, Address, Device, Uuid};

use crate::bluetooth::transport::{Connection, Notifications, Transport};
use crate::error::TransportError;
use crate::models::RadioAddress;

// How often to check whether BlueZ finished resolving the GATT services
const SERVICES_POLL_INTERVAL_MS: u64 = 100;

/// Transport backed by a local BlueZ adapter
#[derive(Clone)]
pub struct BluerTransport {
    adapter: Adapter,
}

impl BluerTransport {
    pub fn new(adapter: Adapter) -> Self {
        BluerTransport { adapter }
    }
}

impl Transport for BluerTransport {
    type Connection = BluerConnection;

    fn device(&self, address: &RadioAddress) -> Result<BluerConnection, TransportError> {
        let addr = Address::from_str(address.as_str())
            .map_err(|_| TransportError::InvalidAddress(address.clone()))?;
        Ok(BluerConnection {
            device: self.adapter.device(addr)?,
            characteristics: HashMap::new(),
            subscriptions: HashMap::new(),
        })
    }
}

pub struct BluerConnection {
    device: Device,
    characteristics: HashMap<Uuid, Characteristic>,
    subscriptions: HashMap<Uuid, JoinHandle<()>>,
}

impl BluerConnection {
    async fn resolve(&mut self) -> Result<(), TransportError> {
        // Characteristics are only listed once BlueZ has resolved the services
        while !self.device.is_services_resolved().await? {
            sleep(Duration::from_millis(SERVICES_POLL_INTERVAL_MS)).await;
        }

        for service in self.device.services().await? {
            for characteristic in service.characteristics().await? {
                self.characteristics
                    .insert(characteristic.uuid().await?, characteristic);
            }
        }
        Ok(())
    }

    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic, TransportError> {
        self.characteristics
            .get(&uuid)
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }
}

impl Connection for BluerConnection {
    /// Connect and resolve the device's characteristics
    ///
    /// Does not time out by itself; the session bounds it and disconnects
    /// when it fails or takes too long.
    async fn connect(&mut self) -> Result<(), TransportError> {
        if !self.device.is_connected().await? {
            self.device.connect().await?;
        }
        debug!("{}: connected, resolving services", self.device.address());

        self.resolve().await?;
        debug!(
            "{}: {} characteristics",
            self.device.address(),
            self.characteristics.len()
        );
        Ok(())
    }

    async fn subscribe(&mut self, uuid: Uuid) -> Result<Notifications, TransportError> {
        let stream = self.characteristic(uuid)?.notify().await?;
        let (tx, rx) = mpsc::unbounded_channel();

        // Forward notifications until unsubscribed; dropping the stream stops them
        let forwarder = tokio::spawn(async move {
            let mut stream = Box::pin(stream);
            while let Some(value) = stream.next().await {
                if tx.send(value).is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = self.subscriptions.insert(uuid, forwarder) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn unsubscribe(&mut self, uuid: Uuid) -> Result<(), TransportError> {
        let forwarder = self
            .subscriptions
            .remove(&uuid)
            .ok_or(TransportError::NotSubscribed(uuid))?;
        forwarder.abort();
        Ok(())
    }

    async fn write(&mut self, uuid: Uuid, data: &[u8]) -> Result<(), TransportError> {
        self.characteristic(uuid)?.write(data).await?;
        Ok(())
    }

    async fn disconnect(mut self) -> Result<(), TransportError> {
        for (uuid, forwarder) in self.subscriptions.drain() {
            warn!("{}: still subscribed at disconnect", uuid);
            forwarder.abort();
        }
        self.device.disconnect().await?;
        Ok(())
    }
}
