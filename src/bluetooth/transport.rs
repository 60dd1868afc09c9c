//! The contract a device session needs from the Bluetooth stack.
//!
//! Notifications are delivered through a per-subscription channel so a
//! session can `select!` over them alongside its own timers.
use bluer::Uuid;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::models::RadioAddress;

/// Control characteristic carrying checksummed request/response frames
pub const CONTROL_CHARACTERISTIC: Uuid = Uuid::from_u128(0x494e5445_4c4c_495f_524f_434b535f2011);
/// Download request writes and download status notifications
pub const DOWNLOAD_REQUEST_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x494e5445_4c4c_495f_524f_434b535f2012);
/// Bulk history packets
pub const DOWNLOAD_DATA_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x494e5445_4c4c_495f_524f_434b535f2013);

/// Raw notification payloads of one characteristic, in arrival order
pub type Notifications = mpsc::UnboundedReceiver<Vec<u8>>;

/// Hands out connections to devices by address
pub trait Transport {
    type Connection: Connection;

    /// Handle for the device at `address`; nothing is sent over the air yet
    fn device(&self, address: &RadioAddress) -> Result<Self::Connection, TransportError>;
}

/// A connection to one device
///
/// `disconnect` must be safe to call after a failed or abandoned `connect`,
/// since the link may already be up when resolving the services fails.
pub trait Connection {
    /// Bring the link up and resolve the device's characteristics
    async fn connect(&mut self) -> Result<(), TransportError>;

    async fn subscribe(&mut self, characteristic: Uuid) -> Result<Notifications, TransportError>;

    async fn unsubscribe(&mut self, characteristic: Uuid) -> Result<(), TransportError>;

    async fn write(&mut self, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError>;

    async fn disconnect(self) -> Result<(), TransportError>;
}

#[cfg(test)]
pub mod mock {
    //! Scripted in-memory transport for session and dispatcher tests.
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Event {
        Connected(RadioAddress),
        Subscribed(Uuid),
        Unsubscribed(Uuid),
        Wrote(Uuid, Vec<u8>),
        Disconnected,
    }

    /// Notifications to emit when a given payload is written
    type Replies = HashMap<Vec<u8>, Vec<(Uuid, Vec<u8>)>>;

    #[derive(Default)]
    pub struct MockTransport {
        replies: Replies,
        refuse_connect: bool,
        resolve_delay: Option<Duration>,
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn refusing() -> Self {
            MockTransport {
                refuse_connect: true,
                ..Default::default()
            }
        }

        /// Bring the link up, then stall for `delay` before the services resolve
        pub fn slow_to_resolve(delay: Duration) -> Self {
            MockTransport {
                resolve_delay: Some(delay),
                ..Default::default()
            }
        }

        /// Reply to a write of `request` with `notifications`
        pub fn on_write(mut self, request: &[u8], notifications: Vec<(Uuid, Vec<u8>)>) -> Self {
            self.replies.insert(request.to_vec(), notifications);
            self
        }

        pub fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Transport for MockTransport {
        type Connection = MockConnection;

        fn device(&self, address: &RadioAddress) -> Result<MockConnection, TransportError> {
            Ok(MockConnection {
                address: address.clone(),
                refuse_connect: self.refuse_connect,
                resolve_delay: self.resolve_delay,
                replies: self.replies.clone(),
                subscriptions: HashMap::new(),
                events: self.events.clone(),
            })
        }
    }

    pub struct MockConnection {
        address: RadioAddress,
        refuse_connect: bool,
        resolve_delay: Option<Duration>,
        replies: Replies,
        subscriptions: HashMap<Uuid, mpsc::UnboundedSender<Vec<u8>>>,
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl Connection for MockConnection {
        async fn connect(&mut self) -> Result<(), TransportError> {
            if self.refuse_connect {
                return Err(TransportError::InvalidAddress(self.address.clone()));
            }
            self.events
                .lock()
                .unwrap()
                .push(Event::Connected(self.address.clone()));
            if let Some(delay) = self.resolve_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        }

        async fn subscribe(
            &mut self,
            characteristic: Uuid,
        ) -> Result<Notifications, TransportError> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.subscriptions.insert(characteristic, tx);
            self.events
                .lock()
                .unwrap()
                .push(Event::Subscribed(characteristic));
            Ok(rx)
        }

        async fn unsubscribe(&mut self, characteristic: Uuid) -> Result<(), TransportError> {
            self.subscriptions
                .remove(&characteristic)
                .ok_or(TransportError::NotSubscribed(characteristic))?;
            self.events
                .lock()
                .unwrap()
                .push(Event::Unsubscribed(characteristic));
            Ok(())
        }

        async fn write(&mut self, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError> {
            self.events
                .lock()
                .unwrap()
                .push(Event::Wrote(characteristic, data.to_vec()));
            for (target, payload) in self.replies.get(data).cloned().unwrap_or_default() {
                if let Some(tx) = self.subscriptions.get(&target) {
                    let _ = tx.send(payload);
                }
            }
            Ok(())
        }

        async fn disconnect(self) -> Result<(), TransportError> {
            self.events.lock().unwrap().push(Event::Disconnected);
            Ok(())
        }
    }
}
