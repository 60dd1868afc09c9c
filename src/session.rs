//! Per-device state machine for metadata queries and history download.
//!
//! A session drives one sensor over a [`Transport`]: it connects, writes
//! requests, and waits on notification channels until either a settle timer
//! expires (metadata) or the device reports a terminal download status. The
//! connection is always released before a method returns.
use log::{debug, info, warn};
use std::time::Instant;
use tokio::time::{sleep, sleep_until, timeout, Duration};

use crate::bluetooth::transport::{
    Connection, Notifications, Transport, CONTROL_CHARACTERISTIC, DOWNLOAD_DATA_CHARACTERISTIC,
    DOWNLOAD_REQUEST_CHARACTERISTIC,
};
use crate::error::{SessionError, TransportError};
use crate::models::{
    DeviceMetadata, DownloadStatus, DownloadWindow, HistoryRecord, PendingRequest, RadioAddress,
};
use crate::protocol::{frame, DeviceModel, HistoryReassembler};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Discovered,
    MetadataQuerying,
    MetadataComplete,
    Downloading,
    DownloadComplete,
    DownloadFailed,
}

pub struct DeviceSession {
    address: RadioAddress,
    model: DeviceModel,
    state: SessionState,
    connect_timeout: Duration,
    metadata: DeviceMetadata,
    pending: Vec<PendingRequest>,
    download_status: Option<DownloadStatus>,
}

impl DeviceSession {
    pub fn new(address: RadioAddress, model: DeviceModel) -> Self {
        DeviceSession {
            address,
            model,
            state: SessionState::Discovered,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            metadata: DeviceMetadata::default(),
            pending: Vec::new(),
            download_status: None,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn model(&self) -> DeviceModel {
        self.model
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn metadata(&self) -> &DeviceMetadata {
        &self.metadata
    }

    pub fn pending(&self) -> &[PendingRequest] {
        &self.pending
    }

    /// Last status reported on the download status characteristic
    pub fn download_status(&self) -> Option<DownloadStatus> {
        self.download_status
    }

    async fn connect<T: Transport>(&self, transport: &T) -> Result<T::Connection, TransportError> {
        let mut connection = transport.device(&self.address)?;
        let linked = match timeout(self.connect_timeout, connection.connect()).await {
            Ok(linked) => linked,
            Err(_) => Err(TransportError::ConnectTimeout(self.connect_timeout)),
        };

        // The link may be up even though resolving the services failed
        if let Err(e) = linked {
            if let Err(e) = connection.disconnect().await {
                debug!("{}: disconnect after failed connect: {}", self.address, e);
            }
            return Err(e);
        }
        Ok(connection)
    }

    /// Ask the device for its hardware and firmware versions
    ///
    /// Writes the model's query opcodes to the control characteristic and
    /// collects responses until the model's settle interval has passed.
    /// Malformed responses are logged and skipped.
    pub async fn query_metadata<T: Transport>(
        &mut self,
        transport: &T,
    ) -> Result<&DeviceMetadata, SessionError> {
        self.state = SessionState::MetadataQuerying;
        info!("{} {}: querying metadata", self.model, self.address);

        let mut connection = self.connect(transport).await?;
        let result = self.metadata_exchange(&mut connection).await;
        if let Err(e) = connection.disconnect().await {
            warn!("{}: disconnect failed: {}", self.address, e);
        }
        result?;

        for request in self.pending.drain(..) {
            warn!(
                "{}: no response to {} after {:?}",
                self.address,
                request.opcode,
                request.issued_at.elapsed()
            );
        }

        self.state = SessionState::MetadataComplete;
        Ok(&self.metadata)
    }

    async fn metadata_exchange<C: Connection>(
        &mut self,
        connection: &mut C,
    ) -> Result<(), SessionError> {
        let mut responses = connection.subscribe(CONTROL_CHARACTERISTIC).await?;

        let exchange = self.write_queries(connection, &mut responses).await;
        if let Err(e) = connection.unsubscribe(CONTROL_CHARACTERISTIC).await {
            warn!("{}: unsubscribe failed: {}", self.address, e);
        }
        exchange
    }

    async fn write_queries<C: Connection>(
        &mut self,
        connection: &mut C,
        responses: &mut Notifications,
    ) -> Result<(), SessionError> {
        for (i, &opcode) in self.model.metadata_opcodes().iter().enumerate() {
            if i > 0 && !self.model.write_gap().is_zero() {
                sleep(self.model.write_gap()).await;
            }
            let request = frame::encode(opcode, &[])?;
            debug!("{}: > {}", self.address, opcode);
            connection.write(CONTROL_CHARACTERISTIC, &request).await?;
            self.pending.push(PendingRequest {
                opcode,
                issued_at: Instant::now(),
            });
        }

        let deadline = tokio::time::Instant::now() + self.model.settle_interval();
        loop {
            tokio::select! {
                notification = responses.recv() => match notification {
                    Some(data) => self.handle_control_notification(&data),
                    None => break,
                },
                _ = sleep_until(deadline) => break,
            }
        }
        Ok(())
    }

    /// Decode one control-characteristic notification into the metadata
    pub fn handle_control_notification(&mut self, data: &[u8]) {
        debug!("{}: < {:02X?}", self.address, data);
        let content = match frame::decode(data) {
            Ok(content) => content,
            Err(e) => {
                warn!("{}: discarding response: {}", self.address, e);
                return;
            }
        };

        let opcode = frame::Opcode::of(&content);
        if let Some(at) = self.pending.iter().position(|p| p.opcode == opcode) {
            let request = self.pending.remove(at);
            debug!(
                "{}: {} answered in {:?}",
                self.address,
                opcode,
                request.issued_at.elapsed()
            );
        }

        if let Some(field) = self.model.decode_response(&content) {
            self.metadata.apply(field);
        }
    }

    /// Download the stored history for `window`
    ///
    /// Blocks until the device reports the download finished or rejected.
    /// Without `wait_limit` a device that never reports a terminal status
    /// stalls the caller.
    ///
    /// # Arguments
    /// * `transport` - Transport used to reach the device
    /// * `window` - Inclusive minute-index range to request
    /// * `wait_limit` - Optional bound on the wait for a terminal status
    ///
    /// # Returns
    /// The reconstructed records in increasing minute order
    pub async fn download_history<T: Transport>(
        &mut self,
        transport: &T,
        window: DownloadWindow,
        wait_limit: Option<Duration>,
    ) -> Result<Vec<HistoryRecord>, SessionError> {
        if !self.model.supports_download() {
            return Err(SessionError::DownloadUnsupported(self.model));
        }
        self.state = SessionState::Downloading;
        self.download_status = None;

        let outcome = self.run_download(transport, window, wait_limit).await;
        self.state = match outcome {
            Ok(_) => SessionState::DownloadComplete,
            Err(_) => SessionState::DownloadFailed,
        };
        outcome
    }

    async fn run_download<T: Transport>(
        &mut self,
        transport: &T,
        window: DownloadWindow,
        wait_limit: Option<Duration>,
    ) -> Result<Vec<HistoryRecord>, SessionError> {
        let mut connection = self.connect(transport).await?;
        info!("{} {}: connected for download", self.model, self.address);

        let mut reassembler = HistoryReassembler::new();
        let result = self
            .download_exchange(&mut connection, window, wait_limit, &mut reassembler)
            .await;
        if let Err(e) = connection.disconnect().await {
            warn!("{}: disconnect failed: {}", self.address, e);
        }
        result?;

        if reassembler.overwritten() > 0 {
            warn!(
                "{}: {} minutes were delivered more than once",
                self.address,
                reassembler.overwritten()
            );
        }
        info!(
            "{}: download finished, {} packets, {} records",
            self.address,
            reassembler.packets(),
            reassembler.len()
        );
        Ok(reassembler.into_records())
    }

    async fn download_exchange<C: Connection>(
        &mut self,
        connection: &mut C,
        window: DownloadWindow,
        wait_limit: Option<Duration>,
        reassembler: &mut HistoryReassembler,
    ) -> Result<(), SessionError> {
        let mut bulk = connection.subscribe(DOWNLOAD_DATA_CHARACTERISTIC).await?;
        let mut status = match connection.subscribe(DOWNLOAD_REQUEST_CHARACTERISTIC).await {
            Ok(status) => status,
            Err(e) => {
                let _ = connection.unsubscribe(DOWNLOAD_DATA_CHARACTERISTIC).await;
                return Err(e.into());
            }
        };

        let result = self
            .request_and_wait(connection, window, wait_limit, &mut status, &mut bulk, reassembler)
            .await;

        for characteristic in [DOWNLOAD_REQUEST_CHARACTERISTIC, DOWNLOAD_DATA_CHARACTERISTIC] {
            if let Err(e) = connection.unsubscribe(characteristic).await {
                warn!("{}: unsubscribe failed: {}", self.address, e);
            }
        }
        result
    }

    async fn request_and_wait<C: Connection>(
        &mut self,
        connection: &mut C,
        window: DownloadWindow,
        wait_limit: Option<Duration>,
        status: &mut Notifications,
        bulk: &mut Notifications,
        reassembler: &mut HistoryReassembler,
    ) -> Result<(), SessionError> {
        connection
            .write(DOWNLOAD_REQUEST_CHARACTERISTIC, &window.encode_request())
            .await?;
        info!("{}: waiting for bulk data {}", self.address, window);

        // Without a limit, or with one too far out to represent, the deadline never fires
        let limit = wait_limit.unwrap_or(Duration::MAX);
        let deadline = wait_limit
            .and_then(|limit| tokio::time::Instant::now().checked_add(limit));
        let expired = async {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expired);

        loop {
            tokio::select! {
                packet = bulk.recv() => match packet {
                    Some(packet) => self.handle_bulk_packet(reassembler, &packet),
                    None => return Err(SessionError::NotificationsClosed),
                },
                update = status.recv() => {
                    let Some(update) = update else {
                        return Err(SessionError::NotificationsClosed);
                    };
                    let Some(code) = self.handle_status_notification(&update) else {
                        continue;
                    };
                    if code.is_terminal() {
                        // Packets may still be queued behind the status notification
                        while let Ok(packet) = bulk.try_recv() {
                            self.handle_bulk_packet(reassembler, &packet);
                        }
                        return match code {
                            DownloadStatus::Rejected => Err(SessionError::DownloadRejected(window)),
                            _ => Ok(()),
                        };
                    }
                },
                _ = &mut expired => return Err(SessionError::DownloadTimedOut(limit)),
            }
        }
    }

    fn handle_bulk_packet(&mut self, reassembler: &mut HistoryReassembler, packet: &[u8]) {
        if self.download_status == Some(DownloadStatus::Accepted) {
            self.download_status = Some(DownloadStatus::InProgress);
        }
        if let Err(e) = reassembler.push(packet) {
            warn!("{}: discarding history packet: {}", self.address, e);
        }
    }

    /// Interpret a download status notification
    ///
    /// Returns None for payloads that are not a single status byte.
    pub fn handle_status_notification(&mut self, data: &[u8]) -> Option<DownloadStatus> {
        let code = match data {
            [code] => *code as i8,
            _ => {
                warn!(
                    "{}: download status must be 1 byte, got {}",
                    self.address,
                    data.len()
                );
                return None;
            }
        };

        let status = DownloadStatus::from_code(code);
        match status {
            DownloadStatus::Accepted => info!("{}: download accepted", self.address),
            DownloadStatus::Finished => info!("{}: download finished", self.address),
            DownloadStatus::Rejected => warn!(
                "{}: download request failed (lower bound too low?)",
                self.address
            ),
            DownloadStatus::Unknown(code) => {
                warn!("{}: unknown download status {}", self.address, code)
            }
            DownloadStatus::InProgress => {}
        }
        self.download_status = Some(status);
        Some(status)
    }
}
