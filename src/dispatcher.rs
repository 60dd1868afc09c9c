//! Sequential probing of discovered devices.
//!
//! Discovery pushes jobs into a FIFO queue; a single consumer loop probes one
//! device at a time so only one connection is ever open. A failing probe is
//! logged and the loop moves on to the next device.
use log::{error, info, warn};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::bluetooth::transport::Transport;
use crate::config::{LoggerConfig, WindowSpec};
use crate::error::SessionError;
use crate::models::{DeviceMetadata, DownloadWindow, HistoryRecord, RadioAddress};
use crate::protocol::history::find_gaps;
use crate::protocol::DeviceModel;
use crate::session::{DeviceSession, SessionState};
use crate::utils::format_datetime;

/// A classified device waiting to be probed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeJob {
    pub address: RadioAddress,
    pub model: DeviceModel,
    pub label: String,
}

#[derive(Debug)]
pub enum WorkItem {
    Probe(ProbeJob),
    /// Discovery is over; stop once the queue is drained
    Shutdown,
}

/// Producer side of the work queue
#[derive(Debug, Clone)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<WorkItem>,
}

impl WorkQueue {
    pub fn enqueue(&self, job: ProbeJob) {
        if self.tx.send(WorkItem::Probe(job)).is_err() {
            warn!("dispatcher stopped, dropping probe job");
        }
    }

    /// Tell the dispatcher no more devices will be queued
    pub fn finish(&self) {
        if self.tx.send(WorkItem::Shutdown).is_err() {
            warn!("dispatcher already stopped before shutdown");
        }
    }
}

/// Outcome of a successful probe
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub job: ProbeJob,
    pub metadata: DeviceMetadata,
    pub window: Option<DownloadWindow>,
    pub history: Vec<HistoryRecord>,
    pub state: SessionState,
}

impl ProbeReport {
    /// Inclusive minute ranges of the requested window with no record
    pub fn missing(&self) -> Vec<(i64, i64)> {
        let Some(window) = self.window else {
            return Vec::new();
        };
        let from = i64::from(window.from_index);
        let to = i64::from(window.to_index);
        let inside: Vec<HistoryRecord> = self
            .history
            .iter()
            .filter(|r| window.contains(r.minute_index))
            .cloned()
            .collect();

        let (Some(first), Some(last)) = (inside.first(), inside.last()) else {
            return vec![(from, to)];
        };
        let mut missing = Vec::new();
        if first.minute_index > from {
            missing.push((from, first.minute_index - 1));
        }
        missing.extend(find_gaps(&inside));
        if last.minute_index < to {
            missing.push((last.minute_index + 1, to));
        }
        missing
    }
}

/// Runs the metadata query and download for one device
pub trait Prober {
    async fn probe(&self, job: &ProbeJob) -> Result<ProbeReport, SessionError>;
}

/// Production prober driving a [`DeviceSession`] over a transport
pub struct SessionProber<T> {
    transport: T,
    connect_timeout: Duration,
    download_history: bool,
    window: WindowSpec,
    download_timeout: Option<Duration>,
}

impl<T: Transport> SessionProber<T> {
    pub fn new(transport: T, config: &LoggerConfig) -> Self {
        SessionProber {
            transport,
            connect_timeout: config.connect_timeout,
            download_history: config.download_history,
            window: config.window,
            download_timeout: config.download_timeout,
        }
    }
}

impl<T: Transport> Prober for SessionProber<T> {
    async fn probe(&self, job: &ProbeJob) -> Result<ProbeReport, SessionError> {
        let mut session = DeviceSession::new(job.address.clone(), job.model)
            .with_connect_timeout(self.connect_timeout);

        let metadata = session.query_metadata(&self.transport).await?.clone();

        let mut window = None;
        let mut history = Vec::new();
        if self.download_history && session.model().supports_download() {
            match self.window.resolve(&OffsetDateTime::now_utc()) {
                Some(w) => {
                    info!("Starting download from {}", job.label);
                    history = session
                        .download_history(&self.transport, w, self.download_timeout)
                        .await?;
                    window = Some(w);
                }
                None => warn!("{}: no valid download window, skipping history", job.label),
            }
        }

        Ok(ProbeReport {
            job: job.clone(),
            metadata,
            window,
            history,
            state: session.state(),
        })
    }
}

/// Consumer side of the work queue
pub struct Dispatcher {
    rx: mpsc::UnboundedReceiver<WorkItem>,
}

/// Create a connected work queue and dispatcher
pub fn work_queue() -> (WorkQueue, Dispatcher) {
    let (tx, rx) = mpsc::unbounded_channel();
    (WorkQueue { tx }, Dispatcher { rx })
}

impl Dispatcher {
    #[cfg(test)]
    pub fn try_next(&mut self) -> Option<WorkItem> {
        self.rx.try_recv().ok()
    }

    /// Probe queued devices one at a time until the shutdown marker arrives
    ///
    /// # Returns
    /// Reports of every probe that succeeded, in probing order
    pub async fn run<P: Prober>(mut self, prober: &P) -> Vec<ProbeReport> {
        let mut reports = Vec::new();

        while let Some(item) = self.rx.recv().await {
            let job = match item {
                WorkItem::Probe(job) => job,
                WorkItem::Shutdown => break,
            };

            info!("Interrogating {}", job.label);
            match prober.probe(&job).await {
                Ok(report) => {
                    log_report(&report);
                    reports.push(report);
                }
                Err(e) => error!("Probe of {} ({}) failed: {}", job.label, job.model, e),
            }
        }

        info!("Dispatcher finished, {} devices probed", reports.len());
        reports
    }
}

fn log_report(report: &ProbeReport) {
    let label = &report.job.label;
    info!("{} metadata: {}", label, report.metadata);

    let Some(window) = report.window else {
        return;
    };
    info!(
        "{}: {} records for window {} ({} minutes)",
        label,
        report.history.len(),
        window,
        window.minutes()
    );
    for record in &report.history {
        info!(
            "  {}  {:.2}℃  {:.2}%rh",
            format_datetime(&record.timestamp),
            record.temperature,
            record.humidity
        );
    }
    for (from, to) in report.missing() {
        warn!("{}: no history for minutes {}..={}", label, from, to);
    }
}
