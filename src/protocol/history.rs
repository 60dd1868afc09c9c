//! Reassembly of H5179 bulk-download packets into an ordered time series.
//!
//! Each packet on the download-data characteristic carries a base minute
//! index and four temperature/humidity slots. A temperature of `-1` in the
//! first slot marks it as absent, which happens on the packet that straddles
//! the lower bound of the requested window.
use log::debug;
use std::collections::BTreeMap;
use time::OffsetDateTime;

use crate::models::HistoryRecord;

/// Size of one download-data packet: i32 base index + 8 x i16
pub const PACKET_LEN: usize = 20;

/// Temperature value marking an empty first slot
const ABSENT_SLOT: i16 = -1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("expected a 20 byte history packet, got {0} bytes")]
    WrongLength(usize),

    #[error("minute index {0} is outside the representable time range")]
    TimestampOutOfRange(i64),
}

/// Convert a device minute index to a UTC timestamp
pub fn minute_index_to_datetime(minute_index: i64) -> Result<OffsetDateTime, HistoryError> {
    minute_index
        .checked_mul(60)
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
        .ok_or(HistoryError::TimestampOutOfRange(minute_index))
}

/// Collects records from bulk packets, keyed by minute index
#[derive(Debug, Default)]
pub struct HistoryReassembler {
    records: BTreeMap<i64, HistoryRecord>,
    packets: usize,
    overwritten: usize,
}

impl HistoryReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one packet and merge its records
    ///
    /// # Arguments
    /// * `packet` - Raw bytes of a download-data notification
    ///
    /// # Returns
    /// The records carried by this packet, in increasing minute order
    pub fn push(&mut self, packet: &[u8]) -> Result<Vec<HistoryRecord>, HistoryError> {
        let records = decode_packet(packet)?;
        self.packets += 1;

        for record in &records {
            if self
                .records
                .insert(record.minute_index, record.clone())
                .is_some()
            {
                self.overwritten += 1;
                debug!("minute {} received twice, keeping latest", record.minute_index);
            }
        }

        Ok(records)
    }

    pub fn packets(&self) -> usize {
        self.packets
    }

    /// Number of records replaced by a later packet for the same minute
    pub fn overwritten(&self) -> usize {
        self.overwritten
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &HistoryRecord> {
        self.records.values()
    }

    /// Consume the reassembler, returning records in increasing minute order
    pub fn into_records(self) -> Vec<HistoryRecord> {
        self.records.into_values().collect()
    }
}

fn decode_packet(packet: &[u8]) -> Result<Vec<HistoryRecord>, HistoryError> {
    if packet.len() != PACKET_LEN {
        return Err(HistoryError::WrongLength(packet.len()));
    }

    let base_index = i64::from(i32::from_le_bytes([
        packet[0], packet[1], packet[2], packet[3],
    ]));
    let mut values = [0i16; 8];
    for (i, value) in values.iter_mut().enumerate() {
        let at = 4 + i * 2;
        *value = i16::from_le_bytes([packet[at], packet[at + 1]]);
    }

    // (temperature, humidity) per slot, oldest first
    let slots: Vec<(i16, i16)> = values.chunks_exact(2).map(|s| (s[0], s[1])).collect();

    // A missing first slot shifts the remaining three up by one minute
    let (first_index, valid) = if slots[0].0 == ABSENT_SLOT {
        (base_index + 1, &slots[1..])
    } else {
        (base_index, &slots[..])
    };

    debug!(
        "history packet base={} slots={:?}{}",
        base_index,
        slots,
        if valid.len() < 4 { " (partial)" } else { "" }
    );

    valid
        .iter()
        .enumerate()
        .map(|(offset, &(temperature, humidity))| -> Result<HistoryRecord, HistoryError> {
            let minute_index = first_index + offset as i64;
            Ok(HistoryRecord {
                minute_index,
                timestamp: minute_index_to_datetime(minute_index)?,
                temperature: f32::from(temperature) / 100.0,
                humidity: f32::from(humidity) / 100.0,
            })
        })
        .collect()
}

/// Inclusive ranges of minute indices missing between consecutive records
///
/// Records must be sorted by minute index, as produced by
/// [`HistoryReassembler::into_records`].
pub fn find_gaps(records: &[HistoryRecord]) -> Vec<(i64, i64)> {
    records
        .windows(2)
        .filter(|pair| pair[1].minute_index - pair[0].minute_index > 1)
        .map(|pair| (pair[0].minute_index + 1, pair[1].minute_index - 1))
        .collect()
}
