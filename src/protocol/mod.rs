//! Wire-level encoding and decoding for Govee H5174/H5179 sensors
pub mod device_model;
pub mod frame;
pub mod history;

pub use device_model::{DecodeError, DeviceModel};
pub use frame::{FrameError, Opcode};
pub use history::{HistoryError, HistoryReassembler};
