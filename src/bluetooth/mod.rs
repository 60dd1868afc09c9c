pub mod connection;
pub mod scanner;
pub mod transport;

pub use connection::BluerTransport;
pub use scanner::{open_adapter, scan_for_devices};
