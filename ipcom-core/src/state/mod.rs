pub mod connection;
mod snapshot;

pub use connection::{ConnectionPhase, ConnectionState};
pub use snapshot::{DeviceState, StateSnapshot};
