mod connection;
mod reconnect;

pub use connection::{ConnectionManager, Inbound};
pub use reconnect::ReconnectPolicy;
