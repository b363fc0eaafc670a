pub mod btle;
pub mod connection;
pub mod constants;
pub mod heartbeat;
pub mod reconnect;
pub mod selector;
pub mod transport;
pub mod types;
