pub mod config;
pub mod status;

pub use config::{parse_bus_address, BridgeConfig};
