pub mod apparmor;
pub mod bgp;
pub mod bridge;
pub mod bridge_config;
mod bridge_forward;
pub mod config;
pub mod db;
pub mod dnsmasq;
pub mod error;
pub mod firewall;
pub mod forward;
pub mod ip;
pub mod logger;
pub mod network;
pub mod proxy;
pub mod revert;
pub mod subnet;
pub mod subprocess;
pub mod usage;
pub mod validate;

pub use error::NovaError;

pub type Result<T> = std::result::Result<T, NovaError>;

// Convenience re-exports for the bridge driver
pub use bridge::BridgeNetwork;
pub use config::{DaemonConfig, NovaConfig};
pub use db::Cluster;
pub use network::{ClientType, ConfigMap, DaemonState, Network, NetworkPut, NetworksPost};
