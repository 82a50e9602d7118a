pub mod client;
pub mod types;

pub use client::ControllerClient;
pub use types::{ConnectionsSnapshot, Delay, ProxyInfo, ProxyTopology, TrafficFrame};
