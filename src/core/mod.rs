//! Networks, configuration and thread groups

pub mod client;
pub mod config;
pub mod runtime;
pub mod server;

pub use client::ClientNetwork;
pub use config::{NetworkConfig, ServerNetworkConfig, DEFAULT_MAX_PACKET_SIZE};
pub use runtime::{Scheduler, ThreadGroup};
pub use server::{Accept, ServerNetwork};
