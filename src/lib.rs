//! Rust Packet Network
//!
//! An async packet network engine: length-prefixed framing over TCP or TLS,
//! pooled buffers, typed packet registries and client/server networks that
//! each run on their own named thread group.
//!
//! ## Features
//!
//! - Configurable length and id headers (1, 2 or 4 bytes, either byte order)
//! - Incremental reader that survives partial and pipelined frames
//! - Single-writer send queue with per-packet delivery feedback
//! - Copy-on-register packet registry shared without locks
//! - Publisher/subscriber streams for accepted connections and packets
//! - Optional TLS through rustls
//!
//! ## Example
//!
//! ```no_run
//! use rust_packet_network::{RawPacket, RawProtocol, ServerNetwork, ServerNetworkConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = ServerNetwork::new(ServerNetworkConfig::default(), RawProtocol)?;
//!     server.on_accept(|connection| {
//!         let echo = connection.clone();
//!         connection.on_receive(move |packet: RawPacket| {
//!             let _ = echo.send(packet);
//!         });
//!     });
//!     let address = server.start()?;
//!     println!("listening on {}", address);
//!     # server.shutdown();
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod codec;
pub mod connection;
pub mod core;
pub mod error;
pub mod event;
pub mod packet;

#[cfg(feature = "tls")]
pub mod tls;

// Re-export main types
pub use buffer::{AllocatorStats, BufferAllocator, PooledBufferAllocator};
pub use codec::{ByteOrder, Framing, HeaderWidth, PacketReader, PacketWriter, ReaderState};
pub use connection::{Connection, ConnectionContext, ConnectionHandler, ConnectionState};
pub use core::{
    Accept, ClientNetwork, NetworkConfig, Scheduler, ServerNetwork, ServerNetworkConfig,
    ThreadGroup, DEFAULT_MAX_PACKET_SIZE,
};
pub use error::{NetworkError, Result};
pub use event::{Publisher, Subscription};
pub use packet::{
    IdPacket, IdProtocol, PacketDescriptor, PacketRegistry, Protocol, RawPacket, RawProtocol,
    ReadablePacket, WritablePacket,
};

#[cfg(feature = "tls")]
pub use tls::TlsConfig;
