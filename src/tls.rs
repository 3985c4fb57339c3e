//! TLS support for secure connections
//!
//! Handshakes run before a [`Connection`](crate::connection::Connection) is
//! created, so framing only ever sees decrypted application bytes.

pub mod config;

pub use config::TlsConfig;
pub use tokio_rustls::{TlsAcceptor, TlsConnector};
