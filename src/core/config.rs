//! Network tuning parameters
//!
//! A [`NetworkConfig`] is created once and shared (behind an `Arc`) by every
//! connection of a network. [`ServerNetworkConfig`] adds listener and
//! thread-group sizing.

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::time::Duration;

use crate::codec::framing::{ByteOrder, HeaderWidth};
use crate::error::{NetworkError, Result};
use crate::packet::Protocol;

/// Default reader safety ceiling (16MB)
pub const DEFAULT_MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Connection tuning shared by clients and servers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Prefix for worker thread names
    pub thread_group_name: String,
    /// Worker threads of a client network
    pub thread_group_size: usize,
    /// Size of the per-connection read buffer
    pub read_buffer_size: usize,
    /// Size of the shared per-connection write buffer
    pub write_buffer_size: usize,
    /// Size of the buffer holding bytes of incomplete frames
    pub pending_buffer_size: usize,
    /// Byte order of frame headers
    pub byte_order: ByteOrder,
    /// Width of the length header
    pub length_header: HeaderWidth,
    /// Width of the id header (id-framed protocols only)
    pub id_header: HeaderWidth,
    /// Largest frame length the reader accepts before closing the connection
    pub max_packet_size: usize,
    /// Packets decoded from one read before yielding to other connections
    pub max_packets_by_read: usize,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Attempts made by one connect call
    pub max_connect_attempts: usize,
    /// Disable Nagle's algorithm on connected sockets
    pub tcp_nodelay: bool,
    /// TCP keep-alive interval
    pub keep_alive: Option<Duration>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            thread_group_name: "packet-network".to_string(),
            thread_group_size: 2,
            read_buffer_size: 2048,
            write_buffer_size: 2048,
            pending_buffer_size: 4096,
            byte_order: ByteOrder::BigEndian,
            length_header: HeaderWidth::Four,
            id_header: HeaderWidth::Two,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_packets_by_read: 32,
            connect_timeout: Duration::from_secs(10),
            max_connect_attempts: 1,
            tcp_nodelay: true,
            keep_alive: Some(Duration::from_secs(60)),
        }
    }
}

impl NetworkConfig {
    /// Create a new configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from JSON; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| NetworkError::config(format!("Invalid network config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the worker thread name prefix
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_thread_group_name(mut self, name: impl Into<String>) -> Self {
        self.thread_group_name = name.into();
        self
    }

    /// Set the worker thread count
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_thread_group_size(mut self, size: usize) -> Self {
        self.thread_group_size = size;
        self
    }

    /// Set read, write and pending buffer sizes
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_buffer_sizes(mut self, read: usize, write: usize, pending: usize) -> Self {
        self.read_buffer_size = read;
        self.write_buffer_size = write;
        self.pending_buffer_size = pending;
        self
    }

    /// Set header byte order
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }

    /// Set length and id header widths
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_headers(mut self, length: HeaderWidth, id: HeaderWidth) -> Self {
        self.length_header = length;
        self.id_header = id;
        self
    }

    /// Set the reader safety ceiling
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Set the per-read decode budget
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_max_packets_by_read(mut self, count: usize) -> Self {
        self.max_packets_by_read = count;
        self
    }

    /// Set connection timeout
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set attempts per connect call
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_max_connect_attempts(mut self, attempts: usize) -> Self {
        self.max_connect_attempts = attempts;
        self
    }

    /// Set keep-alive interval
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_keep_alive(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive = interval;
        self
    }

    /// Set TCP_NODELAY
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    /// Reader ceiling clamped to what the length header can express
    #[must_use]
    pub fn effective_max_packet_size(&self) -> usize {
        self.max_packet_size
            .min(self.length_header.max_value() as usize)
    }

    /// Check invariants between fields
    pub fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 || self.write_buffer_size == 0 {
            return Err(NetworkError::config("buffer sizes must be non-zero"));
        }
        if self.pending_buffer_size < 2 * self.read_buffer_size {
            return Err(NetworkError::config(format!(
                "pending buffer ({}) must be at least twice the read buffer ({})",
                self.pending_buffer_size, self.read_buffer_size
            )));
        }
        if self.max_packet_size == 0 {
            return Err(NetworkError::config("max packet size must be non-zero"));
        }
        if self.max_packets_by_read == 0 {
            return Err(NetworkError::config("max packets by read must be non-zero"));
        }
        if self.thread_group_size == 0 {
            return Err(NetworkError::config("thread group size must be non-zero"));
        }
        if self.max_connect_attempts == 0 {
            return Err(NetworkError::config("max connect attempts must be non-zero"));
        }
        Ok(())
    }

    /// Check that every id `protocol` may frame fits in the id header
    pub fn validate_protocol<P: Protocol>(&self, protocol: &P) -> Result<()> {
        if !protocol.is_id_framed() {
            return Ok(());
        }
        match protocol.max_packet_id() {
            Some(id) if id > self.id_header.max_value() => Err(NetworkError::config(format!(
                "packet id {} does not fit in a {}-byte id header",
                id,
                self.id_header.size()
            ))),
            _ => Ok(()),
        }
    }
}

/// Server tuning: connection parameters plus listener and thread-group sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerNetworkConfig {
    /// Parameters applied to every accepted connection
    pub network: NetworkConfig,
    /// Host used when `start()` is called without an address
    pub bind_host: String,
    /// Candidate ports tried in order by `start()`
    pub port_range: RangeInclusive<u16>,
    /// Async worker threads
    pub thread_group_min_size: usize,
    /// `max - min` caps the blocking pool; workers stay at `min`
    pub thread_group_max_size: usize,
    /// Threads of the scheduled-task pool
    pub scheduled_thread_group_size: usize,
    /// Delay before re-issuing accept after a transient failure
    pub retry_delay: Duration,
    /// Maximum concurrent connections
    pub max_connections: usize,
}

impl Default for ServerNetworkConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default().with_thread_group_name("packet-server"),
            bind_host: "127.0.0.1".to_string(),
            port_range: 1500..=9999,
            thread_group_min_size: 2,
            thread_group_max_size: 8,
            scheduled_thread_group_size: 1,
            retry_delay: Duration::from_millis(100),
            max_connections: 1000,
        }
    }
}

impl ServerNetworkConfig {
    /// Create a new configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from JSON; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| NetworkError::config(format!("Invalid server config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Replace the connection parameters
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    /// Set the host used for port scanning
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    /// Set candidate ports
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_port_range(mut self, ports: RangeInclusive<u16>) -> Self {
        self.port_range = ports;
        self
    }

    /// Use a fixed-size worker pool
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_fixed_thread_group(mut self, size: usize) -> Self {
        self.thread_group_min_size = size;
        self.thread_group_max_size = size;
        self
    }

    /// Use an elastic worker pool
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_elastic_thread_group(mut self, min: usize, max: usize) -> Self {
        self.thread_group_min_size = min;
        self.thread_group_max_size = max;
        self
    }

    /// Set scheduled pool size
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_scheduled_thread_group_size(mut self, size: usize) -> Self {
        self.scheduled_thread_group_size = size;
        self
    }

    /// Set accept retry delay
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set maximum connections
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Check invariants between fields
    pub fn validate(&self) -> Result<()> {
        self.network.validate()?;
        if self.thread_group_min_size == 0 {
            return Err(NetworkError::config("thread group min size must be non-zero"));
        }
        if self.thread_group_min_size > self.thread_group_max_size {
            return Err(NetworkError::config(format!(
                "thread group min size ({}) exceeds max size ({})",
                self.thread_group_min_size, self.thread_group_max_size
            )));
        }
        if self.scheduled_thread_group_size == 0 {
            return Err(NetworkError::config(
                "scheduled thread group size must be non-zero",
            ));
        }
        if self.port_range.is_empty() {
            return Err(NetworkError::config("port range is empty"));
        }
        if self.max_connections == 0 {
            return Err(NetworkError::config("max connections must be non-zero"));
        }
        Ok(())
    }
}
