//! Connections
//!
//! A [`Connection`] binds one stream to one [`PacketReader`] and one
//! [`PacketWriter`]. Plain and TLS connections differ only in the stream they
//! wrap; framing, dispatch and lifecycle are identical.
//!
//! # Lifecycle
//!
//! A connection is `Open` when created and moves to `Closed` exactly once,
//! on EOF, a fatal read or write error, or an explicit [`Connection::close`].
//! Closing releases every buffer back to the allocator and shuts the stream.
//!
//! Reading starts lazily, when the first receive subscription is made, so
//! packets are never decoded before somebody listens for them.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};

use crate::buffer::BufferAllocator;
use crate::codec::framing::Framing;
use crate::codec::reader::PacketReader;
use crate::codec::writer::PacketWriter;
use crate::core::config::NetworkConfig;
use crate::error::{NetworkError, Result};
use crate::event::{Publisher, Subscription};
use crate::packet::Protocol;

/// Read half of a plain or TLS stream
pub type PacketSource = Box<dyn AsyncRead + Send + Unpin>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const OPEN: u8 = 0;
const CLOSED: u8 = 1;

/// Connection state; `Closed` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closed,
}

/// Everything a connection shares with its network
pub struct ConnectionContext<P: Protocol> {
    pub config: Arc<NetworkConfig>,
    pub protocol: Arc<P>,
    pub allocator: Arc<dyn BufferAllocator>,
    /// Runtime that runs the connection's read and write tasks
    pub handle: Handle,
}

impl<P: Protocol> ConnectionContext<P> {
    pub fn new(
        config: Arc<NetworkConfig>,
        protocol: Arc<P>,
        allocator: Arc<dyn BufferAllocator>,
        handle: Handle,
    ) -> Self {
        Self {
            config,
            protocol,
            allocator,
            handle,
        }
    }

    fn framing(&self) -> Framing {
        Framing::for_protocol(&self.config, &*self.protocol)
    }
}

impl<P: Protocol> Clone for ConnectionContext<P> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            protocol: Arc::clone(&self.protocol),
            allocator: Arc::clone(&self.allocator),
            handle: self.handle.clone(),
        }
    }
}

/// One open stream speaking protocol `P`
pub struct Connection<P: Protocol> {
    id: u64,
    remote_address: SocketAddr,
    secure: bool,
    state: AtomicU8,
    created_at: Instant,
    last_activity: Arc<RwLock<Instant>>,
    context: ConnectionContext<P>,
    read_side: Mutex<Option<(PacketSource, PacketReader)>>,
    reading: AtomicBool,
    writer: Arc<PacketWriter<P>>,
    received: Publisher<P::Packet>,
    shutdown: watch::Sender<bool>,
}

impl<P: Protocol> Connection<P> {
    /// Wrap an accepted or connected plaintext socket
    pub fn plain(stream: TcpStream, context: ConnectionContext<P>) -> Result<Arc<Self>> {
        let remote_address = stream.peer_addr()?;
        Ok(Self::from_stream(stream, remote_address, false, context))
    }

    /// Wrap a stream whose TLS handshake already completed
    #[cfg(feature = "tls")]
    pub fn secure<S>(stream: S, remote_address: SocketAddr, context: ConnectionContext<P>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::from_stream(stream, remote_address, true, context)
    }

    /// Wrap any byte stream
    pub fn from_stream<S>(
        stream: S,
        remote_address: SocketAddr,
        secure: bool,
        context: ConnectionContext<P>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let framing = context.framing();
        let now = Instant::now();
        let last_activity = Arc::new(RwLock::new(now));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let reader = PacketReader::new(framing, Arc::clone(&context.allocator));
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let writer = PacketWriter::new(
                framing,
                Arc::clone(&context.protocol),
                Arc::clone(&context.allocator),
                context.handle.clone(),
                Box::new(write_half),
                shutdown_rx,
                Arc::clone(&last_activity),
                Box::new(move |error: &NetworkError| {
                    if let Some(connection) = weak.upgrade() {
                        tracing::debug!(connection = id, "closing after write failure: {}", error);
                        connection.close();
                    }
                }),
            );

            tracing::debug!(connection = id, peer = %remote_address, secure, "connection opened");
            Self {
                id,
                remote_address,
                secure,
                state: AtomicU8::new(OPEN),
                created_at: now,
                last_activity,
                context,
                read_side: Mutex::new(Some((Box::new(read_half) as PacketSource, reader))),
                reading: AtomicBool::new(false),
                writer,
                received: Publisher::new(),
                shutdown,
            }
        })
    }

    /// Process-unique connection id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Peer address
    #[must_use]
    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    /// Check if the stream is TLS-wrapped
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        if self.state.load(Ordering::Acquire) == OPEN {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Time of the last successful read or write
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.read()
    }

    /// Time since the last successful read or write
    #[must_use]
    pub fn idle_time(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Packets queued for writing
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.writer.pending_writes()
    }

    /// Queue a packet for writing.
    ///
    /// Returns once the packet is queued; write failures are logged. Use
    /// [`Connection::send_with_feedback`] to observe the outcome.
    pub fn send(&self, packet: P::Packet) -> Result<()> {
        if !self.is_open() {
            return Err(NetworkError::Closed);
        }
        self.writer.enqueue(packet, None);
        Ok(())
    }

    /// Queue a packet and get a future resolving once it is fully written.
    ///
    /// The packet is queued immediately, before the future is polled, so
    /// ordering relative to other sends follows call order.
    pub fn send_with_feedback(
        &self,
        packet: P::Packet,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.writer.enqueue(packet, Some(tx));
        async move { rx.await.unwrap_or(Err(NetworkError::Closed)) }
    }

    /// Stream of decoded packets; starts reading if not already started
    pub fn received_packets(self: &Arc<Self>) -> Subscription<P::Packet> {
        let subscription = self.received.subscribe();
        self.start_reading();
        subscription
    }

    /// Invoke `callback` for every decoded packet, in arrival order
    pub fn on_receive<F>(self: &Arc<Self>, mut callback: F)
    where
        F: FnMut(P::Packet) + Send + 'static,
    {
        let mut packets = self.received_packets();
        self.context.handle.spawn(async move {
            while let Some(packet) = packets.recv().await {
                callback(packet);
            }
        });
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let _ = shutdown.wait_for(|closed| *closed).await;
    }

    /// Close the connection and release its buffers. Idempotent.
    pub fn close(&self) {
        if self.state.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            return;
        }
        self.shutdown.send_replace(true);
        self.writer.release();
        self.received.close();

        // never started reading
        if let Some((source, mut reader)) = self.read_side.lock().take() {
            reader.release();
            drop(source);
        }
        tracing::debug!(
            connection = self.id,
            peer = %self.remote_address,
            "connection closed after {:?}",
            self.uptime()
        );
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    fn start_reading(self: &Arc<Self>) {
        if self.reading.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some((source, reader)) = self.read_side.lock().take() else {
            return;
        };
        let connection = Arc::clone(self);
        self.context
            .handle
            .spawn(async move { connection.read_loop(source, reader).await });
    }

    /// One read outstanding at a time; the next read is issued only after the
    /// previous bytes are decoded and dispatched.
    async fn read_loop(self: Arc<Self>, mut source: PacketSource, mut reader: PacketReader) {
        let mut shutdown = self.shutdown.subscribe();
        let budget = self.context.config.max_packets_by_read.max(1);
        let protocol = Arc::clone(&self.context.protocol);

        let failure = 'read: loop {
            let read = tokio::select! {
                biased;
                _ = shutdown.wait_for(|closed| *closed) => break 'read None,
                read = reader.read_from(&mut source) => read,
            };
            match read {
                Ok(0) => {
                    tracing::debug!(connection = self.id, "end of stream");
                    break 'read None;
                }
                Ok(_) => self.touch(),
                Err(e) => break 'read Some(e),
            }

            let mut dispatched = 0;
            loop {
                match reader.next_packet(&*protocol) {
                    Ok(Some(packet)) => {
                        self.received.publish(packet);
                        dispatched += 1;
                        if dispatched == budget {
                            dispatched = 0;
                            tokio::task::yield_now().await;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => break 'read Some(e),
                }
            }
        };

        reader.release();
        drop(source);
        match failure {
            Some(e) if e.is_connection_closed() => {
                tracing::debug!(connection = self.id, "read side closed: {}", e);
            }
            Some(e) => {
                tracing::warn!(
                    connection = self.id,
                    peer = %self.remote_address,
                    "closing connection after read failure: {}",
                    e
                );
            }
            None => {}
        }
        self.close();
    }
}

impl<P: Protocol> Drop for Connection<P> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<P: Protocol> fmt::Debug for Connection<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_address", &self.remote_address)
            .field("secure", &self.secure)
            .field("state", &self.state())
            .finish()
    }
}

/// Apply the socket options of `config` to a freshly connected or accepted socket
pub(crate) fn tune_socket(stream: &TcpStream, config: &NetworkConfig) -> Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;
    if let Some(interval) = config.keep_alive {
        let keep_alive = socket2::TcpKeepalive::new().with_time(interval);
        socket2::SockRef::from(stream)
            .set_tcp_keepalive(&keep_alive)
            .map_err(|e| NetworkError::other(format!("Failed to set keep-alive: {}", e)))?;
    }
    Ok(())
}

/// Per-connection application logic driven by [`serve_connection`]
#[async_trait]
pub trait ConnectionHandler<P: Protocol>: Send + Sync + 'static {
    /// Called once, before the first packet
    async fn on_connected(&self, connection: &Arc<Connection<P>>) {
        let _ = connection;
    }

    /// Called for every decoded packet, in arrival order
    async fn on_packet(&self, connection: &Arc<Connection<P>>, packet: P::Packet);

    /// Called once after the connection closed
    async fn on_disconnected(&self, connection: &Arc<Connection<P>>) {
        let _ = connection;
    }
}

/// Drive `handler` over the lifetime of `connection`
pub async fn serve_connection<P, H>(connection: Arc<Connection<P>>, handler: Arc<H>)
where
    P: Protocol,
    H: ConnectionHandler<P> + ?Sized,
{
    let mut packets = connection.received_packets();
    handler.on_connected(&connection).await;
    while let Some(packet) = packets.recv().await {
        handler.on_packet(&connection, packet).await;
    }
    handler.on_disconnected(&connection).await;
}
