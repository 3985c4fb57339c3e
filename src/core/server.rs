//! Server side: listener, accept loop and accepted connections

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use super::config::ServerNetworkConfig;
use super::runtime::{Scheduler, ThreadGroup};
use crate::buffer::{BufferAllocator, PooledBufferAllocator};
use crate::connection::{
    serve_connection, tune_socket, Connection, ConnectionContext, ConnectionHandler,
};
use crate::error::{NetworkError, Result};
use crate::event::{Publisher, Subscription};
use crate::packet::Protocol;
#[cfg(feature = "tls")]
use crate::tls::{TlsAcceptor, TlsConfig};

/// Source of inbound sockets
#[async_trait]
pub trait Accept: Send + Sync + 'static {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Accept for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

#[cfg(feature = "tls")]
type Handshake = Option<TlsAcceptor>;
#[cfg(not(feature = "tls"))]
type Handshake = ();

/// Errors after which the listener can never accept again
fn is_listener_closed(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::InvalidInput
    )
}

struct ServerShared<P: Protocol> {
    accepted: Publisher<Arc<Connection<P>>>,
    connections: RwLock<Vec<Arc<Connection<P>>>>,
    listener: Mutex<Option<Box<dyn Accept>>>,
    local_address: RwLock<Option<SocketAddr>>,
    limiter: Arc<Semaphore>,
    max_connections: usize,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Server network accepting connections on its own thread groups
pub struct ServerNetwork<P: Protocol> {
    config: Arc<ServerNetworkConfig>,
    context: ConnectionContext<P>,
    group: ThreadGroup,
    scheduler: Scheduler,
    shared: Arc<ServerShared<P>>,
    handshake: Handshake,
}

impl<P: Protocol> ServerNetwork<P> {
    /// Create a server with a worker group, a scheduled group and a buffer pool
    pub fn new(config: ServerNetworkConfig, protocol: P) -> Result<Self> {
        config.validate()?;
        config.network.validate_protocol(&protocol)?;
        let name = config.network.thread_group_name.clone();
        let group = ThreadGroup::elastic(
            name.clone(),
            config.thread_group_min_size,
            config.thread_group_max_size,
        )?;
        let scheduler = Scheduler::new(
            format!("{}-scheduled", name),
            config.scheduled_thread_group_size,
        )?;
        let allocator: Arc<dyn BufferAllocator> =
            Arc::new(PooledBufferAllocator::new(&config.network));
        let context = ConnectionContext::new(
            Arc::new(config.network.clone()),
            Arc::new(protocol),
            allocator,
            group.handle().clone(),
        );
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            shared: Arc::new(ServerShared {
                accepted: Publisher::new(),
                connections: RwLock::new(Vec::new()),
                listener: Mutex::new(None),
                local_address: RwLock::new(None),
                limiter: Arc::new(Semaphore::new(config.max_connections)),
                max_connections: config.max_connections,
                running: AtomicBool::new(false),
                shutdown,
            }),
            config: Arc::new(config),
            context,
            group,
            scheduler,
            handshake: Handshake::default(),
        })
    }

    /// Share a buffer allocator with other networks
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_allocator(mut self, allocator: Arc<dyn BufferAllocator>) -> Self {
        self.context.allocator = allocator;
        self
    }

    /// Perform a TLS handshake on every accepted socket
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, tls: TlsConfig) -> Result<Self> {
        let acceptor = tls
            .acceptor()
            .ok_or_else(|| NetworkError::tls("server TLS context not configured"))?;
        self.handshake = Some(acceptor);
        Ok(self)
    }

    #[must_use]
    pub fn config(&self) -> &ServerNetworkConfig {
        &self.config
    }

    /// Bind the first free port of the configured range on the bind host
    pub fn start(&self) -> Result<SocketAddr> {
        let host = self.config.bind_host.as_str();
        for port in self.config.port_range.clone() {
            match std::net::TcpListener::bind((host, port)) {
                Ok(listener) => return self.start_std(listener),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    tracing::debug!("port {} in use, trying next", port);
                }
                Err(e) => {
                    tracing::error!("failed to bind {}:{}: {}", host, port, e);
                    return Err(e.into());
                }
            }
        }
        Err(NetworkError::connection(format!(
            "no free port in {:?} on {}",
            self.config.port_range, host
        )))
    }

    /// Bind exactly `address`
    pub fn start_on(&self, address: SocketAddr) -> Result<SocketAddr> {
        let listener = std::net::TcpListener::bind(address).map_err(|e| {
            tracing::error!("failed to bind {}: {}", address, e);
            NetworkError::from(e)
        })?;
        self.start_std(listener)
    }

    fn start_std(&self, listener: std::net::TcpListener) -> Result<SocketAddr> {
        listener.set_nonblocking(true)?;
        // register with this server's reactor rather than the caller's
        let _entered = self.group.handle().enter();
        let listener = TcpListener::from_std(listener)?;
        self.start_with(listener)
    }

    /// Serve connections from a custom socket source
    pub fn start_with(&self, listener: impl Accept) -> Result<SocketAddr> {
        if !self.group.is_running() {
            return Err(NetworkError::invalid_state("server network is shut down"));
        }
        let address = listener.local_addr()?;
        {
            let mut local_address = self.shared.local_address.write();
            if local_address.is_some() {
                return Err(NetworkError::invalid_state("server already started"));
            }
            *local_address = Some(address);
        }
        *self.shared.listener.lock() = Some(Box::new(listener));
        self.shared.running.store(true, Ordering::Release);
        tracing::info!("server network listening on {}", address);

        self.start_accepting();
        Ok(address)
    }

    /// Stream of accepted connections; starts the accept loop if needed
    pub fn accepted(&self) -> Subscription<Arc<Connection<P>>> {
        let subscription = self.shared.accepted.subscribe();
        self.start_accepting();
        subscription
    }

    /// Invoke `callback` for every accepted connection
    pub fn on_accept<F>(&self, mut callback: F)
    where
        F: FnMut(Arc<Connection<P>>) + Send + 'static,
    {
        let mut accepted = self.shared.accepted.subscribe();
        self.group.spawn(async move {
            while let Some(connection) = accepted.recv().await {
                callback(connection);
            }
        });
        self.start_accepting();
    }

    /// Drive `handler` for every accepted connection
    pub fn serve<H>(&self, handler: Arc<H>)
    where
        H: ConnectionHandler<P>,
    {
        let mut accepted = self.shared.accepted.subscribe();
        let handle = self.group.handle().clone();
        self.group.spawn(async move {
            while let Some(connection) = accepted.recv().await {
                handle.spawn(serve_connection(connection, Arc::clone(&handler)));
            }
        });
        self.start_accepting();
    }

    /// Begin accepting once a listener is bound and somebody subscribed
    fn start_accepting(&self) {
        if !self.shared.accepted.has_subscribers() {
            return;
        }
        let Some(listener) = self.shared.listener.lock().take() else {
            return;
        };

        let shared = Arc::clone(&self.shared);
        let context = self.context.clone();
        let handshake = self.handshake.clone();
        let retry_delay = self.config.retry_delay;
        self.group.spawn(async move {
            accept_loop(shared, listener, context, handshake, retry_delay).await;
        });
    }

    /// Bound address, once started
    #[must_use]
    pub fn local_address(&self) -> Option<SocketAddr> {
        *self.shared.local_address.read()
    }

    /// Check if the server was started and not shut down
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Open connections
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<Connection<P>>> {
        self.shared.connections.read().clone()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.connections.read().len()
    }

    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.config.max_connections
    }

    /// Queue `packet` on every open connection, returning how many took it
    pub fn broadcast(&self, packet: &P::Packet) -> usize {
        self.connections()
            .iter()
            .filter(|connection| connection.send(packet.clone()).is_ok())
            .count()
    }

    /// Run `task` once after `delay` on the scheduled group
    pub fn schedule<F>(&self, delay: Duration, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.scheduler.schedule(delay, task)
    }

    /// Run `task` every `period` on the scheduled group
    pub fn schedule_at_fixed_rate<F, Fut>(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.scheduler
            .schedule_at_fixed_rate(initial_delay, period, task)
    }

    /// Stop accepting, close every connection and stop both thread groups.
    /// Idempotent.
    pub fn shutdown(&self) {
        let was_running = self.shared.running.swap(false, Ordering::AcqRel);
        self.shared.shutdown.send_replace(true);
        self.shared.listener.lock().take();

        let connections: Vec<_> = self.shared.connections.write().drain(..).collect();
        for connection in connections {
            connection.close();
        }
        self.shared.accepted.close();

        if was_running || self.group.is_running() {
            tracing::info!("server network {} shutting down", self.group.name());
        }
        self.scheduler.shutdown();
        self.group.shutdown();
    }
}

impl<P: Protocol> Drop for ServerNetwork<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<P: Protocol> fmt::Debug for ServerNetwork<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerNetwork")
            .field("local_address", &self.local_address())
            .field("running", &self.is_running())
            .field("connections", &self.connection_count())
            .finish()
    }
}

async fn accept_loop<P: Protocol>(
    shared: Arc<ServerShared<P>>,
    listener: Box<dyn Accept>,
    context: ConnectionContext<P>,
    handshake: Handshake,
    retry_delay: Duration,
) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let Ok(permit) = Arc::clone(&shared.limiter).try_acquire_owned() else {
                    tracing::warn!(
                        "connection limit reached ({}), rejecting {}",
                        shared.max_connections,
                        peer
                    );
                    drop(stream);
                    continue;
                };
                context.handle.spawn(establish(
                    Arc::clone(&shared),
                    context.clone(),
                    handshake.clone(),
                    stream,
                    peer,
                    permit,
                ));
            }
            Err(e) if is_listener_closed(&e) => {
                tracing::debug!("listener closed, accept loop stopping: {}", e);
                break;
            }
            Err(e) => {
                tracing::warn!("accept failed, retrying in {:?}: {}", retry_delay, e);
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
    tracing::debug!("accept loop stopped");
}

/// Turn an accepted socket into a published connection, holding the
/// connection-limit permit until it closes
async fn establish<P: Protocol>(
    shared: Arc<ServerShared<P>>,
    context: ConnectionContext<P>,
    handshake: Handshake,
    stream: TcpStream,
    peer: SocketAddr,
    permit: OwnedSemaphorePermit,
) {
    if let Err(e) = tune_socket(&stream, &context.config) {
        tracing::warn!("failed to tune socket from {}: {}", peer, e);
    }

    #[cfg(feature = "tls")]
    let connection = match handshake {
        Some(acceptor) => {
            let deadline = context.config.connect_timeout;
            match tokio::time::timeout(deadline, acceptor.accept(stream)).await {
                Ok(Ok(stream)) => Connection::secure(stream, peer, context),
                Ok(Err(e)) => {
                    tracing::warn!("TLS handshake with {} failed: {}", peer, e);
                    return;
                }
                Err(_) => {
                    tracing::warn!("TLS handshake with {} timed out", peer);
                    return;
                }
            }
        }
        None => Connection::from_stream(stream, peer, false, context),
    };
    #[cfg(not(feature = "tls"))]
    let connection = {
        let () = handshake;
        Connection::from_stream(stream, peer, false, context)
    };

    if !shared.running.load(Ordering::Acquire) {
        connection.close();
        return;
    }
    shared.connections.write().push(Arc::clone(&connection));
    tracing::debug!(connection = connection.id(), peer = %peer, "connection accepted");
    shared.accepted.publish(Arc::clone(&connection));

    connection.closed().await;
    shared
        .connections
        .write()
        .retain(|other| other.id() != connection.id());
    drop(permit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::NetworkConfig;
    use crate::packet::RawProtocol;
    use std::sync::atomic::AtomicUsize;

    fn test_config(name: &str) -> ServerNetworkConfig {
        ServerNetworkConfig::new()
            .with_network(NetworkConfig::default().with_thread_group_name(name))
            .with_fixed_thread_group(2)
            .with_retry_delay(Duration::from_millis(10))
    }

    /// Fails the first accept with a transient error, then delegates
    struct FlakyListener {
        inner: TcpListener,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl Accept for FlakyListener {
        async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
            if self.failures.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(io::ErrorKind::ConnectionReset.into());
            }
            self.inner.accept().await
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.inner.local_addr()
        }
    }

    #[test]
    fn test_transient_accept_error_is_retried() {
        let server = ServerNetwork::new(test_config("unit-flaky"), RawProtocol).unwrap();
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        std_listener.set_nonblocking(true).unwrap();
        let inner = {
            let _entered = server.group.handle().enter();
            TcpListener::from_std(std_listener).unwrap()
        };

        let (tx, rx) = std::sync::mpsc::channel();
        server.on_accept(move |connection| {
            let _ = tx.send(connection.remote_address());
        });
        let address = server
            .start_with(FlakyListener {
                inner,
                failures: AtomicUsize::new(0),
            })
            .unwrap();

        let _client = std::net::TcpStream::connect(address).unwrap();
        rx.recv_timeout(Duration::from_secs(5))
            .expect("accept should recover after a transient error");
        server.shutdown();
    }

    #[test]
    fn test_start_scans_port_range() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = blocker.local_addr().unwrap().port();
        let config = test_config("unit-scan").with_port_range(taken..=taken.saturating_add(50));

        let server = ServerNetwork::new(config, RawProtocol).unwrap();
        let address = server.start().unwrap();
        assert_ne!(address.port(), taken);
        assert!(server.is_running());
        assert!(matches!(server.start(), Err(NetworkError::InvalidState(_))));

        server.shutdown();
        server.shutdown();
        assert!(!server.is_running());
    }

    #[test]
    fn test_connection_limit_rejects_extra_sockets() {
        let config = test_config("unit-limit").with_max_connections(1);
        let server = ServerNetwork::new(config, RawProtocol).unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        server.on_accept(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let address = server.start_on("127.0.0.1:0".parse().unwrap()).unwrap();

        let _first = std::net::TcpStream::connect(address).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let _second = std::net::TcpStream::connect(address).unwrap();
        std::thread::sleep(Duration::from_millis(200));

        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(server.connection_count(), 1);
        server.shutdown();
    }
}
