//! Client side: outbound connections

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use super::config::NetworkConfig;
use super::runtime::ThreadGroup;
use crate::buffer::{BufferAllocator, PooledBufferAllocator};
use crate::connection::{tune_socket, Connection, ConnectionContext};
use crate::error::{NetworkError, Result};
use crate::event::Subscription;
use crate::packet::Protocol;
#[cfg(feature = "tls")]
use crate::tls::TlsConfig;

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 30_000;

type Outcome<P> = Option<std::result::Result<Arc<Connection<P>>, Arc<NetworkError>>>;

struct ClientState<P: Protocol> {
    current: RwLock<Option<Arc<Connection<P>>>>,
    connecting: AtomicBool,
    /// Result slot of the attempt in flight, shared with racing callers
    in_flight: Mutex<Option<watch::Receiver<Outcome<P>>>>,
}

/// Client network holding at most one live connection
///
/// Connections run on the client's own thread group, so the network can be
/// driven from synchronous code through [`ClientNetwork::connect`] as well as
/// from async code.
pub struct ClientNetwork<P: Protocol> {
    context: ConnectionContext<P>,
    group: ThreadGroup,
    state: Arc<ClientState<P>>,
    #[cfg(feature = "tls")]
    tls: Option<TlsConfig>,
}

impl<P: Protocol> ClientNetwork<P> {
    /// Create a client with its own thread group and buffer pool
    pub fn new(config: NetworkConfig, protocol: P) -> Result<Self> {
        config.validate()?;
        config.validate_protocol(&protocol)?;
        let group = ThreadGroup::fixed(config.thread_group_name.clone(), config.thread_group_size)?;
        let allocator: Arc<dyn BufferAllocator> = Arc::new(PooledBufferAllocator::new(&config));
        let context = ConnectionContext::new(
            Arc::new(config),
            Arc::new(protocol),
            allocator,
            group.handle().clone(),
        );

        Ok(Self {
            context,
            group,
            state: Arc::new(ClientState {
                current: RwLock::new(None),
                connecting: AtomicBool::new(false),
                in_flight: Mutex::new(None),
            }),
            #[cfg(feature = "tls")]
            tls: None,
        })
    }

    /// Share a buffer allocator with other networks
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_allocator(mut self, allocator: Arc<dyn BufferAllocator>) -> Self {
        self.context.allocator = allocator;
        self
    }

    /// Secure every connection with the client side of `tls`
    #[cfg(feature = "tls")]
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    #[must_use]
    pub fn config(&self) -> &NetworkConfig {
        &self.context.config
    }

    /// Connection opened by the last successful connect
    #[must_use]
    pub fn current_connection(&self) -> Option<Arc<Connection<P>>> {
        self.state.current.read().clone()
    }

    /// Check if the current connection is open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state
            .current
            .read()
            .as_ref()
            .is_some_and(|connection| connection.is_open())
    }

    /// Check if a connect attempt is in flight
    #[must_use]
    pub fn is_connecting(&self) -> bool {
        self.state.connecting.load(Ordering::Acquire)
    }

    /// Connect and block until the attempt resolves.
    ///
    /// # Panics
    ///
    /// Panics when called from within an async context; use
    /// [`ClientNetwork::connect_async`] there.
    pub fn connect(&self, address: SocketAddr) -> Result<Arc<Connection<P>>> {
        self.group.block_on(self.connect_async(address))
    }

    /// Connect to `address`, replacing any current connection.
    ///
    /// Only one attempt runs at a time. Callers racing an attempt in flight
    /// get that attempt's result instead of opening a second socket.
    pub fn connect_async(
        &self,
        address: SocketAddr,
    ) -> impl Future<Output = Result<Arc<Connection<P>>>> + Send + 'static {
        let rx = self.start_attempt(address);
        async move {
            let Some(mut rx) = rx else {
                return Err(NetworkError::invalid_state("client network is shut down"));
            };
            let outcome = match rx.wait_for(Option::is_some).await {
                Ok(outcome) => outcome.clone(),
                Err(_) => None,
            };
            match outcome {
                Some(Ok(connection)) => Ok(connection),
                Some(Err(error)) => Err(error.duplicate()),
                None => Err(NetworkError::connection("connect attempt abandoned")),
            }
        }
    }

    /// Single-value stream carrying the outcome of [`ClientNetwork::connect_async`]
    pub fn connect_reactive(&self, address: SocketAddr) -> Subscription<Result<Arc<Connection<P>>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let attempt = self.connect_async(address);
        self.group.spawn(async move {
            let _ = tx.send(attempt.await);
        });
        Subscription::from_receiver(rx)
    }

    fn start_attempt(&self, address: SocketAddr) -> Option<watch::Receiver<Outcome<P>>> {
        if !self.group.is_running() {
            return None;
        }

        let mut in_flight = self.state.in_flight.lock();
        if let Some(rx) = in_flight.as_ref() {
            tracing::debug!("connect to {} joins the attempt in flight", address);
            return Some(rx.clone());
        }

        self.state.connecting.store(true, Ordering::Release);
        if let Some(previous) = self.state.current.write().take() {
            previous.close();
        }

        let (tx, rx) = watch::channel(None);
        *in_flight = Some(rx.clone());
        drop(in_flight);

        let state = Arc::clone(&self.state);
        let context = self.context.clone();
        #[cfg(feature = "tls")]
        let tls = self.tls.clone();
        self.group.spawn(async move {
            #[cfg(feature = "tls")]
            let result = connect_with_retry(&context, tls.as_ref(), address).await;
            #[cfg(not(feature = "tls"))]
            let result = connect_with_retry(&context, address).await;

            let outcome = match result {
                Ok(connection) => {
                    *state.current.write() = Some(Arc::clone(&connection));
                    Ok(connection)
                }
                Err(e) => {
                    tracing::warn!("connect to {} failed: {}", address, e);
                    Err(Arc::new(e))
                }
            };

            let mut in_flight = state.in_flight.lock();
            in_flight.take();
            state.connecting.store(false, Ordering::Release);
            tx.send_replace(Some(outcome));
        });
        Some(rx)
    }

    /// Close the current connection and stop the thread group. Idempotent.
    pub fn shutdown(&self) {
        if let Some(connection) = self.state.current.write().take() {
            connection.close();
        }
        if self.group.is_running() {
            tracing::info!("client network {} shutting down", self.group.name());
            self.group.shutdown();
        }
    }
}

impl<P: Protocol> Drop for ClientNetwork<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<P: Protocol> fmt::Debug for ClientNetwork<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientNetwork")
            .field("group", &self.group)
            .field("connected", &self.is_connected())
            .field("connecting", &self.is_connecting())
            .finish()
    }
}

/// Up to `max_connect_attempts` tries with exponential backoff and jitter
async fn connect_with_retry<P: Protocol>(
    context: &ConnectionContext<P>,
    #[cfg(feature = "tls")] tls: Option<&TlsConfig>,
    address: SocketAddr,
) -> Result<Arc<Connection<P>>> {
    let attempts = context.config.max_connect_attempts.max(1);
    let mut delay_ms = INITIAL_BACKOFF_MS;

    let mut attempt = 1;
    loop {
        #[cfg(feature = "tls")]
        let result = open(context, tls, address).await;
        #[cfg(not(feature = "tls"))]
        let result = open(context, address).await;

        match result {
            Ok(connection) => return Ok(connection),
            Err(e) if attempt < attempts => {
                let jitter = rand::thread_rng().gen_range(0..100);
                let pause = Duration::from_millis(delay_ms + jitter);
                tracing::debug!(
                    "connect attempt {}/{} to {} failed: {}; retrying in {:?}",
                    attempt,
                    attempts,
                    address,
                    e,
                    pause
                );
                tokio::time::sleep(pause).await;
                delay_ms = (delay_ms * 2).min(MAX_BACKOFF_MS);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn open<P: Protocol>(
    context: &ConnectionContext<P>,
    #[cfg(feature = "tls")] tls: Option<&TlsConfig>,
    address: SocketAddr,
) -> Result<Arc<Connection<P>>> {
    let connect_timeout = context.config.connect_timeout;
    let stream = timeout(connect_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| NetworkError::timeout(format!("Connection to {} timed out", address)))?
        .map_err(|e| NetworkError::connection(format!("Failed to connect to {}: {}", address, e)))?;
    tune_socket(&stream, &context.config)?;

    #[cfg(feature = "tls")]
    if let Some(tls) = tls {
        let connector = tls
            .connector()
            .ok_or_else(|| NetworkError::tls("client TLS context not configured"))?;
        let stream = timeout(
            connect_timeout,
            connector.connect(tls.server_name_for(&address), stream),
        )
        .await
        .map_err(|_| NetworkError::timeout(format!("TLS handshake with {} timed out", address)))?
        .map_err(|e| NetworkError::tls(format!("TLS handshake with {} failed: {}", address, e)))?;
        return Ok(Connection::secure(stream, address, context.clone()));
    }

    Connection::plain(stream, context.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::RawProtocol;

    #[test]
    fn test_connect_failure_leaves_no_connection() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let client = ClientNetwork::new(
            NetworkConfig::default().with_thread_group_name("unit-client"),
            RawProtocol,
        )
        .unwrap();
        assert!(client.connect(address).is_err());
        assert!(client.current_connection().is_none());
        assert!(!client.is_connecting());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = NetworkConfig::default().with_buffer_sizes(1024, 1024, 1024);
        assert!(ClientNetwork::new(config, RawProtocol).is_err());
    }

    #[test]
    fn test_connect_after_shutdown_fails() {
        let client = ClientNetwork::new(NetworkConfig::default(), RawProtocol).unwrap();
        client.shutdown();
        client.shutdown();
        let address: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(matches!(
            client.connect(address),
            Err(NetworkError::InvalidState(_))
        ));
    }
}
