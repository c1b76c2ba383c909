//! Local port forwarding
//!
//! Listens on a local TCP address and, for every accepted client, asks a
//! [`Connector`] for the far side of the tunnel before relaying the two.

use super::{Relay, RelayHandle, RelayStream};
use crate::error::{Result, TermCoreError};
use crate::sync::lock;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Opens the far side of a forwarded connection.
///
/// Local, remote and dynamic forwarding differ only in how this stream is
/// obtained; the session layer supplies the implementation.
pub trait Connector: Send + Sync + 'static {
    type Stream: RelayStream;

    /// Open a stream for the client connected from `client`
    fn connect(&self, client: SocketAddr) -> Result<Self::Stream>;
}

/// Connects straight to a fixed TCP target
#[derive(Debug, Clone)]
pub struct TcpConnector {
    target: String,
    timeout: Option<Duration>,
}

impl TcpConnector {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self, _client: SocketAddr) -> Result<TcpStream> {
        let stream = match self.timeout {
            None => TcpStream::connect(&self.target),
            Some(timeout) => {
                let addr = self
                    .target
                    .to_socket_addrs()
                    .map_err(|e| TermCoreError::connection(&self.target, e.to_string()))?
                    .next()
                    .ok_or_else(|| TermCoreError::connection(&self.target, "no address resolved"))?;
                TcpStream::connect_timeout(&addr, timeout)
            }
        }
        .map_err(|e| TermCoreError::connection(&self.target, e.to_string()))?;

        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

/// Accept loop relaying each client through a [`Connector`]
pub struct PortForwarder<C: Connector> {
    listener: TcpListener,
    connector: Arc<C>,
    relay: Relay,
    shutdown: Arc<AtomicBool>,
    accepted: Arc<AtomicU64>,
    relays: Arc<Mutex<Vec<RelayHandle>>>,
}

impl<C: Connector> PortForwarder<C> {
    /// Bind the local listening address
    pub fn bind(addr: &str, connector: C, relay: Relay) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).map_err(|e| TermCoreError::connection(addr, e.to_string()))?;

        Ok(Self {
            listener,
            connector: Arc::new(connector),
            relay,
            shutdown: Arc::new(AtomicBool::new(false)),
            accepted: Arc::new(AtomicU64::new(0)),
            relays: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| TermCoreError::io("reading listener address", e))
    }

    /// Get shutdown flag for external control
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Clients accepted so far
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Relays still pumping
    pub fn active_relays(&self) -> usize {
        let mut relays = lock(&self.relays);
        relays.retain(RelayHandle::is_alive);
        relays.len()
    }

    /// Accept clients until the shutdown flag is raised, then close every
    /// relay still running.
    pub fn run(&self) -> Result<()> {
        self.listener
            .set_nonblocking(true)
            .map_err(|e| TermCoreError::connection("listener", e.to_string()))?;

        tracing::info!(listen = %self.local_addr()?, "Port forwarding started");

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, client)) => {
                    self.accepted.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(%client, "Accepted forwarded connection");
                    self.spawn_client(stream, client);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    tracing::error!(error = %e, "Accept error");
                }
            }
        }

        let relays = std::mem::take(&mut *lock(&self.relays));
        tracing::info!(open = relays.len(), "Port forwarding stopping");
        for relay in relays {
            relay.close();
            relay.join();
        }
        Ok(())
    }

    /// Connect the far side off the accept thread so a slow target does
    /// not hold up other clients.
    fn spawn_client(&self, stream: TcpStream, client: SocketAddr) {
        let connector = Arc::clone(&self.connector);
        let relays = Arc::clone(&self.relays);
        let shutdown = Arc::clone(&self.shutdown);
        let relay = self.relay;

        let spawned = thread::Builder::new()
            .name("forward-connect".to_string())
            .spawn(move || {
                if let Err(e) = stream.set_nonblocking(false) {
                    tracing::warn!(%client, error = %e, "Dropping client");
                    return;
                }
                let _ = stream.set_nodelay(true);

                let peer = match connector.connect(client) {
                    Ok(peer) => peer,
                    Err(e) => {
                        tracing::warn!(%client, error = %e, "Forward target unavailable");
                        return;
                    }
                };

                match relay.forward(stream, peer) {
                    Ok(handle) => {
                        let mut relays = lock(&relays);
                        relays.retain(RelayHandle::is_alive);
                        if shutdown.load(Ordering::SeqCst) {
                            // Raced with shutdown; nobody will close it later
                            handle.close();
                        }
                        relays.push(handle);
                    }
                    Err(e) => tracing::warn!(%client, error = %e, "Relay failed to start"),
                }
            });

        if let Err(e) = spawned {
            tracing::error!(%client, error = %e, "Failed to spawn connection thread");
        }
    }
}
