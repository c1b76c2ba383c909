//! Bidirectional byte relay
//!
//! Bridges two connected streams with one pump thread per direction, the
//! way a forwarded port joins a local socket to a tunnelled channel. The
//! relay has no protocol awareness and keeps nothing beyond the chunk in
//! flight. When either pump stops (end of stream or I/O error) both
//! endpoints are closed, which in turn stops the other pump. Nothing is
//! retried; reconnecting is the caller's business.

mod forward;
mod stream;

pub use forward::{Connector, PortForwarder, TcpConnector};
pub use stream::RelayStream;

use crate::config::{RelayConfig, DEFAULT_RELAY_BUFFER_SIZE};
use crate::error::{Result, TermCoreError};
use crate::sync::lock;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type CloseFn = Box<dyn Fn() + Send + Sync>;

/// Starts relays between pairs of streams
#[derive(Debug, Clone, Copy)]
pub struct Relay {
    buffer_size: usize,
}

impl Relay {
    /// Relay pumping `buffer_size` bytes per read; clamped to at least one
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.buffer_size)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Start pumping bytes between `a` and `b` in both directions.
    ///
    /// Returns once both pump threads are running. If the second thread
    /// cannot be spawned the first one is stopped by closing both streams.
    pub fn forward<A, B>(&self, a: A, b: B) -> Result<RelayHandle>
    where
        A: RelayStream,
        B: RelayStream,
    {
        let label = format!("{} <-> {}", a.peer_label(), b.peer_label());
        let a_reader = a.try_clone().map_err(|e| TermCoreError::io("cloning relay endpoint A", e))?;
        let b_reader = b.try_clone().map_err(|e| TermCoreError::io("cloning relay endpoint B", e))?;
        let a_ctl = Mutex::new(a.try_clone().map_err(|e| TermCoreError::io("cloning relay endpoint A", e))?);
        let b_ctl = Mutex::new(b.try_clone().map_err(|e| TermCoreError::io("cloning relay endpoint B", e))?);

        let closers: Vec<CloseFn> = vec![
            Box::new(move || {
                if let Err(e) = lock(&a_ctl).close() {
                    tracing::debug!(error = %e, "Closing relay endpoint A failed");
                }
            }),
            Box::new(move || {
                if let Err(e) = lock(&b_ctl).close() {
                    tracing::debug!(error = %e, "Closing relay endpoint B failed");
                }
            }),
        ];

        let shared = Arc::new(RelayShared {
            label,
            closed: AtomicBool::new(false),
            a_to_b: AtomicU64::new(0),
            b_to_a: AtomicU64::new(0),
            live_pumps: AtomicUsize::new(2),
            closers,
        });

        let a2b = spawn_pump("relay-a2b", a_reader, b, self.buffer_size, &shared, Direction::AToB);
        let a2b = match a2b {
            Ok(handle) => handle,
            Err(e) => {
                shared.close_both();
                return Err(e);
            }
        };
        let b2a = match spawn_pump("relay-b2a", b_reader, a, self.buffer_size, &shared, Direction::BToA) {
            Ok(handle) => handle,
            Err(e) => {
                shared.close_both();
                let _ = a2b.join();
                return Err(e);
            }
        };

        tracing::debug!(relay = %shared.label, buffer_size = self.buffer_size, "Relay started");
        Ok(RelayHandle {
            shared,
            pumps: vec![a2b, b2a],
            started: Instant::now(),
        })
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(DEFAULT_RELAY_BUFFER_SIZE)
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    AToB,
    BToA,
}

struct RelayShared {
    label: String,
    closed: AtomicBool,
    a_to_b: AtomicU64,
    b_to_a: AtomicU64,
    live_pumps: AtomicUsize,
    closers: Vec<CloseFn>,
}

impl RelayShared {
    fn counter(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::AToB => &self.a_to_b,
            Direction::BToA => &self.b_to_a,
        }
    }

    /// Close both endpoints once
    fn close_both(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for close in &self.closers {
            close();
        }
    }
}

fn spawn_pump<R, W>(
    name: &str,
    from: R,
    to: W,
    buffer_size: usize,
    shared: &Arc<RelayShared>,
    direction: Direction,
) -> Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let shared = Arc::clone(shared);
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let result = pump(from, to, buffer_size, shared.counter(direction));
            match result {
                Ok(bytes) => {
                    tracing::debug!(relay = %shared.label, ?direction, bytes, "Relay pump reached end of stream");
                }
                Err(e) => {
                    tracing::debug!(relay = %shared.label, ?direction, error = %e, "Relay pump stopped");
                }
            }
            shared.close_both();
            shared.live_pumps.fetch_sub(1, Ordering::SeqCst);
        })
        .map_err(|e| TermCoreError::ThreadPool(format!("failed to spawn {name}: {e}")))
}

/// Copy until end of stream, flushing after every chunk
fn pump<R: Read, W: Write>(
    mut from: R,
    mut to: W,
    buffer_size: usize,
    counter: &AtomicU64,
) -> io::Result<u64> {
    let mut buffer = vec![0u8; buffer_size];
    let mut total = 0u64;
    loop {
        let n = match from.read(&mut buffer) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        to.write_all(&buffer[..n])?;
        to.flush()?;
        total += n as u64;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Running relay between two endpoints
pub struct RelayHandle {
    shared: Arc<RelayShared>,
    pumps: Vec<JoinHandle<()>>,
    started: Instant,
}

impl RelayHandle {
    /// At least one pump is still running
    pub fn is_alive(&self) -> bool {
        self.shared.live_pumps.load(Ordering::SeqCst) > 0
    }

    pub fn bytes_a_to_b(&self) -> u64 {
        self.shared.a_to_b.load(Ordering::Relaxed)
    }

    pub fn bytes_b_to_a(&self) -> u64 {
        self.shared.b_to_a.load(Ordering::Relaxed)
    }

    /// Peers joined by this relay
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Tear the relay down by closing both endpoints
    pub fn close(&self) {
        self.shared.close_both();
    }

    /// Wait for both pumps to stop
    pub fn join(self) -> RelayStats {
        for pump in self.pumps {
            if pump.join().is_err() {
                tracing::warn!(relay = %self.shared.label, "Relay pump panicked");
            }
        }
        RelayStats {
            bytes_a_to_b: self.shared.a_to_b.load(Ordering::Relaxed),
            bytes_b_to_a: self.shared.b_to_a.load(Ordering::Relaxed),
            duration: self.started.elapsed(),
        }
    }
}

impl std::fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHandle")
            .field("label", &self.shared.label)
            .field("alive", &self.is_alive())
            .field("bytes_a_to_b", &self.bytes_a_to_b())
            .field("bytes_b_to_a", &self.bytes_b_to_a())
            .finish()
    }
}

/// Totals of a finished relay
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelayStats {
    pub bytes_a_to_b: u64,
    pub bytes_b_to_a: u64,
    pub duration: Duration,
}

impl RelayStats {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_a_to_b + self.bytes_b_to_a
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    /// Connected pair: (client side, server side)
    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_bytes_then_eof() {
        let (mut peer_a, relay_a) = tcp_pair();
        let (mut peer_b, relay_b) = tcp_pair();
        let handle = Relay::default().forward(relay_a, relay_b).unwrap();

        peer_a.write_all(&[0x01, 0x02, 0x03]).unwrap();
        drop(peer_a);

        let mut received = Vec::new();
        peer_b.read_to_end(&mut received).unwrap();
        assert_eq!(received, vec![0x01, 0x02, 0x03]);

        drop(peer_b);
        let stats = handle.join();
        assert_eq!(stats.bytes_a_to_b, 3);
        assert_eq!(stats.bytes_b_to_a, 0);
    }

    #[test]
    fn test_both_directions() {
        let (mut peer_a, relay_a) = tcp_pair();
        let (mut peer_b, relay_b) = tcp_pair();
        let handle = Relay::new(4).forward(relay_a, relay_b).unwrap();

        peer_a.write_all(b"ping from a").unwrap();
        let mut buf = [0u8; 11];
        peer_b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping from a");

        peer_b.write_all(b"pong").unwrap();
        let mut buf = [0u8; 4];
        peer_a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");

        assert!(handle.is_alive());
        assert_eq!(handle.bytes_a_to_b(), 11);
        assert_eq!(handle.bytes_b_to_a(), 4);

        handle.close();
        let stats = handle.join();
        assert_eq!(stats.total_bytes(), 15);
    }

    #[test]
    fn test_close_stops_both_pumps() {
        let (mut peer_a, relay_a) = tcp_pair();
        let (mut peer_b, relay_b) = tcp_pair();
        let handle = Relay::default().forward(relay_a, relay_b).unwrap();

        handle.close();

        // Both outer peers observe the teardown
        let mut buf = Vec::new();
        assert_eq!(peer_a.read_to_end(&mut buf).unwrap_or(0), 0);
        assert_eq!(peer_b.read_to_end(&mut buf).unwrap_or(0), 0);

        handle.join();
    }

    #[test]
    fn test_independent_relays() {
        let (a1, r1a) = tcp_pair();
        let (mut b1, r1b) = tcp_pair();
        let (mut a2, r2a) = tcp_pair();
        let (mut b2, r2b) = tcp_pair();
        let relay = Relay::default();
        let first = relay.forward(r1a, r1b).unwrap();
        let second = relay.forward(r2a, r2b).unwrap();

        // Tearing down one relay leaves the other working
        drop(a1);
        let mut sink = Vec::new();
        b1.read_to_end(&mut sink).unwrap();
        first.join();

        a2.write_all(b"still here").unwrap();
        let mut buf = [0u8; 10];
        b2.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"still here");
        assert!(second.is_alive());
        second.close();
        second.join();
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_streams() {
        use std::os::unix::net::UnixStream;

        let (mut peer_a, relay_a) = UnixStream::pair().unwrap();
        let (mut peer_b, relay_b) = UnixStream::pair().unwrap();
        let handle = Relay::default().forward(relay_a, relay_b).unwrap();

        peer_a.write_all(b"over unix").unwrap();
        peer_a.shutdown(std::net::Shutdown::Write).unwrap();

        let mut received = Vec::new();
        peer_b.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"over unix");
        handle.join();
    }
}
