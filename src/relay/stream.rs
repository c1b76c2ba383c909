//! Duplex endpoints the relay can pump between

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

/// A connected, already-authenticated byte stream.
///
/// The relay reads from one handle and writes to a clone of it on another
/// thread, so the stream must be cloneable into independent handles that
/// share the same underlying connection. `close` must unblock a reader
/// parked on any clone.
pub trait RelayStream: Read + Write + Send + 'static {
    /// Second handle to the same connection
    fn try_clone(&self) -> io::Result<Self>
    where
        Self: Sized;

    /// Shut down both directions of the connection
    fn close(&self) -> io::Result<()>;

    /// Human readable peer description for logs
    fn peer_label(&self) -> String {
        "stream".to_string()
    }
}

impl RelayStream for TcpStream {
    fn try_clone(&self) -> io::Result<Self> {
        TcpStream::try_clone(self)
    }

    fn close(&self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            // Peer already tore the connection down
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn peer_label(&self) -> String {
        self.peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "tcp:disconnected".to_string())
    }
}

#[cfg(unix)]
impl RelayStream for std::os::unix::net::UnixStream {
    fn try_clone(&self) -> io::Result<Self> {
        std::os::unix::net::UnixStream::try_clone(self)
    }

    fn close(&self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn peer_label(&self) -> String {
        match self.peer_addr() {
            Ok(addr) => match addr.as_pathname() {
                Some(path) => format!("unix:{}", path.display()),
                None => "unix:unnamed".to_string(),
            },
            Err(_) => "unix:disconnected".to_string(),
        }
    }
}
