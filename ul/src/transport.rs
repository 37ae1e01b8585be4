//! Transport abstraction
//!
//! An association runs over any duplex byte stream implementing [`Transport`].
//! Streams are created by a [`TransportFactory`],
//! which is where plain TCP and encrypted connections differ.
//! [`TcpTransportFactory`] provides plain TCP connections.
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

/// A duplex byte stream on which an association can run.
///
/// The association keeps one handle for writing
/// and gives a cloned handle to its reader,
/// so implementations must support independent cloned handles
/// over the same connection.
pub trait Transport: Read + Write + Send + Sync {
    /// Create another handle to the same underlying connection.
    fn try_clone_transport(&self) -> io::Result<Box<dyn Transport>>;

    /// Set the read timeout of the stream.
    /// `None` blocks reads indefinitely.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Set the write timeout of the stream.
    /// `None` blocks writes indefinitely.
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Shut down both directions of the connection,
    /// unblocking any pending reads and writes on other handles.
    fn shutdown(&self) -> io::Result<()>;

    /// The address of the remote peer, if known.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl Transport for TcpStream {
    fn try_clone_transport(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

/// A factory of connected transports.
///
/// Implement this trait to plug in encrypted connections
/// or any other byte stream.
pub trait TransportFactory {
    /// Open a new connection to the given host and port.
    fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn Transport>>;
}

impl<T: ?Sized + TransportFactory> TransportFactory for &T {
    fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn Transport>> {
        (**self).connect(host, port)
    }
}

/// Factory of plain TCP connections.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct TcpTransportFactory {
    connection_timeout: Option<Duration>,
    nodelay: bool,
}

impl TcpTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the time spent establishing each TCP connection.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Set `TCP_NODELAY` on every new connection.
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    fn connect_stream(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let Some(timeout) = self.connection_timeout else {
            return TcpStream::connect((host, port));
        };

        // try every resolved address, keeping the last error
        let mut last_error = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "could not resolve to any address",
            )
        }))
    }
}

impl TransportFactory for TcpTransportFactory {
    fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn Transport>> {
        let stream = self.connect_stream(host, port)?;
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        debug!("Connected to {}:{}", host, port);
        Ok(Box::new(stream))
    }
}
