//! TCP wrappers for mio-based I/O.
//!
//! Thin wrappers around [`mio::net::TcpListener`] and [`mio::net::TcpStream`]
//! with `try_*` APIs that surface `WouldBlock` as ordinary control flow.
//! All sockets are non-blocking; use with mio's [`Poll`] for readiness
//! notification.
//!
//! [`Poll`]: mio::Poll

use std::io::{self, ErrorKind, Read, Write};

use mio::event::Source;
use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use mio::{Interest, Registry, Token};

use super::Endpoint;

/// Read chunk size for draining a readable connection.
const READ_CHUNK: usize = 4096;

/// A non-blocking TCP listener.
pub struct Listener {
    inner: MioTcpListener,
}

impl Listener {
    /// Creates a new listener bound to the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound (e.g., address in use).
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        let inner = MioTcpListener::bind(endpoint.into())?;
        Ok(Self { inner })
    }

    /// Returns the local address this listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }

    /// Attempts to accept a pending connection, returning `Ok(None)` instead
    /// of `WouldBlock`.
    ///
    /// Call in a loop on each readiness event until it returns `None`.
    ///
    /// # Errors
    ///
    /// Returns an error on accept failure other than `WouldBlock`.
    pub fn try_accept(&self) -> io::Result<Option<(Conn, Endpoint)>> {
        match self.inner.accept() {
            Ok((stream, addr)) => Ok(Some((Conn { inner: stream }, Endpoint::from(addr)))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Source for Listener {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}

/// Outcome of draining a readable connection.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadStatus {
    /// The connection is still open; `n` bytes were appended before the
    /// socket would have blocked.
    Open(usize),
    /// The peer closed the connection. Bytes read before EOF (if any) have
    /// still been appended to the buffer.
    Closed,
}

/// A non-blocking TCP connection.
pub struct Conn {
    inner: MioTcpStream,
}

impl Conn {
    /// Returns the peer address of this connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer address cannot be retrieved.
    pub fn peer_addr(&self) -> io::Result<Endpoint> {
        self.inner.peer_addr().map(Endpoint::from)
    }

    /// Drains all currently available bytes into `buf`.
    ///
    /// Reads until the socket would block or the peer closes. Must be called
    /// on every readable event: mio's readiness is edge-triggered, so an
    /// incomplete drain loses the wakeup.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure other than `WouldBlock`.
    pub fn try_read(&mut self, buf: &mut Vec<u8>) -> io::Result<ReadStatus> {
        let mut total = 0;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.inner.read(&mut chunk) {
                Ok(0) => return Ok(ReadStatus::Closed),
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(ReadStatus::Open(total)),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Attempts to write, returning `Ok(None)` instead of `WouldBlock`.
    ///
    /// Useful in polling loops where `WouldBlock` is expected.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure other than `WouldBlock`.
    pub fn try_write(&mut self, buf: &[u8]) -> io::Result<Option<usize>> {
        match self.inner.write(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(Some(0)),
            Err(e) => Err(e),
        }
    }
}

impl Source for Conn {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    fn accept_within(listener: &Listener, timeout: Duration) -> (Conn, Endpoint) {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(accepted) = listener.try_accept().unwrap() {
                return accepted;
            }
            assert!(Instant::now() < deadline, "no connection within timeout");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn listener_bind_and_local_addr() {
        let listener = Listener::bind(Endpoint::localhost(0)).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_eq!(
            addr.ip(),
            std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
        );
        assert_ne!(addr.port(), 0); // OS assigned a port
    }

    #[test]
    fn try_accept_empty_returns_none() {
        let listener = Listener::bind(Endpoint::localhost(0)).unwrap();
        assert!(listener.try_accept().unwrap().is_none());
    }

    #[test]
    fn read_drains_available_bytes() {
        let listener = Listener::bind(Endpoint::localhost(0)).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut peer = TcpStream::connect(addr.as_socket_addr()).unwrap();
        let (mut conn, _) = accept_within(&listener, Duration::from_secs(1));

        peer.write_all(b"hello\n").unwrap();

        // The bytes may take a moment to land in the receive buffer.
        let mut buf = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(1);
        while buf.len() < 6 {
            match conn.try_read(&mut buf).unwrap() {
                ReadStatus::Open(_) => {}
                ReadStatus::Closed => panic!("peer should still be open"),
            }
            assert!(Instant::now() < deadline, "bytes never arrived");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(buf, b"hello\n");
    }

    #[test]
    fn read_reports_closed_after_peer_drop() {
        let listener = Listener::bind(Endpoint::localhost(0)).unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = TcpStream::connect(addr.as_socket_addr()).unwrap();
        let (mut conn, _) = accept_within(&listener, Duration::from_secs(1));
        drop(peer);

        let mut buf = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            match conn.try_read(&mut buf).unwrap() {
                ReadStatus::Closed => break,
                ReadStatus::Open(_) => {
                    assert!(Instant::now() < deadline, "close never observed");
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }
}
