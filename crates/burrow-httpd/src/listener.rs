use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

const LISTEN_BACKLOG: i32 = 128;

/// One accepted client socket.
///
/// Owned by a single worker for exactly one request; dropping it closes the
/// socket.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    id: u64,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, id: u64) -> Self {
        Self { stream, peer, id }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Flush our half and close the socket.
    pub fn close(self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Write) {
            debug!("Connection {} shutdown: {}", self.id, e);
        }
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

/// Blocking TCP listener producing [`Connection`]s.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    read_timeout: Option<Duration>,
    next_id: u64,
}

impl Listener {
    pub fn bind(addr: SocketAddr, reuse_address: bool) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        if reuse_address {
            socket.set_reuse_address(true)?;
        }
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;

        Ok(Self {
            inner: socket.into(),
            read_timeout: None,
            next_id: 0,
        })
    }

    /// Apply `timeout` to reads on every accepted socket.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Wait for the next client.
    pub fn accept(&mut self) -> io::Result<Connection> {
        let (stream, peer) = self.inner.accept()?;
        stream.set_read_timeout(self.read_timeout)?;

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        debug!("Accepted connection {} from {}", id, peer);

        Ok(Connection::new(stream, peer, id))
    }
}
