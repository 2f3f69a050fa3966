//! Connection endpoints: one bidirectional byte stream per client, plus
//! construction of the shared listening socket.

use crate::error::RelayError;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};

/// Result of a single read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were placed at the front of the buffer.
    Data(usize),
    /// Non-blocking endpoint has nothing available right now.
    WouldBlock,
    /// Peer closed its side of the stream.
    EndOfStream,
}

/// A client byte stream.
///
/// Blocking endpoints block only the calling thread inside `read_chunk`.
/// Non-blocking endpoints return [`ReadOutcome::WouldBlock`] instead.
pub trait Endpoint: Read + Write {
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    fn shutdown(&self, how: Shutdown) -> io::Result<()>;

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, RelayError> {
        loop {
            match self.read(buf) {
                Ok(0) => return Ok(ReadOutcome::EndOfStream),
                Ok(n) => return Ok(ReadOutcome::Data(n)),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::WouldBlock)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RelayError::Transport(e)),
            }
        }
    }

    /// Release the stream. Safe to call more than once.
    fn close(&mut self) {
        let _ = self.shutdown(Shutdown::Both);
    }
}

impl Endpoint for std::net::TcpStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        std::net::TcpStream::peer_addr(self)
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        std::net::TcpStream::shutdown(self, how)
    }
}

impl Endpoint for mio::net::TcpStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        mio::net::TcpStream::peer_addr(self)
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        mio::net::TcpStream::shutdown(self, how)
    }
}

/// Create the listening socket.
///
/// `nonblocking` is set for the readiness-driven and async dispatchers.
pub fn bind_listener(
    addr: SocketAddr,
    backlog: i32,
    nonblocking: bool,
) -> Result<std::net::TcpListener, RelayError> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(RelayError::Listener)?;

    socket.set_reuse_address(true).map_err(RelayError::Listener)?;
    socket.set_nonblocking(nonblocking).map_err(RelayError::Listener)?;
    socket.bind(&addr.into()).map_err(RelayError::Listener)?;
    socket.listen(backlog).map_err(RelayError::Listener)?;

    Ok(socket.into())
}
