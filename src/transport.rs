//! The I/O Transport: a plain-TCP/TLS-over-TCP sum type exposing a single
//! uniform surface to the `StreamClient`.
//!
//! Grounded in the teacher's `connection/socket.rs` (the `Socket` sum type
//! shape) and `connection/secure.rs` (the TLS read/write pump, here driven
//! to completion synchronously for the handshake per spec.md §4.B instead
//! of as a `Future`, since the client performs the handshake once, before
//! the async read loop arms).
//!
//! A transport is built by `connect_plain`/`connect_secure` as a plain
//! blocking std socket — this is the form `StreamClient`'s constructor and
//! its synchronous send/receive/check paths use, since spec.md §4.B and
//! §4.D both restrict synchronous I/O to "before the async loop has been
//! armed". `StreamClient::start` then calls `register` to hand the socket
//! to the reactor, after which all reads and writes go through the
//! non-blocking `Read`/`Write` impls the async read loop drives.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream as StdTcpStream};
use std::sync::Arc;
use std::time::Duration;

use rustls::{ClientConfig, ClientSession, Session};
use tokio_core::net::TcpStream as TokioTcpStream;
use tokio_core::reactor::Handle;
use tokio_io::AsyncWrite;

use crate::error::ClientError;

/// Socket read/send timeout applied at the OS level (spec.md §4.B default).
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(15);

/// Hides plain vs. TLS transport details behind one type.
pub struct Transport {
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    kind: Kind,
}

enum Kind {
    Plain(Socket),
    Secure(Box<SecureStream>),
}

/// The raw byte pipe, before or after reactor registration. `connect_plain`
/// and `connect_secure` always produce `Socket::Blocking`; `register`
/// consumes it into `Socket::Async`.
enum Socket {
    Blocking(StdTcpStream),
    Async(TokioTcpStream),
}

impl Socket {
    fn register(self, handle: &Handle) -> Result<Socket, ClientError> {
        match self {
            Socket::Blocking(std_stream) => {
                let tcp = TokioTcpStream::from_stream(std_stream, handle).map_err(ClientError::Connect)?;
                Ok(Socket::Async(tcp))
            }
            already @ Socket::Async(_) => Ok(already),
        }
    }

    fn native_handle(&self) -> RawHandle {
        match *self {
            Socket::Blocking(ref s) => raw_handle_of_std(s),
            Socket::Async(ref s) => raw_handle_of_async(s),
        }
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match *self {
            Socket::Blocking(ref s) => s.shutdown(how),
            Socket::Async(ref s) => s.shutdown(how),
        }
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match *self {
            Socket::Blocking(ref mut s) => s.read(buf),
            Socket::Async(ref mut s) => s.read(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match *self {
            Socket::Blocking(ref mut s) => s.write(buf),
            Socket::Async(ref mut s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match *self {
            Socket::Blocking(ref mut s) => s.flush(),
            Socket::Async(ref mut s) => s.flush(),
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind {
            Kind::Plain(_) => "Plain",
            Kind::Secure(_) => "Secure",
        };
        f.debug_struct("Transport")
            .field("kind", &kind)
            .field("peer", &self.peer_addr)
            .field("local", &self.local_addr)
            .finish()
    }
}

impl Transport {
    /// Synchronous DNS resolution followed by iterative connect (spec.md
    /// §4.B): dials each candidate address in turn, returning the last
    /// system error if none succeed. Returns a blocking transport, ready
    /// for pre-`start` synchronous exchanges; call `register` before
    /// arming the async read loop.
    pub fn connect_plain(host: &str, port: u16) -> Result<Transport, ClientError> {
        let std_stream = dial(host, port)?;
        apply_socket_options(&std_stream, DEFAULT_SOCKET_TIMEOUT, DEFAULT_SOCKET_TIMEOUT);
        let peer_addr = std_stream.peer_addr().map_err(ClientError::Connect)?;
        let local_addr = std_stream.local_addr().map_err(ClientError::Connect)?;
        Ok(Transport {
            peer_addr,
            local_addr,
            kind: Kind::Plain(Socket::Blocking(std_stream)),
        })
    }

    /// As `connect_plain`, but performs a client-mode TLS handshake
    /// synchronously immediately after the TCP connect completes and
    /// before the transport is handed back. Peer verification is
    /// disabled: the application layer performs its own credential checks
    /// (spec.md §4.B).
    pub fn connect_secure(host: &str, port: u16, config: &Arc<ClientConfig>) -> Result<Transport, ClientError> {
        let mut std_stream = dial(host, port)?;
        apply_socket_options(&std_stream, DEFAULT_SOCKET_TIMEOUT, DEFAULT_SOCKET_TIMEOUT);
        let peer_addr = std_stream.peer_addr().map_err(ClientError::Connect)?;
        let local_addr = std_stream.local_addr().map_err(ClientError::Connect)?;

        let mut session = ClientSession::new(config, host);
        handshake_blocking(&mut std_stream, &mut session).map_err(ClientError::Connect)?;

        let secure = SecureStream {
            socket: Socket::Blocking(std_stream),
            session,
        };
        Ok(Transport {
            peer_addr,
            local_addr,
            kind: Kind::Secure(Box::new(secure)),
        })
    }

    /// Hands the transport to the reactor, converting its blocking socket
    /// into a non-blocking, readiness-notified one. Called once, from
    /// `StreamClient::start`, immediately before the first read is armed.
    pub fn register(self, handle: &Handle) -> Result<Transport, ClientError> {
        let kind = match self.kind {
            Kind::Plain(socket) => Kind::Plain(socket.register(handle)?),
            Kind::Secure(mut secure) => {
                secure.socket = secure.socket.register(handle)?;
                Kind::Secure(secure)
            }
        };
        Ok(Transport { kind, ..self })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn native_handle(&self) -> RawHandle {
        match self.kind {
            Kind::Plain(ref s) => s.native_handle(),
            Kind::Secure(ref s) => s.socket.native_handle(),
        }
    }

    pub fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        match self.kind {
            Kind::Plain(ref s) => s.shutdown(how),
            Kind::Secure(ref s) => s.socket.shutdown(how),
        }
    }

    pub fn close(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.kind {
            Kind::Plain(ref mut s) => s.read(buf),
            Kind::Secure(ref mut s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.kind {
            Kind::Plain(ref mut s) => s.write(buf),
            Kind::Secure(ref mut s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.kind {
            Kind::Plain(ref mut s) => s.flush(),
            Kind::Secure(ref mut s) => s.flush(),
        }
    }
}

impl AsyncWrite for Transport {
    fn shutdown(&mut self) -> ::futures::Poll<(), io::Error> {
        match self.kind {
            Kind::Plain(Socket::Async(ref mut tcp)) => AsyncWrite::shutdown(tcp),
            Kind::Plain(Socket::Blocking(_)) => Ok(::futures::Async::Ready(())),
            Kind::Secure(ref mut s) => s.shutdown_async(),
        }
    }
}

fn dial(host: &str, port: u16) -> Result<StdTcpStream, ClientError> {
    StdTcpStream::connect((host, port)).map_err(ClientError::Connect)
}

/// `SO_RCVTIMEO`/`SO_SNDTIMEO` and `TCP_NODELAY`, set the way
/// `NetworkStreamClient::Start` does: failures to set a timeout are logged,
/// not fatal.
fn apply_socket_options(stream: &StdTcpStream, recv: Duration, send: Duration) {
    if let Err(e) = stream.set_read_timeout(Some(recv)) {
        warn!("failed to set SO_RCVTIMEO: {}", e);
    }
    if let Err(e) = stream.set_write_timeout(Some(send)) {
        warn!("failed to set SO_SNDTIMEO: {}", e);
    }
    if let Err(e) = stream.set_nodelay(true) {
        warn!("failed to set TCP_NODELAY: {}", e);
    }
}

/// Drives the TLS handshake to completion on a blocking std socket, ahead
/// of handing the fd to the reactor.
fn handshake_blocking(tcp: &mut StdTcpStream, session: &mut ClientSession) -> io::Result<()> {
    while session.is_handshaking() {
        if session.wants_write() {
            session.write_tls(tcp)?;
        }
        if session.wants_read() {
            let n = session.read_tls(tcp)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed during TLS handshake",
                ));
            }
            session
                .process_new_packets()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        }
    }
    if session.wants_write() {
        session.write_tls(tcp)?;
    }
    Ok(())
}

/// A TLS-over-TCP stream. The TLS record pump (`read_tls`/`write_tls`
/// wrapped around `process_new_packets`) is grounded in the teacher's
/// `connection/secure.rs::SecureStream`; here the handshake runs to
/// completion synchronously on the blocking std socket (via
/// `handshake_blocking`, before this type is built) and ongoing I/O runs
/// non-blocking once the read loop takes over.
struct SecureStream {
    socket: Socket,
    session: ClientSession,
}

impl SecureStream {
    /// Pumps one `read_tls` off the wire into the TLS session, distinguishing
    /// "no TCP-level read happened" from "a TCP-level read happened and
    /// returned 0 bytes" (a genuine peer-initiated close) the way the
    /// teacher's `connection/secure.rs::read_tcp_to_session` does: returns
    /// `Ok(None)` only when no read was attempted or it would have blocked,
    /// and `Ok(Some(n))` -- `n` possibly 0 -- whenever the wire was actually
    /// read. `Read::read` uses that distinction to tell "nothing new yet"
    /// apart from "the peer hung up".
    fn pump_read(&mut self) -> io::Result<Option<usize>> {
        if !self.session.wants_read() {
            return Ok(None);
        }
        match self.session.read_tls(&mut self.socket) {
            Ok(0) => Ok(Some(0)),
            Ok(n) => {
                self.session
                    .process_new_packets()
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                Ok(Some(n))
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn pump_write(&mut self) -> io::Result<()> {
        while self.session.wants_write() {
            match self.session.write_tls(&mut self.socket) {
                Ok(0) => break,
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn shutdown_async(&mut self) -> ::futures::Poll<(), io::Error> {
        self.session.send_close_notify();
        self.pump_write()?;
        Ok(::futures::Async::Ready(()))
    }
}

impl Read for SecureStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // `read_ok` records whether the wire was actually read this call
        // (even for 0 bytes, a genuine EOF) as opposed to no read being
        // attempted or it blocking. Only when nothing was read off the wire
        // does a 0-length plaintext result mean "try again later"; when the
        // wire really did return EOF, 0 must propagate as `Ok(0)` so the
        // read loop's `Ok(0) => disconnect` branch fires instead of spinning
        // on `WouldBlock` forever.
        let read_ok = self.pump_read()?.is_some();
        let n = self.session.read(buf)?;
        if !read_ok && n == 0 {
            Err(io::ErrorKind::WouldBlock.into())
        } else {
            Ok(n)
        }
    }
}

impl Write for SecureStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.session.write(buf)?;
        self.pump_write()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.session.flush()?;
        self.socket.flush()
    }
}

#[cfg(unix)]
pub type RawHandle = ::std::os::unix::io::RawFd;
#[cfg(unix)]
fn raw_handle_of_std(tcp: &StdTcpStream) -> RawHandle {
    use std::os::unix::io::AsRawFd;
    tcp.as_raw_fd()
}
#[cfg(unix)]
fn raw_handle_of_async(tcp: &TokioTcpStream) -> RawHandle {
    use std::os::unix::io::AsRawFd;
    tcp.as_raw_fd()
}

#[cfg(windows)]
pub type RawHandle = ::std::os::windows::io::RawSocket;
#[cfg(windows)]
fn raw_handle_of_std(tcp: &StdTcpStream) -> RawHandle {
    use std::os::windows::io::AsRawSocket;
    tcp.as_raw_socket()
}
#[cfg(windows)]
fn raw_handle_of_async(tcp: &TokioTcpStream) -> RawHandle {
    use std::os::windows::io::AsRawSocket;
    tcp.as_raw_socket()
}
