//! Listening sockets and the serving loop.
//!
//! Readiness-based model: a single mio poll watches every bound socket plus
//! a waker used by the control channel. Each ready socket is drained with
//! blocking-style single units of work:
//! - TCP: accept, write the whole quote, close
//! - UDP: receive a datagram, reply to its source with one `send_to`

use crate::config::{Connection, Family};
use mio::net::{TcpListener, UdpSocket};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Write};
use std::net::{self, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Token reserved for the control waker.
pub const WAKER_TOKEN: Token = Token(usize::MAX);

/// Pending connection backlog for TCP sockets.
const TCP_BACKLOG: i32 = 50;

/// A client that stops reading cannot hold the loop longer than this.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Produces the bytes sent to each client.
pub trait QuoteSource {
    /// Render the next quote, or `None` if there is nothing to send.
    fn next_quote(&mut self) -> Option<&[u8]>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Tcp,
    Udp,
}

/// A bound (and for TCP, listening) non-blocking socket.
#[derive(Debug)]
pub enum BoundSocket {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

impl BoundSocket {
    /// Create, configure and bind one socket.
    pub fn bind(kind: SocketKind, family: Family, port: u16) -> Result<Self, ListenerError> {
        let addr: SocketAddr = match family {
            Family::Ipv4 => (Ipv4Addr::UNSPECIFIED, port).into(),
            Family::Ipv6 | Family::Both => (Ipv6Addr::UNSPECIFIED, port).into(),
        };

        let label = match family {
            Family::Ipv4 => "IPv4",
            Family::Ipv6 => "IPv6",
            Family::Both => "IPv4/6",
        };
        info!(kind = ?kind, family = label, %addr, "Setting up socket");

        Self::create(kind, family, addr).map_err(|source| ListenerError::Bind { kind, addr, source })
    }

    fn create(kind: SocketKind, family: Family, addr: SocketAddr) -> io::Result<Self> {
        let (ty, protocol) = match kind {
            SocketKind::Tcp => (Type::STREAM, Protocol::TCP),
            SocketKind::Udp => (Type::DGRAM, Protocol::UDP),
        };

        let socket = Socket::new(Domain::for_address(addr), ty, Some(protocol))?;

        if family != Family::Ipv4 {
            socket.set_only_v6(family == Family::Ipv6)?;
        }

        if let Err(e) = socket.set_reuse_address(true) {
            warn!(error = %e, "Unable to set the socket to allow address reuse");
        }

        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        match kind {
            SocketKind::Tcp => {
                socket.listen(TCP_BACKLOG)?;
                Ok(BoundSocket::Tcp(TcpListener::from_std(socket.into())))
            }
            SocketKind::Udp => Ok(BoundSocket::Udp(UdpSocket::from_std(socket.into()))),
        }
    }

    pub fn kind(&self) -> SocketKind {
        match self {
            BoundSocket::Tcp(_) => SocketKind::Tcp,
            BoundSocket::Udp(_) => SocketKind::Udp,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            BoundSocket::Tcp(listener) => listener.local_addr(),
            BoundSocket::Udp(socket) => socket.local_addr(),
        }
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        match self {
            BoundSocket::Tcp(listener) => registry.register(listener, token, Interest::READABLE),
            BoundSocket::Udp(socket) => registry.register(socket, token, Interest::READABLE),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            BoundSocket::Tcp(listener) => registry.deregister(listener),
            BoundSocket::Udp(socket) => registry.deregister(socket),
        }
    }

    /// Perform one unit of work on this socket.
    pub fn serve_once(&self, source: &mut dyn QuoteSource) -> Result<Outcome, ListenerError> {
        match self {
            BoundSocket::Tcp(listener) => serve_tcp(listener, source),
            BoundSocket::Udp(socket) => serve_udp(socket, source),
        }
    }

    /// Serve until the socket would block.
    pub fn serve_ready(&self, source: &mut dyn QuoteSource) -> Result<usize, ListenerError> {
        let mut served = 0;
        loop {
            match self.serve_once(source)? {
                Outcome::Idle => return Ok(served),
                Outcome::Served => served += 1,
                Outcome::NoQuote | Outcome::Failed => {}
            }
        }
    }
}

/// Result of a single unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A quote was delivered to a client.
    Served,
    /// A client was handled but there was no quote to send.
    NoQuote,
    /// The client interaction failed; the error was logged.
    Failed,
    /// Nothing pending on the socket.
    Idle,
}

fn serve_tcp(listener: &TcpListener, source: &mut dyn QuoteSource) -> Result<Outcome, ListenerError> {
    let (stream, peer) = match listener.accept() {
        Ok(accepted) => accepted,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Outcome::Idle),
        Err(e) => return recover("accept", e),
    };

    debug!(%peer, "New connection");

    // Accepted streams come out non-blocking; a quote is written in one go.
    let mut stream = net::TcpStream::from(stream);
    if let Err(e) = stream
        .set_nonblocking(false)
        .and_then(|_| stream.set_write_timeout(Some(WRITE_TIMEOUT)))
    {
        return recover("configure", e);
    }

    let Some(quote) = source.next_quote() else {
        debug!(%peer, "Closing connection without a quote");
        return Ok(Outcome::NoQuote);
    };

    if let Err(e) = stream.write_all(quote) {
        return recover("write", e);
    }

    if let Err(e) = stream.shutdown(Shutdown::Write) {
        debug!(%peer, error = %e, "Unable to shut down connection");
    }

    debug!(%peer, bytes = quote.len(), "Sent quote");
    Ok(Outcome::Served)
}

fn serve_udp(socket: &UdpSocket, source: &mut dyn QuoteSource) -> Result<Outcome, ListenerError> {
    // The payload is irrelevant, only the sender's address is needed.
    let peer = match socket.recv_from(&mut []) {
        Ok((_, peer)) => peer,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Outcome::Idle),
        Err(e) => return recover("receive", e),
    };

    debug!(%peer, "New datagram");

    let Some(quote) = source.next_quote() else {
        debug!(%peer, "No quote to send");
        return Ok(Outcome::NoQuote);
    };

    match socket.send_to(quote, peer) {
        Ok(sent) if sent < quote.len() => {
            warn!(%peer, sent, bytes = quote.len(), "Partial datagram sent");
            Ok(Outcome::Served)
        }
        Ok(sent) => {
            debug!(%peer, bytes = sent, "Sent quote");
            Ok(Outcome::Served)
        }
        Err(e) => recover("send", e),
    }
}

/// Log a per-client error and decide whether serving can go on.
fn recover(op: &'static str, error: io::Error) -> Result<Outcome, ListenerError> {
    if is_fatal(&error) {
        error!(op, error = %error, "Fatal socket error");
        Err(ListenerError::Fatal { op, source: error })
    } else {
        warn!(op, error = %error, "Client interaction failed");
        Ok(Outcome::Failed)
    }
}

/// Socket errors after which remaking the socket is not expected to help.
pub fn is_fatal(error: &io::Error) -> bool {
    error.raw_os_error().is_some_and(is_fatal_errno)
}

fn is_fatal_errno(code: i32) -> bool {
    #[cfg(target_os = "linux")]
    if code == libc::ENOSR {
        return true;
    }

    matches!(
        code,
        libc::EBADF
            | libc::EFAULT
            | libc::EINVAL
            | libc::EMFILE
            | libc::ENFILE
            | libc::ENOBUFS
            | libc::ENOMEM
            | libc::ENOTSOCK
            | libc::EOPNOTSUPP
            | libc::EPROTO
            | libc::EPERM
            | libc::ESOCKTNOSUPPORT
            | libc::EPROTONOSUPPORT
    )
}

/// Listener lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Unbound,
    Bound,
    Serving,
    Closed,
}

/// Owner of the poll instance and the bound socket set.
pub struct Listener {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    sockets: Slab<BoundSocket>,
    connection: Option<Connection>,
    state: ListenerState,
}

impl Listener {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(Listener {
            poll,
            events: Events::with_capacity(64),
            waker,
            sockets: Slab::new(),
            connection: None,
            state: ListenerState::Unbound,
        })
    }

    /// Waker that interrupts a blocked `poll_once`.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Bind one socket per requested transport.
    ///
    /// Any previously bound sockets are closed first. On error nothing
    /// stays bound.
    pub fn bind(&mut self, connection: Connection) -> Result<(), ListenerError> {
        self.close();

        let mut kinds = Vec::with_capacity(2);
        if connection.transport.tcp() {
            kinds.push(SocketKind::Tcp);
        }
        if connection.transport.udp() {
            kinds.push(SocketKind::Udp);
        }

        for kind in kinds {
            let mut socket = match BoundSocket::bind(kind, connection.family, connection.port) {
                Ok(socket) => socket,
                Err(e) => {
                    self.close();
                    return Err(e);
                }
            };

            let token = Token(self.sockets.vacant_key());
            if let Err(e) = socket.register(self.poll.registry(), token) {
                self.close();
                return Err(ListenerError::Poll(e));
            }
            self.sockets.insert(socket);
        }

        self.connection = Some(connection);
        self.state = ListenerState::Bound;
        Ok(())
    }

    /// Re-bind with new parameters, falling back to the previous ones.
    pub fn rebind(&mut self, connection: Connection) -> Result<(), ListenerError> {
        let previous = self.connection;

        match self.bind(connection) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "Unable to bind new sockets");
                match previous {
                    Some(previous) => {
                        warn!("Restoring previous sockets");
                        self.bind(previous)?;
                        Ok(())
                    }
                    None => Err(e),
                }
            }
        }
    }

    /// Close every socket. Safe to call more than once.
    pub fn close(&mut self) {
        for (_, socket) in self.sockets.iter_mut() {
            if let Err(e) = socket.deregister(self.poll.registry()) {
                debug!(error = %e, "Unable to deregister socket");
            }
        }

        if !self.sockets.is_empty() {
            info!(sockets = self.sockets.len(), "Closing sockets");
        }

        self.sockets.clear();
        self.connection = None;
        if self.state != ListenerState::Unbound {
            self.state = ListenerState::Closed;
        }
    }

    /// Block until sockets are ready, then serve them.
    ///
    /// Returns `true` when the control waker fired.
    pub fn poll_once(&mut self, source: &mut dyn QuoteSource) -> Result<bool, ListenerError> {
        self.state = ListenerState::Serving;

        match self.poll.poll(&mut self.events, None) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(false),
            Err(e) => return Err(ListenerError::Poll(e)),
        }

        let mut woken = false;
        for event in self.events.iter() {
            match event.token() {
                WAKER_TOKEN => woken = true,
                Token(key) => {
                    if let Some(socket) = self.sockets.get(key) {
                        socket.serve_ready(source)?;
                    }
                }
            }
        }

        Ok(woken)
    }

    pub fn connection(&self) -> Option<Connection> {
        self.connection
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn raw_fd(&self, kind: SocketKind) -> Option<std::os::unix::io::RawFd> {
        use std::os::unix::io::AsRawFd;

        self.sockets.iter().find_map(|(_, socket)| match socket {
            BoundSocket::Tcp(listener) if kind == SocketKind::Tcp => Some(listener.as_raw_fd()),
            BoundSocket::Udp(udp) if kind == SocketKind::Udp => Some(udp.as_raw_fd()),
            _ => None,
        })
    }

    pub fn local_addrs(&self) -> Vec<(SocketKind, SocketAddr)> {
        self.sockets
            .iter()
            .filter_map(|(_, socket)| socket.local_addr().ok().map(|addr| (socket.kind(), addr)))
            .collect()
    }
}

/// Listener errors
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Unable to bind {kind:?} socket on {addr}: {source}")]
    Bind {
        kind: SocketKind,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Fatal socket error during {op}: {source}")]
    Fatal {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("Poll error: {0}")]
    Poll(#[source] io::Error),
}
