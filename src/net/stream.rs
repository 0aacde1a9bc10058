//! Connected client sockets, optional TLS, and retrying I/O helpers.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::{Duration, Instant};

use rustls::ServerConnection;

/// Pause between retries after a would-block inside a started frame or write.
const RETRY_BACKOFF: Duration = Duration::from_millis(1);

/// A connected TCP or UNIX-domain socket.
#[derive(Debug)]
pub enum Socket {
    /// TCP over IPv4 or IPv6.
    Tcp(TcpStream),
    /// UNIX-domain stream socket.
    Unix(UnixStream),
}

impl Socket {
    /// Switches the socket between blocking and non-blocking mode.
    ///
    /// # Errors
    ///
    /// Propagates the OS error from `fcntl`.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.set_nonblocking(nonblocking),
            Self::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    /// Applies the same read and write timeout to a blocking socket.
    ///
    /// # Errors
    ///
    /// Propagates the OS error from `setsockopt`.
    pub fn set_timeouts(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Self::Tcp(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
            Self::Unix(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
        }
    }

    /// Human-readable remote address: `ip:port` for TCP, the socket path
    /// for UNIX-domain sockets.
    #[must_use]
    pub fn peer_address(&self) -> String {
        match self {
            Self::Tcp(s) => s
                .peer_addr()
                .map_or_else(|_| "unknown".to_string(), |a| a.to_string()),
            Self::Unix(s) => {
                let named = |addr: io::Result<std::os::unix::net::SocketAddr>| {
                    addr.ok()
                        .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                };
                named(s.peer_addr())
                    .or_else(|| named(s.local_addr()))
                    .unwrap_or_else(|| "unix:unnamed".to_string())
            }
        }
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Unix(s) => s.flush(),
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(s) => s.as_raw_fd(),
            Self::Unix(s) => s.as_raw_fd(),
        }
    }
}

/// A client byte stream: a socket, an optional TLS session on top of it, and
/// any bytes read ahead during the handshake that have not been consumed yet.
///
/// Dropping the stream sends a TLS `close_notify` (best-effort) and closes
/// the descriptor.
#[derive(Debug)]
pub struct Stream {
    socket: Socket,
    tls: Option<Box<ServerConnection>>,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl Stream {
    /// Wraps a plaintext socket.
    #[must_use]
    pub fn plain(socket: Socket) -> Self {
        Self {
            socket,
            tls: None,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    /// Wraps a socket whose TLS handshake has completed.
    #[must_use]
    pub fn tls(socket: Socket, session: ServerConnection) -> Self {
        Self {
            socket,
            tls: Some(Box::new(session)),
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    /// Returns `true` if reads and writes go through TLS.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Returns the underlying socket.
    #[must_use]
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Queues bytes that must be returned by `read` before anything else.
    pub fn push_pending(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        self.pending.drain(..self.pending_pos.min(self.pending.len()));
        self.pending_pos = 0;
        self.pending.extend_from_slice(&bytes);
    }

    /// Returns `true` if read-ahead bytes are waiting. The multiplexer will
    /// not report these, so the caller must read them explicitly.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending_pos < self.pending.len()
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.has_pending() {
            let mut rest = self.pending.get(self.pending_pos..).unwrap_or_default();
            let n = rest.read(buf)?;
            self.pending_pos += n;
            if !self.has_pending() {
                self.pending.clear();
                self.pending_pos = 0;
            }
            return Ok(n);
        }

        match &mut self.tls {
            Some(session) => rustls::Stream::new(session.as_mut(), &mut self.socket).read(buf),
            None => self.socket.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.tls {
            Some(session) => rustls::Stream::new(session.as_mut(), &mut self.socket).write(buf),
            None => self.socket.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.tls {
            Some(session) => rustls::Stream::new(session.as_mut(), &mut self.socket).flush(),
            None => self.socket.flush(),
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Some(session) = &mut self.tls {
            session.send_close_notify();
            let _ = session.write_tls(&mut self.socket);
        }
    }
}

/// How the engine reacts to an I/O error on a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoClass {
    /// Would-block or interrupted: try again later, no state change.
    Retry,
    /// The peer went away or the TLS session failed: drop the client.
    Disconnect,
    /// Anything else: the engine cannot continue.
    Fatal,
}

/// Classifies a client read error. Any non-transient failure on a TLS stream
/// is a disconnect.
#[must_use]
pub fn classify(err: &io::Error, tls: bool) -> IoClass {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => IoClass::Retry,
        _ if tls => IoClass::Disconnect,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::TimedOut => IoClass::Disconnect,
        _ => IoClass::Fatal,
    }
}

/// A reader that waits out would-block and interrupted errors until a
/// deadline, for finishing a frame that has already started arriving on a
/// non-blocking socket. Past the deadline it fails with
/// [`io::ErrorKind::TimedOut`].
#[derive(Debug)]
pub struct RetryReader<'a, R> {
    inner: &'a mut R,
    deadline: Instant,
}

impl<'a, R: Read> RetryReader<'a, R> {
    /// Creates a reader that gives up `timeout` from now.
    pub fn new(inner: &'a mut R, timeout: Duration) -> Self {
        Self {
            inner,
            deadline: Instant::now() + timeout,
        }
    }
}

impl<R: Read> Read for RetryReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => backoff(self.deadline)?,
                other => return other,
            }
        }
    }
}

/// Writes and flushes all of `buf`, retrying would-block and interrupted
/// errors until `timeout` elapses.
///
/// # Errors
///
/// Returns [`io::ErrorKind::TimedOut`] past the deadline,
/// [`io::ErrorKind::WriteZero`] if the socket stops accepting bytes, or the
/// first non-transient write error.
pub fn write_all_retry<W: Write>(writer: &mut W, mut buf: &[u8], timeout: Duration) -> io::Result<()> {
    let deadline = Instant::now() + timeout;

    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf = buf.get(n..).unwrap_or_default(),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => backoff(deadline)?,
            Err(e) => return Err(e),
        }
    }

    loop {
        match writer.flush() {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => backoff(deadline)?,
            Err(e) => return Err(e),
        }
    }
}

fn backoff(deadline: Instant) -> io::Result<()> {
    if Instant::now() >= deadline {
        return Err(io::ErrorKind::TimedOut.into());
    }
    thread::sleep(RETRY_BACKOFF);
    Ok(())
}
