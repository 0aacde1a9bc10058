//! Per-client connection state.

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::net::Stream;
use crate::net::stream::write_all_retry;
use crate::ws::frame::{self, Opcode};

/// Stable handle to a connection: its registry slot plus a generation that
/// changes every time the slot is reused, so a stale id never resolves to a
/// newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    slot: usize,
    generation: u64,
}

impl ConnectionId {
    pub(crate) const fn new(slot: usize, generation: u64) -> Self {
        Self { slot, generation }
    }

    /// Returns the registry slot (also the readiness token).
    #[must_use]
    pub const fn slot(&self) -> usize {
        self.slot
    }

    /// Returns the slot generation.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.slot, self.generation)
    }
}

/// Lifecycle of a connection.
///
/// `Connected → {Default, ReadContinue} → {Disconnect, Error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered; nothing read yet.
    Connected,
    /// Between messages.
    Default,
    /// Inside a fragmented WebSocket message.
    ReadContinue,
    /// Closing after a peer close, EOF, reset, timeout or deletion.
    Disconnect,
    /// Closing after a protocol violation.
    Error,
}

impl ConnectionState {
    /// Returns `true` once the connection is on its way out.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnect | Self::Error)
    }
}

/// Whether a received message is text or binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataKind {
    /// Text frames, and every raw (non-WebSocket) read.
    #[default]
    Text,
    /// Binary frames.
    Binary,
}

/// A complete inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Received {
    /// Message bytes, unmasked and reassembled.
    pub data: Vec<u8>,
    /// Text or binary.
    pub kind: DataKind,
}

impl Received {
    /// Returns `true` for text messages.
    #[must_use]
    pub fn is_text(&self) -> bool {
        self.kind == DataKind::Text
    }

    /// Returns `true` for binary messages.
    #[must_use]
    pub fn is_binary(&self) -> bool {
        self.kind == DataKind::Binary
    }

    /// Returns the payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the payload as UTF-8, if it is valid UTF-8.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

/// A live client.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    pub(crate) stream: Stream,
    websocket: bool,
    pub(crate) state: ConnectionState,
    connected_at: DateTime<Utc>,
    pub(crate) last_activity: Instant,
    pub(crate) last_ping: Option<u64>,
    pub(crate) inbound: Received,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, stream: Stream, websocket: bool) -> Self {
        Self {
            id,
            stream,
            websocket,
            state: ConnectionState::Connected,
            connected_at: Utc::now(),
            last_activity: Instant::now(),
            last_ping: None,
            inbound: Received::default(),
        }
    }

    /// Returns the connection id.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the socket descriptor.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Returns `true` for TLS connections.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    /// Returns `true` if the connection speaks WebSocket framing.
    #[must_use]
    pub const fn is_websocket(&self) -> bool {
        self.websocket
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Returns when the connection was accepted.
    #[must_use]
    pub const fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Returns the peer address.
    #[must_use]
    pub fn address(&self) -> String {
        self.stream.socket().peer_address()
    }

    /// Returns `true` if nothing was received for longer than `timeout`.
    #[must_use]
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Takes the completed inbound message, leaving an empty buffer.
    pub(crate) fn take_inbound(&mut self) -> Received {
        let kind = self.inbound.kind;
        let taken = std::mem::take(&mut self.inbound);
        self.inbound.kind = kind;
        taken
    }

    /// Sends `data`: framed when the connection speaks WebSocket, raw
    /// (through TLS if enabled) otherwise. Returns the payload length.
    ///
    /// # Errors
    ///
    /// Returns the socket error, or [`io::ErrorKind::TimedOut`] if the peer
    /// does not drain its receive buffer within `timeout`.
    pub fn write(&mut self, data: &[u8], kind: DataKind, timeout: Duration) -> io::Result<usize> {
        if self.websocket {
            let opcode = match kind {
                DataKind::Text => Opcode::Text,
                DataKind::Binary => Opcode::Binary,
            };
            self.send_frame(opcode, data, timeout)?;
        } else {
            write_all_retry(&mut self.stream, data, timeout)?;
        }
        Ok(data.len())
    }

    /// Sends a ping carrying `value` as 8 big-endian bytes and remembers it
    /// for pong validation.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::Unsupported`] on a plain (non-WebSocket)
    /// connection, or the socket error.
    pub fn ping(&mut self, value: u64, timeout: Duration) -> io::Result<()> {
        if !self.websocket {
            return Err(io::ErrorKind::Unsupported.into());
        }
        self.send_frame(Opcode::Ping, &frame::ping_payload(value), timeout)?;
        self.last_ping = Some(value);
        Ok(())
    }

    pub(crate) fn send_frame(&mut self, opcode: Opcode, payload: &[u8], timeout: Duration) -> io::Result<()> {
        write_all_retry(&mut self.stream, &frame::encode_frame(opcode, payload), timeout)
    }
}
