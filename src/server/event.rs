//! Lifecycle events and the handler interface applications implement.
//!
//! The engine never hands out its connections. Each callback receives an
//! [`Event`] snapshot (copied identifiers plus the received message) and a
//! [`Clients`] handle through which it may act on the server.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use super::connection::{Connection, ConnectionId, DataKind, Received};
use super::engine::ShutdownHandle;
use super::registry::ClientRegistry;

/// The four event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A client was accepted (and upgraded, in WebSocket mode).
    Connect,
    /// A complete message arrived.
    Data,
    /// A client went away, timed out, or was deleted.
    Disconnect,
    /// A client violated the protocol; a disconnect event follows.
    Error,
}

/// Snapshot passed to a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Which event this is.
    pub kind: EventKind,
    /// The connection concerned.
    pub connection: ConnectionId,
    /// Its socket descriptor at the time of the event.
    pub fd: RawFd,
    /// Whether it runs over TLS.
    pub tls: bool,
    /// The message, for [`EventKind::Data`] only.
    pub received: Option<Received>,
}

impl Event {
    pub(crate) fn new(kind: EventKind, connection: &Connection, received: Option<Received>) -> Self {
        Self {
            kind,
            connection: connection.id(),
            fd: connection.fd(),
            tls: connection.is_tls(),
            received,
        }
    }
}

/// Application callbacks. Every method defaults to doing nothing, so an
/// implementation only overrides the events it cares about. The implementing
/// type carries the application's own state.
pub trait EventHandler {
    /// A client connected.
    fn on_connect(&mut self, _clients: &mut Clients<'_>, _event: &Event) {}

    /// A complete message arrived; `event.received` is always `Some`.
    fn on_data(&mut self, _clients: &mut Clients<'_>, _event: &Event) {}

    /// A client disconnected. The connection is removed after this returns.
    fn on_disconnect(&mut self, _clients: &mut Clients<'_>, _event: &Event) {}

    /// A client broke the protocol. A disconnect event follows, after which
    /// the connection is removed.
    fn on_error(&mut self, _clients: &mut Clients<'_>, _event: &Event) {}
}

/// Control handle given to callbacks.
///
/// Deletions requested here take effect once the callback returns, and fire
/// the usual disconnect event.
#[derive(Debug)]
pub struct Clients<'a> {
    registry: &'a mut ClientRegistry,
    shutdown: &'a ShutdownHandle,
    io_timeout: Duration,
    deferred: Vec<ConnectionId>,
}

impl<'a> Clients<'a> {
    pub(crate) fn new(registry: &'a mut ClientRegistry, shutdown: &'a ShutdownHandle, io_timeout: Duration) -> Self {
        Self {
            registry,
            shutdown,
            io_timeout,
            deferred: Vec::new(),
        }
    }

    pub(crate) fn into_deferred(self) -> Vec<ConnectionId> {
        self.deferred
    }

    /// Sends a text message (raw bytes on plain connections).
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::NotFound`] for unknown ids, otherwise the
    /// socket error.
    pub fn write(&mut self, id: ConnectionId, data: &[u8]) -> io::Result<usize> {
        self.write_kind(id, data, DataKind::Text)
    }

    /// Sends a binary message (raw bytes on plain connections).
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::NotFound`] for unknown ids, otherwise the
    /// socket error.
    pub fn write_binary(&mut self, id: ConnectionId, data: &[u8]) -> io::Result<usize> {
        self.write_kind(id, data, DataKind::Binary)
    }

    fn write_kind(&mut self, id: ConnectionId, data: &[u8], kind: DataKind) -> io::Result<usize> {
        let timeout = self.io_timeout;
        self.registry
            .get_mut(id)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?
            .write(data, kind, timeout)
    }

    /// Pings a WebSocket client with an 8-byte value its pong must echo.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::NotFound`] for unknown ids,
    /// [`io::ErrorKind::Unsupported`] for plain connections, otherwise the
    /// socket error.
    pub fn ping(&mut self, id: ConnectionId, value: u64) -> io::Result<()> {
        let timeout = self.io_timeout;
        self.registry
            .get_mut(id)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?
            .ping(value, timeout)
    }

    /// Schedules `id` for deletion. Returns `false` for unknown ids.
    pub fn delete(&mut self, id: ConnectionId) -> bool {
        if self.registry.get(id).is_none() {
            return false;
        }
        if !self.deferred.contains(&id) {
            self.deferred.push(id);
        }
        true
    }

    /// Returns the peer address of `id`.
    #[must_use]
    pub fn address(&self, id: ConnectionId) -> Option<String> {
        self.registry.get(id).map(Connection::address)
    }

    /// Returns a read-only view of a connection.
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.registry.get(id)
    }

    /// Returns the connection using descriptor `fd`.
    #[must_use]
    pub fn find_by_fd(&self, fd: RawFd) -> Option<ConnectionId> {
        self.registry.find_by_fd(fd)
    }

    /// Returns the number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Returns `true` if no client is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Returns the ids of all live connections.
    #[must_use]
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.registry.ids()
    }

    /// Asks the server to stop after the current iteration.
    pub fn terminate(&self) {
        self.shutdown.terminate();
    }
}
