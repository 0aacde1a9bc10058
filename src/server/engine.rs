//! The readiness loop: accept, handshake, read, dispatch, sweep.
//!
//! [`Server`] owns the listener, the multiplexer and every connection. It
//! runs on the calling thread and never spawns; callbacks run inline between
//! readiness waits.

use std::fmt;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use super::connection::{Connection, ConnectionId, ConnectionState, DataKind, Received};
use super::event::{Clients, Event, EventHandler, EventKind};
use super::registry::{ClientRegistry, LISTENER_SLOT};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::net::listener::is_transient_accept;
use crate::net::stream::classify;
use crate::net::{Family, IoClass, Listener, Socket, Stream, TlsAcceptor};
use crate::ws::handshake;
use crate::ws::session::{self, ReadOutcome};

/// Shared stop flag, checked at the top of every loop iteration.
///
/// Cloning is cheap; every clone controls the same server. [`flag`] exposes
/// the raw atomic for `signal_hook::flag::register`.
///
/// [`flag`]: ShutdownHandle::flag
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Creates a handle in the running state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests shutdown. The loop exits within one poll interval.
    pub fn terminate(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once shutdown was requested.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns the underlying flag.
    #[must_use]
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }
}

/// A single-threaded socket server delivering events to `H`.
pub struct Server<H> {
    config: ServerConfig,
    handler: H,
    listener: Listener,
    poll: Poll,
    events: Events,
    registry: ClientRegistry,
    tls: Option<TlsAcceptor>,
    shutdown: ShutdownHandle,
    read_buf: Vec<u8>,
    last_sweep: Instant,
    accept_deferred: bool,
}

impl<H> fmt::Debug for Server<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("listen", &self.config.listen)
            .field("family", &self.listener.family())
            .field("clients", &self.registry.len())
            .field("tls", &self.tls.is_some())
            .field("websocket", &self.config.websocket)
            .finish_non_exhaustive()
    }
}

impl<H: EventHandler> Server<H> {
    /// Validates `config`, loads TLS material, binds the listener and
    /// registers it with a new multiplexer.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] for inconsistent settings,
    /// [`ServerError::Tls`] if key material cannot be loaded,
    /// [`ServerError::Bind`] / [`ServerError::SocketOption`] from the
    /// listener, [`ServerError::Socket`] if the multiplexer cannot be created
    /// and [`ServerError::Listen`] if the listener cannot be registered.
    pub fn bind(config: ServerConfig, handler: H) -> Result<Self, ServerError> {
        config.validate().map_err(ServerError::Config)?;

        let tls = config.tls.as_ref().map(TlsAcceptor::from_settings).transpose()?;
        let listener = Listener::bind(&config.listen, config.ipv6)?;
        let poll = Poll::new().map_err(ServerError::Socket)?;

        let fd = listener.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), Token(LISTENER_SLOT), Interest::READABLE)
            .map_err(ServerError::Listen)?;

        let mut registry = ClientRegistry::new(config.max_clients);
        registry.set_listener(fd);

        tracing::info!(
            listen = %config.listen,
            local = ?listener.local_addr(),
            family = ?listener.family(),
            websocket = config.websocket,
            tls = tls.is_some(),
            max_clients = config.max_clients,
            "server listening"
        );

        Ok(Self {
            events: Events::with_capacity(config.events_capacity.max(1)),
            read_buf: vec![0u8; config.read_buffer_size],
            last_sweep: Instant::now(),
            accept_deferred: false,
            config,
            handler,
            listener,
            poll,
            registry,
            tls,
            shutdown: ShutdownHandle::new(),
        })
    }

    /// Runs the loop until shutdown is requested.
    ///
    /// Connections still open at shutdown are closed without callbacks.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Poll`], [`ServerError::Accept`] or
    /// [`ServerError::Read`] on a non-transient OS failure; the server
    /// should be dropped afterwards.
    pub fn run(&mut self) -> Result<(), ServerError> {
        while !self.shutdown.is_terminated() {
            self.turn()?;
        }

        tracing::info!(clients = self.registry.len(), "server shutting down");
        self.registry.clear(self.poll.registry());
        Ok(())
    }

    /// Runs one loop iteration: a single readiness wait of at most one poll
    /// interval, dispatch of every ready slot, and the idle sweep when due.
    /// An accept deferred by descriptor exhaustion is retried here even when
    /// the listener reports nothing new.
    ///
    /// # Errors
    ///
    /// Same as [`Server::run`].
    pub fn turn(&mut self) -> Result<(), ServerError> {
        match self.poll.poll(&mut self.events, Some(self.config.poll_interval)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => {
                tracing::error!(err = %e, "readiness wait failed");
                return Err(ServerError::Poll(e));
            }
        }

        let ready: Vec<(Token, bool)> = self.events.iter().map(|e| (e.token(), e.is_error())).collect();
        let timed_out = ready.is_empty();
        let mut retry_accept = self.accept_deferred;

        for (token, error) in ready {
            if token.0 == LISTENER_SLOT {
                retry_accept = false;
                self.accept_pending()?;
            } else {
                self.service_slot(token.0, error)?;
            }
        }

        if retry_accept {
            self.accept_pending()?;
        }

        if timed_out || self.last_sweep.elapsed() >= self.config.poll_interval {
            self.sweep();
        }
        Ok(())
    }

    /// Returns a handle that stops [`Server::run`] from any thread.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Returns the bound TCP address, `None` for UNIX-domain listeners.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Returns the listener's address family.
    #[must_use]
    pub fn family(&self) -> Family {
        self.listener.family()
    }

    /// Returns the active configuration.
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the event handler.
    #[must_use]
    pub const fn handler(&self) -> &H {
        &self.handler
    }

    /// Returns the event handler mutably.
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Changes the client capacity; see [`ClientRegistry::set_max_clients`].
    pub fn set_max_clients(&mut self, max_clients: usize) {
        self.registry.set_max_clients(max_clients);
        self.config.max_clients = max_clients;
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
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.registry.ids()
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

    /// Returns the peer address of `id`.
    #[must_use]
    pub fn address(&self, id: ConnectionId) -> Option<String> {
        self.registry.get(id).map(Connection::address)
    }

    /// Sends a text message to `id`.
    ///
    /// # Errors
    ///
    /// See [`Clients::write`].
    pub fn write(&mut self, id: ConnectionId, data: &[u8]) -> io::Result<usize> {
        self.clients().write(id, data)
    }

    /// Sends a binary message to `id`.
    ///
    /// # Errors
    ///
    /// See [`Clients::write_binary`].
    pub fn write_binary(&mut self, id: ConnectionId, data: &[u8]) -> io::Result<usize> {
        self.clients().write_binary(id, data)
    }

    /// Pings `id`; its pong must echo `value`.
    ///
    /// # Errors
    ///
    /// See [`Clients::ping`].
    pub fn ping(&mut self, id: ConnectionId, value: u64) -> io::Result<()> {
        self.clients().ping(id, value)
    }

    /// Fires the disconnect callback for `id`, then removes it. Returns
    /// `false` for unknown ids.
    pub fn delete(&mut self, id: ConnectionId) -> bool {
        if self.registry.get(id).is_none() {
            return false;
        }
        self.disconnect(id);
        true
    }

    fn clients(&mut self) -> Clients<'_> {
        Clients::new(&mut self.registry, &self.shutdown, self.config.io_timeout)
    }

    fn accept_pending(&mut self) -> Result<(), ServerError> {
        loop {
            let socket = match self.listener.accept() {
                Ok(socket) => socket,
                Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted) => {
                    continue;
                }
                Err(e) if is_transient_accept(&e) => {
                    self.defer_accept(&e);
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!(err = %e, "accept failed");
                    return Err(ServerError::Accept(e));
                }
            };

            if self.registry.is_full() {
                tracing::debug!(
                    peer = %socket.peer_address(),
                    max_clients = self.registry.max_clients(),
                    "capacity reached, closing"
                );
                continue;
            }

            let Some(stream) = self.establish(socket) else {
                continue;
            };
            let Some(id) = self.registry.add(self.poll.registry(), stream, self.config.websocket) else {
                continue;
            };

            tracing::debug!(connection = %id, peer = ?self.address(id), "client connected");
            self.emit(EventKind::Connect, id, None);

            // Bytes read ahead during the handshakes are invisible to the
            // multiplexer.
            self.service_reads(id)?;
        }
    }

    /// Notes whether connections may still wait in the backlog. Readiness is
    /// edge-triggered, so once the listener stops being drained it is not
    /// reported again until a new client arrives.
    fn defer_accept(&mut self, err: &io::Error) {
        self.accept_deferred = err.kind() != io::ErrorKind::WouldBlock;
        if self.accept_deferred {
            tracing::warn!(%err, "accept deferred");
        }
    }

    /// Runs the TLS and WebSocket handshakes on a blocking socket, then
    /// switches it to non-blocking. Any failure closes the socket.
    fn establish(&self, socket: Socket) -> Option<Stream> {
        let peer = socket.peer_address();

        let blocking = socket
            .set_nonblocking(false)
            .and_then(|()| socket.set_timeouts(Some(self.config.handshake_timeout)));
        if let Err(err) = blocking {
            tracing::debug!(%peer, %err, "cannot prepare accepted socket");
            return None;
        }

        let mut stream = match &self.tls {
            Some(acceptor) => match acceptor.accept(socket) {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(%peer, %err, "tls handshake failed");
                    return None;
                }
            },
            None => Stream::plain(socket),
        };

        if self.config.websocket {
            match handshake::perform(&mut stream) {
                Ok(leftover) => stream.push_pending(leftover),
                Err(err) => {
                    tracing::warn!(%peer, %err, "websocket handshake rejected");
                    return None;
                }
            }
        }

        let socket = stream.socket();
        let nonblocking = socket.set_timeouts(None).and_then(|()| socket.set_nonblocking(true));
        if let Err(err) = nonblocking {
            tracing::debug!(%peer, %err, "cannot switch socket to non-blocking");
            return None;
        }

        Some(stream)
    }

    fn service_slot(&mut self, slot: usize, error: bool) -> Result<(), ServerError> {
        let Some(id) = self.registry.id_for_slot(slot) else {
            return Ok(());
        };
        if error {
            tracing::debug!(connection = %id, "socket error reported");
            self.disconnect(id);
            return Ok(());
        }
        self.service_reads(id)
    }

    /// Reads until the socket would block or the connection goes away.
    fn service_reads(&mut self, id: ConnectionId) -> Result<(), ServerError> {
        let max_message_size = self.config.max_message_size;
        let io_timeout = self.config.io_timeout;

        loop {
            let Some(conn) = self.registry.get_mut(id) else {
                return Ok(());
            };
            if conn.state.is_terminal() {
                return Ok(());
            }
            let tls = conn.is_tls();

            let result = if conn.is_websocket() {
                session::read_frame(conn, max_message_size, io_timeout).map(|outcome| match outcome {
                    ReadOutcome::Message => Step::Deliver(conn.take_inbound()),
                    ReadOutcome::Partial | ReadOutcome::Control | ReadOutcome::Ignore => Step::Continue,
                    ReadOutcome::WouldBlock => Step::Stop,
                    ReadOutcome::Disconnect => Step::Disconnect,
                    ReadOutcome::Violation(reason) => Step::Violation(reason),
                })
            } else {
                read_raw(conn, &mut self.read_buf)
            };

            let step = match result {
                Ok(step) => step,
                Err(err) => match classify(&err, tls) {
                    IoClass::Retry if err.kind() == io::ErrorKind::Interrupted => Step::Continue,
                    IoClass::Retry => Step::Stop,
                    IoClass::Disconnect => {
                        tracing::debug!(connection = %id, %err, "read failed, disconnecting");
                        Step::Disconnect
                    }
                    IoClass::Fatal => {
                        tracing::error!(connection = %id, %err, "unexpected read error");
                        return Err(ServerError::Read(err));
                    }
                },
            };

            match step {
                Step::Deliver(received) => {
                    tracing::debug!(connection = %id, len = received.len(), "message received");
                    self.emit(EventKind::Data, id, Some(received));
                }
                Step::Continue => {}
                Step::Stop => return Ok(()),
                Step::Disconnect => {
                    self.disconnect(id);
                    return Ok(());
                }
                Step::Violation(reason) => {
                    self.fail(id, &reason);
                    return Ok(());
                }
            }
        }
    }

    fn sweep(&mut self) {
        self.last_sweep = Instant::now();
        if self.config.client_timeout.is_zero() {
            return;
        }
        for id in self.registry.idle(self.last_sweep, self.config.client_timeout) {
            tracing::info!(connection = %id, timeout = ?self.config.client_timeout, "idle client evicted");
            self.disconnect(id);
        }
    }

    /// Fires the disconnect callback once, then removes the connection.
    fn disconnect(&mut self, id: ConnectionId) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        if conn.state.is_terminal() {
            return;
        }
        conn.state = ConnectionState::Disconnect;

        self.emit(EventKind::Disconnect, id, None);
        self.registry.remove(self.poll.registry(), id);
        tracing::debug!(connection = %id, clients = self.registry.len(), "client disconnected");
    }

    /// Fires the error callback, then the disconnect callback, then removes
    /// the connection. Deletions requested from either callback are no-ops.
    fn fail(&mut self, id: ConnectionId, reason: &str) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        if conn.state.is_terminal() {
            return;
        }
        conn.state = ConnectionState::Error;

        tracing::warn!(connection = %id, reason, "protocol violation");
        self.emit(EventKind::Error, id, None);
        self.emit(EventKind::Disconnect, id, None);
        self.registry.remove(self.poll.registry(), id);
        tracing::debug!(connection = %id, clients = self.registry.len(), "client disconnected");
    }

    /// Hands a snapshot to the handler, then applies the deletions it asked
    /// for.
    fn emit(&mut self, kind: EventKind, id: ConnectionId, received: Option<Received>) {
        let Some(conn) = self.registry.get(id) else {
            return;
        };
        let event = Event::new(kind, conn, received);

        let mut clients = Clients::new(&mut self.registry, &self.shutdown, self.config.io_timeout);
        match kind {
            EventKind::Connect => self.handler.on_connect(&mut clients, &event),
            EventKind::Data => self.handler.on_data(&mut clients, &event),
            EventKind::Disconnect => self.handler.on_disconnect(&mut clients, &event),
            EventKind::Error => self.handler.on_error(&mut clients, &event),
        }

        for deleted in clients.into_deferred() {
            self.disconnect(deleted);
        }
    }
}

/// Result of one read attempt, decided while the connection is borrowed and
/// acted on afterwards.
#[derive(Debug)]
enum Step {
    Deliver(Received),
    Continue,
    Stop,
    Disconnect,
    Violation(String),
}

/// Reads one chunk from a plain connection. Every chunk is a text message.
fn read_raw(conn: &mut Connection, buf: &mut [u8]) -> io::Result<Step> {
    let n = conn.stream.read(buf)?;
    if n == 0 {
        return Ok(Step::Disconnect);
    }
    conn.touch();
    conn.state = ConnectionState::Default;
    Ok(Step::Deliver(Received {
        data: buf.get(..n).unwrap_or_default().to_vec(),
        kind: DataKind::Text,
    }))
}
