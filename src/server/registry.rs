//! Live connection storage with a slot table kept in lockstep with the
//! readiness multiplexer.
//!
//! Slot `i` owns readiness token `i`. Slot 0 is reserved for the listener,
//! so client slots run from 1 to `max_clients`. A free slot carries the
//! sentinel descriptor `-1`.

use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};

use super::connection::{Connection, ConnectionId};
use crate::net::Stream;

/// Slot (and token) of the listening socket.
pub const LISTENER_SLOT: usize = 0;

/// Descriptor value marking an unused slot.
pub const UNUSED_FD: RawFd = -1;

#[derive(Debug)]
struct Slot {
    fd: RawFd,
    connection: Option<Connection>,
}

impl Slot {
    const fn unused() -> Self {
        Self {
            fd: UNUSED_FD,
            connection: None,
        }
    }
}

/// Owns every live [`Connection`].
///
/// Only the loop thread touches the registry, so there is no locking.
#[derive(Debug)]
pub struct ClientRegistry {
    slots: Vec<Slot>,
    max_clients: usize,
    live: usize,
    next_generation: u64,
}

impl ClientRegistry {
    /// Creates a registry with room for `max_clients` clients plus the
    /// listener slot.
    #[must_use]
    pub fn new(max_clients: usize) -> Self {
        let mut registry = Self {
            slots: Vec::new(),
            max_clients: 0,
            live: 0,
            next_generation: 0,
        };
        registry.set_max_clients(max_clients);
        registry
    }

    /// Records the listener descriptor in slot 0.
    pub fn set_listener(&mut self, fd: RawFd) {
        if let Some(slot) = self.slots.get_mut(LISTENER_SLOT) {
            slot.fd = fd;
        }
    }

    /// Changes the client capacity.
    ///
    /// Growing appends unused slots. Shrinking keeps existing connections
    /// and only limits future admissions.
    pub fn set_max_clients(&mut self, max_clients: usize) {
        let wanted = max_clients + 1;
        if wanted > self.slots.len() {
            self.slots.resize_with(wanted, Slot::unused);
        }
        self.max_clients = max_clients;
    }

    /// Returns the client capacity.
    #[must_use]
    pub const fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Returns the number of live connections.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.live
    }

    /// Returns `true` if no client is connected.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Returns `true` if a new client would exceed the capacity.
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.live >= self.max_clients
    }

    /// Registers `stream` for read readiness in the first free slot.
    ///
    /// Returns `None`, dropping (and so closing) the stream, when no slot is
    /// free or the multiplexer refuses the descriptor.
    pub fn add(&mut self, poll: &Registry, stream: Stream, websocket: bool) -> Option<ConnectionId> {
        let fd = stream.as_raw_fd();
        let limit = (self.max_clients + 1).min(self.slots.len());
        let Some(index) = (1..limit).find(|&i| {
            self.slots
                .get(i)
                .is_some_and(|s| s.fd == UNUSED_FD && s.connection.is_none())
        }) else {
            tracing::debug!(fd, "no free slot, closing");
            return None;
        };

        if let Err(err) = poll.register(&mut SourceFd(&fd), Token(index), Interest::READABLE) {
            tracing::warn!(fd, %err, "cannot register client");
            return None;
        }

        let id = ConnectionId::new(index, self.next_generation);
        self.next_generation += 1;

        let slot = self.slots.get_mut(index)?;
        slot.fd = fd;
        slot.connection = Some(Connection::new(id, stream, websocket));
        self.live += 1;

        Some(id)
    }

    /// Unregisters and closes a connection, freeing its slot and any
    /// partially received message. Returns `false` for unknown or stale ids.
    pub fn remove(&mut self, poll: &Registry, id: ConnectionId) -> bool {
        let Some(slot) = self.slots.get_mut(id.slot()) else {
            return false;
        };
        if !slot.connection.as_ref().is_some_and(|c| c.id() == id) {
            return false;
        }

        let fd = slot.fd;
        if let Err(err) = poll.deregister(&mut SourceFd(&fd)) {
            tracing::debug!(connection = %id, fd, %err, "deregister failed");
        }
        slot.fd = UNUSED_FD;
        slot.connection = None;
        self.live -= 1;
        true
    }

    /// Removes every connection without firing callbacks.
    pub fn clear(&mut self, poll: &Registry) {
        for id in self.ids() {
            self.remove(poll, id);
        }
    }

    /// Returns the connection using descriptor `fd` (linear scan).
    #[must_use]
    pub fn find_by_fd(&self, fd: RawFd) -> Option<ConnectionId> {
        if fd == UNUSED_FD {
            return None;
        }
        self.slots
            .iter()
            .skip(1)
            .filter(|s| s.fd == fd)
            .find_map(|s| s.connection.as_ref().map(Connection::id))
    }

    /// Returns the connection occupying `slot`.
    #[must_use]
    pub fn id_for_slot(&self, slot: usize) -> Option<ConnectionId> {
        self.slots
            .get(slot)
            .and_then(|s| s.connection.as_ref())
            .map(Connection::id)
    }

    /// Returns the connection for `id`, unless it is stale.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.slots
            .get(id.slot())
            .and_then(|s| s.connection.as_ref())
            .filter(|c| c.id() == id)
    }

    /// Mutable variant of [`ClientRegistry::get`].
    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.slots
            .get_mut(id.slot())
            .and_then(|s| s.connection.as_mut())
            .filter(|c| c.id() == id)
    }

    /// Returns the ids of all live connections in slot order.
    #[must_use]
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.slots
            .iter()
            .filter_map(|s| s.connection.as_ref().map(Connection::id))
            .collect()
    }

    /// Returns live connections with no inbound activity for longer than
    /// `timeout`, skipping those already being torn down.
    #[must_use]
    pub fn idle(&self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        self.slots
            .iter()
            .filter_map(|s| s.connection.as_ref())
            .filter(|c| !c.state().is_terminal() && c.is_idle(now, timeout))
            .map(Connection::id)
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::net::Socket;
    use mio::Poll;
    use std::os::unix::net::UnixStream;

    fn stream() -> (Stream, UnixStream) {
        let Ok((a, b)) = UnixStream::pair() else {
            panic!("socketpair failed");
        };
        (Stream::plain(Socket::Unix(a)), b)
    }

    fn poll() -> Poll {
        let Ok(poll) = Poll::new() else {
            panic!("poll creation failed");
        };
        poll
    }

    #[test]
    fn add_until_full_then_reject() {
        let poll = poll();
        let mut registry = ClientRegistry::new(2);
        let mut peers = Vec::new();

        for expected_slot in 1..=2 {
            let (s, peer) = stream();
            peers.push(peer);
            let Some(id) = registry.add(poll.registry(), s, false) else {
                panic!("slot should be free");
            };
            assert_eq!(id.slot(), expected_slot);
        }
        assert!(registry.is_full());
        assert_eq!(registry.len(), 2);

        let (s, _peer) = stream();
        assert!(registry.add(poll.registry(), s, false).is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn remove_frees_slot_and_invalidates_id() {
        let poll = poll();
        let mut registry = ClientRegistry::new(1);

        let (s, _p1) = stream();
        let Some(first) = registry.add(poll.registry(), s, true) else {
            panic!("add failed");
        };
        assert!(registry.remove(poll.registry(), first));
        assert!(registry.is_empty());
        assert!(!registry.remove(poll.registry(), first));

        let (s, _p2) = stream();
        let Some(second) = registry.add(poll.registry(), s, true) else {
            panic!("freed slot should be reusable");
        };
        assert_eq!(second.slot(), first.slot());
        assert_ne!(second, first);
        assert!(registry.get(first).is_none());
        assert!(registry.get(second).is_some());
    }

    #[test]
    fn find_by_fd_scans_live_connections() {
        let poll = poll();
        let mut registry = ClientRegistry::new(4);
        let (s, _peer) = stream();
        let fd = s.as_raw_fd();
        let Some(id) = registry.add(poll.registry(), s, false) else {
            panic!("add failed");
        };

        assert_eq!(registry.find_by_fd(fd), Some(id));
        assert_eq!(registry.find_by_fd(UNUSED_FD), None);
        assert_eq!(registry.id_for_slot(id.slot()), Some(id));
        assert_eq!(registry.id_for_slot(LISTENER_SLOT), None);

        registry.remove(poll.registry(), id);
        assert_eq!(registry.find_by_fd(fd), None);
    }

    #[test]
    fn raising_capacity_adds_unused_slots() {
        let poll = poll();
        let mut registry = ClientRegistry::new(1);
        let mut peers = Vec::new();

        let (s, peer) = stream();
        peers.push(peer);
        assert!(registry.add(poll.registry(), s, false).is_some());
        assert!(registry.is_full());

        registry.set_max_clients(3);
        assert_eq!(registry.max_clients(), 3);
        assert!(!registry.is_full());
        for _ in 0..2 {
            let (s, peer) = stream();
            peers.push(peer);
            assert!(registry.add(poll.registry(), s, false).is_some());
        }
        assert_eq!(registry.len(), 3);

        registry.set_max_clients(1);
        assert_eq!(registry.len(), 3);
        let (s, _peer) = stream();
        assert!(registry.add(poll.registry(), s, false).is_none());
    }

    #[test]
    fn idle_lists_inactive_connections() {
        let poll = poll();
        let mut registry = ClientRegistry::new(2);
        let (s, _peer) = stream();
        let Some(id) = registry.add(poll.registry(), s, false) else {
            panic!("add failed");
        };

        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(registry.idle(later, Duration::from_secs(60)), vec![id]);
        assert!(registry.idle(Instant::now(), Duration::from_secs(60)).is_empty());

        registry.clear(poll.registry());
        assert!(registry.is_empty());
        assert!(registry.ids().is_empty());
    }
}
