//! Connection engine: per-client state, the slot registry, the event
//! interface, and the readiness loop that ties them together.

pub mod connection;
pub mod engine;
pub mod event;
pub mod registry;

pub use connection::{Connection, ConnectionId, ConnectionState, DataKind, Received};
pub use engine::{Server, ShutdownHandle};
pub use event::{Clients, Event, EventHandler, EventKind};
pub use registry::ClientRegistry;
