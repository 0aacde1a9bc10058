//! # evsock
//!
//! Single-threaded, readiness-driven socket server engine speaking raw
//! streams or WebSocket (RFC 6455), optionally over TLS, on TCP (IPv4/IPv6)
//! or UNIX-domain sockets.
//!
//! Applications implement [`EventHandler`] and receive connect, data,
//! disconnect and error events. The engine owns every connection; callbacks
//! act on clients through the [`Clients`] handle they are given.
//!
//! ## Architecture
//!
//! ```text
//! Clients (raw TCP/UNIX, WebSocket, TLS)
//!     │
//!     ├── Listener / Stream / TlsAcceptor (net/)
//!     ├── Handshake, frame codec, frame reader (ws/)
//!     │
//!     ├── Server readiness loop (server/engine)
//!     ├── ClientRegistry slots (server/registry)
//!     │
//!     └── EventHandler callbacks (server/event)
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use evsock::{Clients, Event, EventHandler, Server, ServerConfig};
//!
//! struct Echo;
//!
//! impl EventHandler for Echo {
//!     fn on_data(&mut self, clients: &mut Clients<'_>, event: &Event) {
//!         if let Some(received) = &event.received {
//!             let _ = clients.write(event.connection, &received.data);
//!         }
//!     }
//! }
//!
//! # fn main() -> Result<(), evsock::ServerError> {
//! let mut server = Server::bind(ServerConfig::default(), Echo)?;
//! server.run()
//! # }
//! ```

pub mod config;
pub mod error;
pub mod net;
pub mod server;
pub mod ws;

pub use config::{ListenAddress, ServerConfig, TlsSettings};
pub use error::ServerError;
pub use server::{Clients, ConnectionId, DataKind, Event, EventHandler, EventKind, Received, Server, ShutdownHandle};
