//! Socket primitives: listeners, client streams, TLS.
//!
//! Everything the engine needs from the operating system lives here:
//! creating TCP (IPv4/IPv6) and UNIX-domain listeners, non-blocking accept,
//! the TLS handshake and record layer, peer address formatting, and the
//! error taxonomy used to decide between retry, disconnect, and abort.

pub mod listener;
pub mod stream;
pub mod tls;

pub use listener::{Family, Listener};
pub use stream::{IoClass, RetryReader, Socket, Stream};
pub use tls::{TlsAcceptor, TlsError};
