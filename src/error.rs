//! Server error types with process exit code mapping.
//!
//! [`ServerError`] is the central error type for the engine. Every variant is
//! fatal: it is returned from [`crate::server::Server::bind`] or
//! [`crate::server::Server::run`] and the binary turns it into a process exit
//! status. Per-connection failures never surface here; they are reported
//! through the event handler instead.

use std::io;

use crate::config::AddressError;
use crate::net::tls::TlsError;

/// Fatal engine and startup errors.
///
/// # Exit Codes
///
/// | Code | Category                  |
/// |------|---------------------------|
/// | 1    | Socket creation           |
/// | 2    | Socket option             |
/// | 4    | Bind                      |
/// | 8    | Listen                    |
/// | 16   | Readiness wait            |
/// | 32   | Accept                    |
/// | 64   | Client read               |
/// | 65   | TLS setup                 |
/// | 78   | Configuration             |
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listening socket or readiness multiplexer could not be created.
    #[error("socket creation failed: {0}")]
    Socket(#[source] io::Error),

    /// A socket option could not be applied to the listener.
    #[error("setting socket option failed: {0}")]
    SocketOption(#[source] io::Error),

    /// Binding the listen address failed.
    #[error("bind to {address} failed: {source}")]
    Bind {
        /// Human-readable listen address.
        address: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Registering the listener with the multiplexer failed.
    #[error("listen failed: {0}")]
    Listen(#[source] io::Error),

    /// The readiness wait failed with a non-transient error.
    #[error("readiness wait failed: {0}")]
    Poll(#[source] io::Error),

    /// Accepting a connection failed with a non-transient error.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// Reading from a client failed with an unexpected error.
    #[error("client read failed: {0}")]
    Read(#[source] io::Error),

    /// TLS context or key material could not be loaded.
    #[error("tls setup failed: {0}")]
    Tls(#[from] TlsError),

    /// The listen address string was invalid.
    #[error("invalid listen address: {0}")]
    Address(#[from] AddressError),

    /// The configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ServerError {
    /// Returns the process exit status for this variant.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Socket(_) => 1,
            Self::SocketOption(_) => 2,
            Self::Bind { .. } => 4,
            Self::Listen(_) => 8,
            Self::Poll(_) => 16,
            Self::Accept(_) => 32,
            Self::Read(_) => 64,
            Self::Tls(_) => 65,
            Self::Address(_) | Self::Config(_) => 78,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_category() {
        let errors = [
            ServerError::Socket(io::Error::other("x")),
            ServerError::SocketOption(io::Error::other("x")),
            ServerError::Bind {
                address: "127.0.0.1:1".to_string(),
                source: io::Error::other("x"),
            },
            ServerError::Listen(io::Error::other("x")),
            ServerError::Poll(io::Error::other("x")),
            ServerError::Accept(io::Error::other("x")),
            ServerError::Read(io::Error::other("x")),
            ServerError::Tls(TlsError::NoCertificates),
            ServerError::Config("bad".to_string()),
        ];
        let mut codes: Vec<u8> = errors.iter().map(ServerError::exit_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(codes.iter().all(|c| *c != 0));
    }

    #[test]
    fn bind_error_mentions_address() {
        let err = ServerError::Bind {
            address: "file:///tmp/x.sock".to_string(),
            source: io::Error::other("in use"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/x.sock"));
        assert!(msg.contains("in use"));
    }
}
