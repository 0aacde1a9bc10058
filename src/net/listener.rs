//! Listening sockets: TCP (IPv4/IPv6) and UNIX domain.

use std::fs;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

use crate::config::ListenAddress;
use crate::error::ServerError;

use super::stream::Socket;

/// Address family of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// TCP over IPv4.
    Ipv4,
    /// TCP over IPv6.
    Ipv6,
    /// UNIX-domain stream socket.
    Unix,
}

/// A non-blocking listening socket.
///
/// A UNIX-domain listener unlinks its socket file when dropped.
#[derive(Debug)]
pub enum Listener {
    /// TCP listener.
    Tcp(TcpListener),
    /// UNIX-domain listener and the path it is bound to.
    Unix {
        /// The bound listener.
        listener: UnixListener,
        /// Socket file path.
        path: PathBuf,
    },
}

impl Listener {
    /// Binds `address` and switches the listener to non-blocking mode.
    ///
    /// `*:PORT` binds the IPv6 wildcard when `ipv6` is set, the IPv4
    /// wildcard otherwise. A stale UNIX socket file at the target path is
    /// removed first.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound and
    /// [`ServerError::SocketOption`] if non-blocking mode cannot be set.
    pub fn bind(address: &ListenAddress, ipv6: bool) -> Result<Self, ServerError> {
        let bind_err = |source| ServerError::Bind {
            address: address.to_string(),
            source,
        };

        let listener = match address {
            ListenAddress::Tcp(addr) => Self::Tcp(TcpListener::bind(addr).map_err(bind_err)?),
            ListenAddress::Any(port) => {
                let addr = if ipv6 {
                    SocketAddr::from((Ipv6Addr::UNSPECIFIED, *port))
                } else {
                    SocketAddr::from((Ipv4Addr::UNSPECIFIED, *port))
                };
                Self::Tcp(TcpListener::bind(addr).map_err(bind_err)?)
            }
            ListenAddress::Unix(path) => {
                remove_stale_socket(path);
                Self::Unix {
                    listener: UnixListener::bind(path).map_err(bind_err)?,
                    path: path.clone(),
                }
            }
        };

        let nonblocking = match &listener {
            Self::Tcp(l) => l.set_nonblocking(true),
            Self::Unix { listener, .. } => listener.set_nonblocking(true),
        };
        nonblocking.map_err(ServerError::SocketOption)?;

        Ok(listener)
    }

    /// Accepts one pending connection.
    ///
    /// # Errors
    ///
    /// Returns the OS error; use [`is_transient_accept`] to tell "try again
    /// later" apart from real failures.
    pub fn accept(&self) -> io::Result<Socket> {
        match self {
            Self::Tcp(l) => l.accept().map(|(s, _)| Socket::Tcp(s)),
            Self::Unix { listener, .. } => listener.accept().map(|(s, _)| Socket::Unix(s)),
        }
    }

    /// Returns the bound TCP address, or `None` for UNIX-domain listeners.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(l) => l.local_addr().ok(),
            Self::Unix { .. } => None,
        }
    }

    /// Returns the listener's address family.
    #[must_use]
    pub fn family(&self) -> Family {
        match self.local_addr() {
            Some(SocketAddr::V4(_)) => Family::Ipv4,
            Some(SocketAddr::V6(_)) => Family::Ipv6,
            None => Family::Unix,
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(l) => l.as_raw_fd(),
            Self::Unix { listener, .. } => listener.as_raw_fd(),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Self::Unix { path, .. } = self {
            let _ = fs::remove_file(path);
        }
    }
}

/// Returns `true` for accept errors that only mean "stop accepting for this
/// round": would-block, interrupted, descriptor exhaustion, and connections
/// aborted before they were accepted.
#[must_use]
pub fn is_transient_accept(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
    ) || matches!(err.raw_os_error(), Some(libc::EMFILE | libc::ENFILE))
}

fn remove_stale_socket(path: &Path) {
    if let Ok(meta) = fs::symlink_metadata(path)
        && meta.file_type().is_socket()
    {
        let _ = fs::remove_file(path);
    }
}
