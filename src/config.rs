//! Server configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`). Every setting has a default, so
//! [`ServerConfig::default`] is a usable configuration and
//! tests can override single fields with struct update syntax.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default TCP port when none is configured.
pub const DEFAULT_PORT: u16 = 12345;

/// Default idle timeout (five minutes).
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(60 * 5);

/// Where the server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    /// A numeric IPv4 or IPv6 socket address.
    Tcp(SocketAddr),
    /// Every interface on the given port (`*:PORT`).
    Any(u16),
    /// A UNIX-domain socket path (`file://PATH`).
    Unix(PathBuf),
}

/// Reasons a listen address string is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    /// The input was empty.
    #[error("address is empty")]
    Empty,
    /// `file://` with no path.
    #[error("unix socket path is empty")]
    EmptyPath,
    /// No `:PORT` suffix.
    #[error("missing port in {0:?}")]
    MissingPort(String),
    /// Port not in `1..=65535`.
    #[error("invalid port in {0:?}")]
    InvalidPort(String),
    /// Host is neither `*` nor a numeric address.
    #[error("host {0:?} is not a numeric address")]
    InvalidHost(String),
}

impl FromStr for ListenAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AddressError::Empty);
        }

        if let Some(prefix) = s.get(..7)
            && prefix.eq_ignore_ascii_case("file://")
        {
            let path = s.get(7..).unwrap_or_default();
            if path.is_empty() {
                return Err(AddressError::EmptyPath);
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(s.to_string()))?;
        let port = match port.parse::<u16>() {
            Ok(p) if p >= 1 => p,
            _ => return Err(AddressError::InvalidPort(s.to_string())),
        };

        if host == "*" {
            return Ok(Self::Any(port));
        }

        let bare = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        let ip: IpAddr = bare
            .parse()
            .map_err(|_| AddressError::InvalidHost(host.to_string()))?;
        Ok(Self::Tcp(SocketAddr::new(ip, port)))
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Any(port) => write!(f, "*:{port}"),
            Self::Unix(path) => write!(f, "file://{}", path.display()),
        }
    }
}

/// TLS key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    /// PEM certificate chain.
    pub cert_path: PathBuf,
    /// PEM private key (PKCS#1, PKCS#8, SEC1, or encrypted PKCS#8).
    pub key_path: PathBuf,
    /// Passphrase for an encrypted PKCS#8 key.
    pub key_password: Option<String>,
}

/// Top-level server configuration.
///
/// Loaded once at startup via [`ServerConfig::from_env`], or built directly.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen: ListenAddress,

    /// Maximum number of concurrently connected clients.
    pub max_clients: usize,

    /// Inactivity period after which a client is evicted.
    /// [`Duration::ZERO`] disables eviction.
    pub client_timeout: Duration,

    /// Require a WebSocket upgrade and speak WebSocket framing.
    pub websocket: bool,

    /// Bind `*:PORT` on the IPv6 wildcard rather than the IPv4 one.
    pub ipv6: bool,

    /// TLS key material. `None` means plaintext.
    pub tls: Option<TlsSettings>,

    /// Upper bound on a single readiness wait; also the sweep cadence.
    pub poll_interval: Duration,

    /// Chunk size for raw (non-WebSocket) reads.
    pub read_buffer_size: usize,

    /// Largest frame payload or reassembled message accepted.
    pub max_message_size: usize,

    /// Deadline for the TLS and WebSocket handshakes at accept time.
    pub handshake_timeout: Duration,

    /// Deadline for finishing a started frame read or an outbound write.
    pub io_timeout: Duration,

    /// Readiness events fetched per wait.
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: ListenAddress::Any(DEFAULT_PORT),
            max_clients: 128,
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
            websocket: false,
            ipv6: true,
            tls: None,
            poll_interval: Duration::from_millis(250),
            read_buffer_size: 65535,
            max_message_size: 16 * 1024 * 1024,
            handshake_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(5),
            events_capacity: 1024,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to defaults when a variable is not set or cannot be parsed.
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns an [`AddressError`] if `LISTEN_ADDR` is set but invalid.
    pub fn from_env() -> Result<Self, AddressError> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let listen = match std::env::var("LISTEN_ADDR") {
            Ok(addr) => addr.parse()?,
            Err(_) => defaults.listen,
        };

        let tls = if parse_env_bool("TLS_ENABLED", false) {
            Some(TlsSettings {
                cert_path: std::env::var("TLS_CERT").unwrap_or_default().into(),
                key_path: std::env::var("TLS_KEY").unwrap_or_default().into(),
                key_password: std::env::var("TLS_KEY_PASSWORD").ok(),
            })
        } else {
            None
        };

        Ok(Self {
            listen,
            max_clients: parse_env("MAX_CLIENTS", defaults.max_clients),
            client_timeout: Duration::from_secs(parse_env(
                "CLIENT_TIMEOUT_SECS",
                defaults.client_timeout.as_secs(),
            )),
            websocket: parse_env_bool("WEBSOCKET_ENABLED", defaults.websocket),
            ipv6: parse_env_bool("IPV6_ENABLED", defaults.ipv6),
            tls,
            poll_interval: Duration::from_millis(parse_env("POLL_INTERVAL_MS", 250)),
            read_buffer_size: parse_env("READ_BUFFER_SIZE", defaults.read_buffer_size),
            max_message_size: parse_env("MAX_MESSAGE_SIZE", defaults.max_message_size),
            handshake_timeout: Duration::from_secs(parse_env("HANDSHAKE_TIMEOUT_SECS", 5)),
            io_timeout: Duration::from_secs(parse_env("IO_TIMEOUT_SECS", 5)),
            events_capacity: parse_env("EVENTS_CAPACITY", defaults.events_capacity),
        })
    }

    /// Checks cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_clients == 0 {
            return Err("max_clients must be at least 1".to_string());
        }
        if self.read_buffer_size == 0 {
            return Err("read_buffer_size must be at least 1".to_string());
        }
        if let Some(tls) = &self.tls
            && (tls.cert_path.as_os_str().is_empty() || tls.key_path.as_os_str().is_empty())
        {
            return Err("tls enabled without certificate and key paths".to_string());
        }
        Ok(())
    }
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parses an environment variable as a boolean. Accepts `"true"`, `"1"`,
/// `"false"`, `"0"` (case-insensitive). Returns `default` otherwise.
fn parse_env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> Option<bool> {
    if value == "1" || value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value == "0" || value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}
