//! WebSocket opening handshake (RFC 6455 §4.2).

use std::io::{self, Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};

/// GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest accepted handshake request, headers included.
pub const MAX_REQUEST_SIZE: usize = 4096;

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Reasons an upgrade request is refused.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The peer closed the connection before sending a full request.
    #[error("connection closed during handshake")]
    Closed,
    /// The first line is not `GET <uri> HTTP/1.1`.
    #[error("malformed request line")]
    RequestLine,
    /// `Upgrade: websocket` is missing.
    #[error("missing or unsupported Upgrade header")]
    Upgrade,
    /// `Sec-WebSocket-Key` is missing or empty.
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
    /// No end of headers within [`MAX_REQUEST_SIZE`] bytes.
    #[error("handshake request exceeds {MAX_REQUEST_SIZE} bytes")]
    TooLarge,
    /// Socket error while reading the request or writing the response.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A parsed upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Request target from the request line.
    pub uri: String,
    headers: Vec<(String, String)>,
}

impl Request {
    /// Parses the request line and header block.
    ///
    /// Header lines are split at the first `:`, the value loses its leading
    /// spaces and ends at `\r`. Parsing stops at the first blank line or the
    /// first line without a colon.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::RequestLine`] if the first line is not a
    /// `GET` request for HTTP/1.1.
    pub fn parse(bytes: &[u8]) -> Result<Self, HandshakeError> {
        let text = String::from_utf8_lossy(bytes);
        let mut lines = text.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line));

        let request_line = lines.next().ok_or(HandshakeError::RequestLine)?;
        let mut parts = request_line.split_whitespace();
        let uri = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("GET"), Some(uri), Some("HTTP/1.1"), None) => uri.to_string(),
            _ => return Err(HandshakeError::RequestLine),
        };

        let headers = lines
            .map_while(|line| line.split_once(':'))
            .map(|(name, value)| (name.to_string(), value.trim_start_matches(' ').to_string()))
            .collect();

        Ok(Self { uri, headers })
    }

    /// Returns the first header named `name` (ASCII case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Computes `base64(SHA-1(key ++ GUID))`.
#[must_use]
pub fn accept_token(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Validates an upgrade request and returns the accept token.
///
/// # Errors
///
/// Returns a [`HandshakeError`] if the request line is malformed or the
/// `Upgrade: websocket` / `Sec-WebSocket-Key` headers are missing.
pub fn negotiate(request: &[u8]) -> Result<String, HandshakeError> {
    let request = Request::parse(request)?;

    match request.header("Upgrade") {
        Some(v) if v.trim_end().eq_ignore_ascii_case("websocket") => {}
        _ => return Err(HandshakeError::Upgrade),
    }

    let key = request
        .header("Sec-WebSocket-Key")
        .map(str::trim_end)
        .filter(|k| !k.is_empty())
        .ok_or(HandshakeError::MissingKey)?;

    Ok(accept_token(key))
}

/// The fixed `101 Switching Protocols` response carrying `token`.
#[must_use]
pub fn response(token: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Expect: 101\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Accept: {token}\r\n\r\n"
    )
}

/// Reads an upgrade request from `stream`, answers it, and returns any bytes
/// the client sent after the header block.
///
/// # Errors
///
/// Returns a [`HandshakeError`] if the request is malformed, too large, the
/// peer disconnects, or the socket fails. Nothing is written on failure.
pub fn perform<S: Read + Write>(stream: &mut S) -> Result<Vec<u8>, HandshakeError> {
    let mut request = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let header_len = loop {
        if let Some(pos) = request.windows(HEADER_END.len()).position(|w| w == HEADER_END) {
            break pos + HEADER_END.len();
        }
        if request.len() >= MAX_REQUEST_SIZE {
            return Err(HandshakeError::TooLarge);
        }
        match stream.read(&mut chunk) {
            Ok(0) => return Err(HandshakeError::Closed),
            Ok(n) => request.extend_from_slice(chunk.get(..n).unwrap_or_default()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    };

    let leftover = request.split_off(header_len);
    let token = negotiate(&request)?;

    stream.write_all(response(&token).as_bytes())?;
    stream.flush()?;

    Ok(leftover)
}
