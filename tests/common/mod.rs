//! Shared harness: runs a server on a background thread and records every
//! event it delivers.

#![allow(dead_code, clippy::panic)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use evsock::ws::frame::{self, Frame, Opcode};
use evsock::{Clients, Event, EventHandler, EventKind, Server, ServerConfig, ShutdownHandle};

pub const TIMEOUT: Duration = Duration::from_secs(3);
pub const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];
pub const PING_VALUE: u64 = 0x0123_4567_89ab_cdef;

pub type Events = Arc<Mutex<Vec<Event>>>;

/// Records events and echoes data. A text message `ping-me` makes the server
/// ping the sender instead; `bye` makes it delete the sender.
#[derive(Debug)]
pub struct Recorder {
    events: Events,
}

impl Recorder {
    fn record(&self, event: &Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

impl EventHandler for Recorder {
    fn on_connect(&mut self, _clients: &mut Clients<'_>, event: &Event) {
        self.record(event);
    }

    fn on_data(&mut self, clients: &mut Clients<'_>, event: &Event) {
        self.record(event);
        let Some(received) = &event.received else {
            return;
        };
        let result = match received.as_text() {
            Some("ping-me") => clients.ping(event.connection, PING_VALUE).map(|()| 0),
            Some("bye") => {
                clients.delete(event.connection);
                Ok(0)
            }
            _ if received.is_binary() => clients.write_binary(event.connection, &received.data),
            _ => clients.write(event.connection, &received.data),
        };
        if let Err(err) = result {
            panic!("handler write failed: {err}");
        }
    }

    fn on_disconnect(&mut self, _clients: &mut Clients<'_>, event: &Event) {
        self.record(event);
    }

    fn on_error(&mut self, _clients: &mut Clients<'_>, event: &Event) {
        self.record(event);
    }
}

/// A server running on its own thread; stopped and joined on drop.
pub struct Harness {
    pub addr: Option<SocketAddr>,
    pub events: Events,
    shutdown: ShutdownHandle,
    thread: Option<JoinHandle<()>>,
}

impl Harness {
    pub fn start(config: ServerConfig) -> Self {
        let events: Events = Arc::default();
        let handler = Recorder {
            events: Arc::clone(&events),
        };
        let (tx, rx) = mpsc::channel();

        let thread = thread::spawn(move || {
            let mut server = match Server::bind(config, handler) {
                Ok(server) => server,
                Err(err) => panic!("bind failed: {err}"),
            };
            let _ = tx.send((server.local_addr(), server.shutdown_handle()));
            if let Err(err) = server.run() {
                panic!("server failed: {err}");
            }
        });

        let Ok((addr, shutdown)) = rx.recv_timeout(TIMEOUT) else {
            panic!("server did not start");
        };
        Self {
            addr,
            events,
            shutdown,
            thread: Some(thread),
        }
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        let Some(addr) = self.addr else {
            panic!("server is not listening on TCP");
        };
        addr
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    pub fn data(&self) -> Vec<Vec<u8>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|e| e.received.as_ref().map(|r| r.data.clone()))
            .collect()
    }

    /// Waits until `kind` has been seen `n` times.
    pub fn wait_for(&self, kind: EventKind, n: usize) {
        let deadline = Instant::now() + TIMEOUT;
        while self.count(kind) < n {
            assert!(Instant::now() < deadline, "expected {n} {kind:?} events, saw {}", self.count(kind));
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Stops the server and waits for its thread.
    pub fn stop(&mut self) {
        self.shutdown.terminate();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            panic!("server thread panicked");
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.terminate();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let Ok(stream) = TcpStream::connect(addr) else {
        panic!("connect to {addr} failed");
    };
    let Ok(()) = stream.set_read_timeout(Some(TIMEOUT)) else {
        panic!("set_read_timeout failed");
    };
    stream
}

pub fn upgrade_request() -> String {
    "GET /chat HTTP/1.1\r\n\
     Host: localhost\r\n\
     Upgrade: websocket\r\n\
     Connection: Upgrade\r\n\
     Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
     Sec-WebSocket-Version: 13\r\n\r\n"
        .to_string()
}

/// Reads the handshake response up to the blank line.
pub fn read_response(stream: &mut TcpStream) -> String {
    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => response.extend_from_slice(&byte),
            other => panic!("handshake response cut short: {other:?}"),
        }
    }
    String::from_utf8_lossy(&response).into_owned()
}

/// Connects and completes the opening handshake.
pub fn ws_connect(addr: SocketAddr) -> TcpStream {
    let mut stream = connect(addr);
    let Ok(()) = stream.write_all(upgrade_request().as_bytes()) else {
        panic!("request write failed");
    };
    let response = read_response(&mut stream);
    assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{response}");
    assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    stream
}

/// Sends one masked client frame.
pub fn send(stream: &mut TcpStream, opcode: Opcode, fin: bool, payload: &[u8]) {
    let Ok(()) = stream.write_all(&frame::encode_frame_with(opcode, fin, Some(MASK), payload)) else {
        panic!("frame write failed");
    };
}

/// Receives one server frame.
pub fn recv(stream: &mut TcpStream) -> (Frame, Vec<u8>) {
    let header = match frame::decode_header(stream) {
        Ok(Some(header)) => header,
        other => panic!("no frame: {other:?}"),
    };
    assert!(!header.masked, "server frames are never masked");
    let Ok(len) = usize::try_from(header.payload_len) else {
        panic!("frame too large");
    };
    let mut payload = vec![0u8; len];
    let Ok(()) = stream.read_exact(&mut payload) else {
        panic!("payload cut short");
    };
    (header, payload)
}

/// Returns `true` once the server has closed `stream`.
pub fn is_closed(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => return true,
            Err(_) => return false,
        }
    }
}
