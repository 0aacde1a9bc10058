//! Reads one WebSocket frame from a registered connection and applies it.
//!
//! Data frames accumulate into the connection's inbound buffer until a frame
//! with the fin bit completes the message. Control frames are answered here
//! and never touch that buffer, so they may arrive between fragments.

use std::io::{self, Read};
use std::time::Duration;

use crate::net::RetryReader;
use crate::server::connection::{Connection, ConnectionState, DataKind};
use crate::ws::frame::{self, MAX_INLINE_LEN, Opcode};

/// What a single frame read produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A message is complete; take it with `Connection::take_inbound`.
    Message,
    /// A fragment was buffered; more are expected.
    Partial,
    /// A control frame was handled (ping answered, pong checked).
    Control,
    /// The frame carried nothing to act on.
    Ignore,
    /// No frame is waiting.
    WouldBlock,
    /// The peer closed or went away.
    Disconnect,
    /// The peer broke the protocol.
    Violation(String),
}

/// Reads and processes one frame.
///
/// The first byte is read without waiting; once a frame has started, the rest
/// of it must arrive within `io_timeout`.
///
/// # Errors
///
/// Returns the socket error when reading the frame or writing a reply fails.
/// A frame that stalls past `io_timeout` yields [`io::ErrorKind::TimedOut`].
pub fn read_frame(conn: &mut Connection, max_message_size: usize, io_timeout: Duration) -> io::Result<ReadOutcome> {
    let mut first = [0u8; 1];
    loop {
        match conn.stream.read(&mut first) {
            Ok(0) => return Ok(ReadOutcome::Disconnect),
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::WouldBlock),
            Err(e) => return Err(e),
        }
    }

    let mut reader = (&first[..]).chain(RetryReader::new(&mut conn.stream, io_timeout));
    let Some(header) = frame::decode_header(&mut reader)? else {
        return Ok(ReadOutcome::Disconnect);
    };

    let len = match usize::try_from(header.payload_len) {
        Ok(len) if len <= max_message_size => len,
        _ => {
            return Ok(ReadOutcome::Violation(format!(
                "frame payload of {} bytes exceeds {max_message_size}",
                header.payload_len
            )));
        }
    };

    match header.opcode {
        Opcode::Text | Opcode::Binary | Opcode::Continuation => {
            let continuing = conn.state == ConnectionState::ReadContinue && header.opcode == Opcode::Continuation;

            if !continuing {
                conn.inbound.data.clear();
                match header.opcode {
                    Opcode::Text => conn.inbound.kind = DataKind::Text,
                    Opcode::Binary => conn.inbound.kind = DataKind::Binary,
                    _ => {}
                }
            }

            // Empty fragments carry no data but still open or close a message.
            if len == 0 {
                conn.touch();
                if !header.fin {
                    conn.state = ConnectionState::ReadContinue;
                    return Ok(ReadOutcome::Ignore);
                }
                conn.state = ConnectionState::Default;
                if continuing && !conn.inbound.data.is_empty() {
                    return Ok(ReadOutcome::Message);
                }
                return Ok(ReadOutcome::Ignore);
            }

            let start = conn.inbound.data.len();
            if start + len > max_message_size {
                return Ok(ReadOutcome::Violation(format!(
                    "message of {} bytes exceeds {max_message_size}",
                    start + len
                )));
            }

            conn.inbound.data.resize(start + len, 0);
            let fragment = conn.inbound.data.get_mut(start..).unwrap_or_default();
            reader.read_exact(fragment)?;
            frame::unmask(&header, fragment);
            conn.touch();

            if header.fin {
                conn.state = ConnectionState::Default;
                Ok(ReadOutcome::Message)
            } else {
                conn.state = ConnectionState::ReadContinue;
                Ok(ReadOutcome::Partial)
            }
        }

        Opcode::Close => {
            read_payload(&mut reader, len)?;
            if let Err(err) = conn.send_frame(Opcode::Close, &[], io_timeout) {
                tracing::debug!(connection = %conn.id(), %err, "close reply not sent");
            }
            Ok(ReadOutcome::Disconnect)
        }

        Opcode::Ping => {
            if len > MAX_INLINE_LEN {
                return Ok(ReadOutcome::Violation(format!("ping payload of {len} bytes")));
            }
            let mut payload = read_payload(&mut reader, len)?;
            frame::unmask(&header, &mut payload);
            conn.touch();
            conn.send_frame(Opcode::Pong, &payload, io_timeout)?;
            Ok(ReadOutcome::Control)
        }

        Opcode::Pong => {
            if len == 0 {
                conn.touch();
                return Ok(ReadOutcome::Ignore);
            }
            let mut payload = read_payload(&mut reader, len)?;
            frame::unmask(&header, &mut payload);
            conn.touch();
            match conn.last_ping {
                Some(expected) if !frame::pong_matches(&payload, expected) => {
                    Ok(ReadOutcome::Violation("pong does not echo the last ping".to_string()))
                }
                Some(_) => {
                    conn.last_ping = None;
                    Ok(ReadOutcome::Control)
                }
                None => Ok(ReadOutcome::Control),
            }
        }

        Opcode::Unimplemented(bits) => {
            read_payload(&mut reader, len)?;
            tracing::warn!(connection = %conn.id(), opcode = bits, "unimplemented opcode, frame skipped");
            Ok(ReadOutcome::Ignore)
        }
    }
}

fn read_payload<R: Read>(reader: &mut R, len: usize) -> io::Result<Vec<u8>> {
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}
