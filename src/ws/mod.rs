//! WebSocket layer: opening handshake, frame codec, and the per-connection
//! frame reader the engine drives on readiness.

pub mod frame;
pub mod handshake;
pub mod session;

pub use frame::{Frame, Opcode};
pub use handshake::HandshakeError;
pub use session::ReadOutcome;
