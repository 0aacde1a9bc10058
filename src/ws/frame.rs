//! WebSocket frame codec.
//!
//! Header layout (RFC 6455 §5.2):
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |                               |  Masking-key, if MASK set to 1 |
//! +-------------------------------+-------------------------------+
//! ```
//!
//! Everything here is pure: decoding works on any [`Read`], encoding
//! returns owned bytes.

use std::io::{self, Read};

/// Largest payload length encoded inline in the second header byte.
pub const MAX_INLINE_LEN: usize = 125;

/// Largest payload length encoded in the 16-bit extended field.
pub const MAX_EXTENDED16_LEN: usize = 65535;

/// Length prefix announcing a 16-bit extended length.
const LEN_EXTENDED16: u8 = 126;

/// Length prefix announcing a 64-bit extended length.
const LEN_EXTENDED64: u8 = 127;

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const OPCODE_BITS: u8 = 0x0f;
const LEN_BITS: u8 = 0x7f;

/// Frame type carried in the low nibble of the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// `0x0`: continues a fragmented message.
    Continuation,
    /// `0x1`: UTF-8 text data.
    Text,
    /// `0x2`: binary data.
    Binary,
    /// `0x8`: connection close.
    Close,
    /// `0x9`: ping.
    Ping,
    /// `0xA`: pong.
    Pong,
    /// Any reserved opcode; carries the raw nibble.
    Unimplemented(u8),
}

impl Opcode {
    /// Maps the low nibble of a header byte to an opcode.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        match byte & OPCODE_BITS {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Unimplemented(other),
        }
    }

    /// Returns the 4-bit wire value.
    #[must_use]
    pub const fn bits(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
            Self::Unimplemented(bits) => bits & OPCODE_BITS,
        }
    }

    /// Returns `true` for close, ping and pong.
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Frame type.
    pub opcode: Opcode,
    /// Final fragment of a message.
    pub fin: bool,
    /// Payload is XOR-masked with [`Frame::mask`].
    pub masked: bool,
    /// Masking key; all zero when unmasked.
    pub mask: [u8; 4],
    /// Declared payload length.
    pub payload_len: u64,
}

/// Decodes one frame header.
///
/// Returns `Ok(None)` if the stream ends cleanly before the first header
/// byte. The masking key is read only when the mask bit is set.
///
/// # Errors
///
/// Returns [`io::ErrorKind::UnexpectedEof`] if the stream ends inside the
/// header, or any error from the reader.
pub fn decode_header<R: Read>(reader: &mut R) -> io::Result<Option<Frame>> {
    let mut first = [0u8; 1];
    loop {
        match reader.read(&mut first) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    let [b0] = first;

    let mut second = [0u8; 1];
    reader.read_exact(&mut second)?;
    let [b1] = second;

    let payload_len = match b1 & LEN_BITS {
        LEN_EXTENDED16 => {
            let mut ext = [0u8; 2];
            reader.read_exact(&mut ext)?;
            u64::from(u16::from_be_bytes(ext))
        }
        LEN_EXTENDED64 => {
            let mut ext = [0u8; 8];
            reader.read_exact(&mut ext)?;
            u64::from_be_bytes(ext)
        }
        inline => u64::from(inline),
    };

    let masked = b1 & MASK_BIT != 0;
    let mut mask = [0u8; 4];
    if masked {
        reader.read_exact(&mut mask)?;
    }

    Ok(Some(Frame {
        opcode: Opcode::from_byte(b0),
        fin: b0 & FIN_BIT != 0,
        masked,
        mask,
        payload_len,
    }))
}

/// Unmasks `payload` in place if the frame is masked.
pub fn unmask(frame: &Frame, payload: &mut [u8]) {
    if frame.masked {
        apply_mask(frame.mask, payload);
    }
}

/// XORs byte *i* with `mask[i % 4]`. Applying it twice restores the input.
pub fn apply_mask(mask: [u8; 4], payload: &mut [u8]) {
    for (byte, key) in payload.iter_mut().zip(mask.iter().cycle()) {
        *byte ^= key;
    }
}

/// Encodes a final, unmasked text frame.
#[must_use]
pub fn encode_data_frame(payload: &[u8]) -> Vec<u8> {
    encode_frame(Opcode::Text, payload)
}

/// Encodes a final, unmasked frame of any type.
#[must_use]
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    encode_frame_with(opcode, true, None, payload)
}

/// Encodes a frame with explicit fin bit and optional masking key.
///
/// Servers never mask; a key is only passed when acting as a client.
#[must_use]
pub fn encode_frame_with(opcode: Opcode, fin: bool, mask: Option<[u8; 4]>, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    let fin_bit = if fin { FIN_BIT } else { 0 };
    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };

    out.push(fin_bit | opcode.bits());
    match payload.len() {
        len if len <= MAX_INLINE_LEN => out.push(mask_bit | len as u8),
        len if len <= MAX_EXTENDED16_LEN => {
            out.push(mask_bit | LEN_EXTENDED16);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            out.push(mask_bit | LEN_EXTENDED64);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(payload);
            apply_mask(key, out.get_mut(start..).unwrap_or_default());
        }
        None => out.extend_from_slice(payload),
    }
    out
}

/// Encodes the 8-byte big-endian payload of a server ping.
#[must_use]
pub const fn ping_payload(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

/// Returns `true` if `payload` is exactly the 8-byte big-endian `expected`.
#[must_use]
pub fn pong_matches(payload: &[u8], expected: u64) -> bool {
    <[u8; 8]>::try_from(payload).is_ok_and(|bytes| u64::from_be_bytes(bytes) == expected)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn decode(bytes: &[u8]) -> (Frame, Vec<u8>) {
        let mut cursor = Cursor::new(bytes);
        let Ok(Some(frame)) = decode_header(&mut cursor) else {
            panic!("expected a frame header");
        };
        let Ok(len) = usize::try_from(frame.payload_len) else {
            panic!("length overflow");
        };
        let mut payload = vec![0u8; len];
        let Ok(()) = cursor.read_exact(&mut payload) else {
            panic!("payload truncated");
        };
        unmask(&frame, &mut payload);
        (frame, payload)
    }

    #[test]
    fn round_trip_at_length_tier_boundaries() {
        for len in [0usize, 125, 126, 65535, 65536] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let encoded = encode_data_frame(&payload);
            let (frame, decoded) = decode(&encoded);
            assert_eq!(frame.opcode, Opcode::Text);
            assert!(frame.fin);
            assert!(!frame.masked);
            assert_eq!(frame.payload_len, len as u64);
            assert_eq!(decoded, payload, "length {len}");
        }
    }

    #[test]
    fn header_size_follows_length_tier() {
        assert_eq!(encode_data_frame(&[0; 125]).len(), 2 + 125);
        assert_eq!(encode_data_frame(&[0; 126]).len(), 4 + 126);
        assert_eq!(encode_data_frame(&[0; 65535]).len(), 4 + 65535);
        assert_eq!(encode_data_frame(&[0; 65536]).len(), 10 + 65536);
    }

    #[test]
    fn text_frame_first_byte_is_fin_plus_text() {
        let encoded = encode_data_frame(b"hi");
        assert_eq!(encoded, vec![0x81, 0x02, b'h', b'i']);
    }

    #[test]
    fn masked_client_frame_decodes() {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        // RFC 6455 §5.7 single-frame masked "Hello".
        let encoded = encode_frame_with(Opcode::Text, true, Some(mask), b"Hello");
        assert_eq!(
            encoded,
            vec![0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );
        let (frame, payload) = decode(&encoded);
        assert!(frame.masked);
        assert_eq!(frame.mask, mask);
        assert_eq!(payload, b"Hello");
    }

    #[test]
    fn masking_is_involutive() {
        let mask = [0xde, 0xad, 0xbe, 0xef];
        let original: Vec<u8> = (0..=255u8).chain(0..7).collect();
        let mut bytes = original.clone();
        apply_mask(mask, &mut bytes);
        assert_ne!(bytes, original);
        apply_mask(mask, &mut bytes);
        assert_eq!(bytes, original);
    }

    #[test]
    fn unmask_leaves_unmasked_payload_alone() {
        let frame = Frame {
            opcode: Opcode::Binary,
            fin: true,
            masked: false,
            mask: [1, 2, 3, 4],
            payload_len: 3,
        };
        let mut payload = vec![9, 9, 9];
        unmask(&frame, &mut payload);
        assert_eq!(payload, vec![9, 9, 9]);
    }

    #[test]
    fn opcode_map() {
        assert_eq!(Opcode::from_byte(0x80), Opcode::Continuation);
        assert_eq!(Opcode::from_byte(0x81), Opcode::Text);
        assert_eq!(Opcode::from_byte(0x02), Opcode::Binary);
        assert_eq!(Opcode::from_byte(0x88), Opcode::Close);
        assert_eq!(Opcode::from_byte(0x89), Opcode::Ping);
        assert_eq!(Opcode::from_byte(0x8a), Opcode::Pong);
        assert_eq!(Opcode::from_byte(0x83), Opcode::Unimplemented(3));
        assert_eq!(Opcode::Unimplemented(0xb).bits(), 0xb);
        assert!(Opcode::Ping.is_control());
        assert!(!Opcode::Continuation.is_control());
    }

    #[test]
    fn fragment_header_has_no_fin() {
        let encoded = encode_frame_with(Opcode::Text, false, None, b"par");
        let (frame, payload) = decode(&encoded);
        assert!(!frame.fin);
        assert_eq!(payload, b"par");
    }

    #[test]
    fn empty_stream_is_closed() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let Ok(None) = decode_header(&mut cursor) else {
            panic!("expected clean close");
        };
    }

    #[test]
    fn truncated_header_is_an_error() {
        // 16-bit extended length announced but only one length byte present.
        let mut cursor = Cursor::new(vec![0x81, 0xfe, 0x01]);
        let Err(err) = decode_header(&mut cursor) else {
            panic!("expected truncated header error");
        };
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn sixty_four_bit_length_is_big_endian() {
        let mut bytes = vec![0x82, 0x7f];
        bytes.extend_from_slice(&0x0000_0001_0000_0000u64.to_be_bytes());
        let mut cursor = Cursor::new(bytes);
        let Ok(Some(frame)) = decode_header(&mut cursor) else {
            panic!("expected frame");
        };
        assert_eq!(frame.payload_len, 1 << 32);
        assert_eq!(frame.opcode, Opcode::Binary);
    }

    #[test]
    fn pong_payload_comparison() {
        let payload = ping_payload(0x0102_0304_0506_0708);
        assert_eq!(payload, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(pong_matches(&payload, 0x0102_0304_0506_0708));
        assert!(!pong_matches(&payload, 7));
        assert!(!pong_matches(payload.get(..7).unwrap_or_default(), 0x0102_0304_0506_07));
    }
}
