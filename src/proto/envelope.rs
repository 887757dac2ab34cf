//! Tunnel envelope codec.
//!
//! Every tunnel message travels inside the payload of an ICMP echo packet as
//! a length-prefixed binary envelope. The layout is fixed: a 4-byte kind,
//! three length-prefixed fields (session id, target, payload), two 16-bit
//! flags, the shared auth key, and a terminator sentinel that distinguishes
//! tunnel traffic from unrelated ICMP echoes.
//!
//! Decoding validates every length before it is trusted. Malformed or
//! adversarial buffers produce a [`DecodeError`], never a panic.

use thiserror::Error;

/// Sentinel appended to every envelope; a mismatch means "not our protocol".
pub const TERMINATOR: u32 = 0xAAAA_BBBB;
/// Maximum encoded length of the session id and target fields.
pub const MAX_STRING_LEN: usize = 32;
/// Maximum encoded length of the payload field.
pub const MAX_PAYLOAD_LEN: usize = 2048;

/// Message purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Kind {
    /// Tunneled UDP datagram (either direction).
    Data = 0x0101_0101,
    /// Latency probe; payload is opaque and echoed back verbatim.
    Ping = 0x0202_0202,
    /// Rendezvous poll for queued replies, or the release of one.
    Catch = 0x0303_0303,
}

impl Kind {
    fn from_wire(value: u32) -> Option<Kind> {
        match value {
            0x0101_0101 => Some(Kind::Data),
            0x0202_0202 => Some(Kind::Ping),
            0x0303_0303 => Some(Kind::Catch),
            _ => None,
        }
    }
}

/// Why a buffer failed to decode as an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("buffer truncated: needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("{field} length {len} exceeds limit {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("unknown message kind {0:#010x}")]
    UnknownKind(u32),
    #[error("terminator mismatch {0:#010x}")]
    BadTerminator(u32),
}

/// The application-level tunnel message.
///
/// The terminator is implicit: written by [`Envelope::encode`], checked by
/// [`Envelope::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: Kind,
    /// Logical flow identifier; empty only for PING.
    pub session_id: String,
    /// UDP destination "host:port"; empty for PING and CATCH polls.
    pub target: String,
    pub payload: Vec<u8>,
    /// ICMP type to use when echoing a reply; -1 selects echo reply (0).
    pub reply_protocol: i16,
    /// Nonzero enables rendezvous queuing for this session.
    pub catch_mode: i16,
    /// Must match the server's configured key or the message is discarded.
    pub auth_key: u32,
}

impl Envelope {
    /// Check the field bounds the wire format can express.
    ///
    /// `encode` assumes fields are in bounds; callers constructing envelopes
    /// from untrusted input should validate first.
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.session_id.len() > MAX_STRING_LEN {
            return Err(DecodeError::FieldTooLong {
                field: "session id",
                len: self.session_id.len(),
                max: MAX_STRING_LEN,
            });
        }
        if self.target.len() > MAX_STRING_LEN {
            return Err(DecodeError::FieldTooLong {
                field: "target",
                len: self.target.len(),
                max: MAX_STRING_LEN,
            });
        }
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(DecodeError::FieldTooLong {
                field: "payload",
                len: self.payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        Ok(())
    }

    /// Total encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        4 + (2 + self.session_id.len()) + (2 + self.target.len()) + (2 + self.payload.len())
            + 2
            + 2
            + 4
            + 4
    }

    /// Serialize to the wire layout. All integers are big-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&(self.kind as u32).to_be_bytes());
        put_prefixed(&mut buf, self.session_id.as_bytes());
        put_prefixed(&mut buf, self.target.as_bytes());
        put_prefixed(&mut buf, &self.payload);
        buf.extend_from_slice(&self.reply_protocol.to_be_bytes());
        buf.extend_from_slice(&self.catch_mode.to_be_bytes());
        buf.extend_from_slice(&self.auth_key.to_be_bytes());
        buf.extend_from_slice(&TERMINATOR.to_be_bytes());
        buf
    }

    /// Deserialize from the wire layout.
    ///
    /// Trailing bytes after the terminator are ignored (ICMP payloads may be
    /// padded in transit).
    pub fn decode(buf: &[u8]) -> Result<Envelope, DecodeError> {
        let mut r = Reader::new(buf);

        let raw_kind = r.take_u32()?;
        let kind = Kind::from_wire(raw_kind).ok_or(DecodeError::UnknownKind(raw_kind))?;

        let session_id = take_string(&mut r, "session id")?;
        let target = take_string(&mut r, "target")?;

        let payload_len = r.take_u16()? as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(DecodeError::FieldTooLong {
                field: "payload",
                len: payload_len,
                max: MAX_PAYLOAD_LEN,
            });
        }
        let payload = r.take_bytes(payload_len)?.to_vec();

        let reply_protocol = r.take_u16()? as i16;
        let catch_mode = r.take_u16()? as i16;
        let auth_key = r.take_u32()?;

        let terminator = r.take_u32()?;
        if terminator != TERMINATOR {
            return Err(DecodeError::BadTerminator(terminator));
        }

        Ok(Envelope {
            kind,
            session_id,
            target,
            payload,
            reply_protocol,
            catch_mode,
            auth_key,
        })
    }
}

fn put_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn take_string(r: &mut Reader<'_>, field: &'static str) -> Result<String, DecodeError> {
    let len = r.take_u16()? as usize;
    if len > MAX_STRING_LEN {
        return Err(DecodeError::FieldTooLong {
            field,
            len,
            max: MAX_STRING_LEN,
        });
    }
    let bytes = r.take_bytes(len)?;
    // Session ids and targets are produced from strings on the client side;
    // a non-UTF8 field is replaced rather than rejected.
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// Bounds-checked cursor over the input buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let remaining = self.buf.len() - self.pos;
        if remaining < len {
            return Err(DecodeError::Truncated {
                needed: len - remaining,
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn take_u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn take_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope {
            kind: Kind::Data,
            session_id: "s1".to_string(),
            target: "127.0.0.1:9999".to_string(),
            payload: b"ping".to_vec(),
            reply_protocol: -1,
            catch_mode: 1,
            auth_key: 42,
        }
    }

    #[test]
    fn test_round_trip() {
        let e = sample();
        let bytes = e.encode();
        assert_eq!(bytes.len(), e.encoded_len());
        assert_eq!(Envelope::decode(&bytes).unwrap(), e);
    }

    #[test]
    fn test_round_trip_empty_fields() {
        let e = Envelope {
            kind: Kind::Ping,
            session_id: String::new(),
            target: String::new(),
            payload: Vec::new(),
            reply_protocol: 8,
            catch_mode: 0,
            auth_key: 0,
        };
        assert_eq!(Envelope::decode(&e.encode()).unwrap(), e);
    }

    #[test]
    fn test_round_trip_max_sizes() {
        let e = Envelope {
            kind: Kind::Catch,
            session_id: "x".repeat(MAX_STRING_LEN),
            target: "y".repeat(MAX_STRING_LEN),
            payload: vec![0xAB; MAX_PAYLOAD_LEN],
            reply_protocol: i16::MIN,
            catch_mode: i16::MAX,
            auth_key: u32::MAX,
        };
        assert_eq!(Envelope::decode(&e.encode()).unwrap(), e);
    }

    #[test]
    fn test_wire_layout() {
        let bytes = sample().encode();
        // kind
        assert_eq!(&bytes[0..4], &[0x01, 0x01, 0x01, 0x01]);
        // session id length prefix
        assert_eq!(&bytes[4..6], &[0x00, 0x02]);
        assert_eq!(&bytes[6..8], b"s1");
        // terminator sits at the very end
        assert_eq!(&bytes[bytes.len() - 4..], &[0xAA, 0xAA, 0xBB, 0xBB]);
    }

    #[test]
    fn test_truncated_at_every_boundary() {
        let bytes = sample().encode();
        for cut in 0..bytes.len() {
            assert!(
                Envelope::decode(&bytes[..cut]).is_err(),
                "decode succeeded on {cut}-byte prefix"
            );
        }
    }

    #[test]
    fn test_flipped_terminator() {
        let mut bytes = sample().encode();
        let end = bytes.len();
        bytes[end - 1] ^= 0xFF;
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(DecodeError::BadTerminator(_))
        ));
    }

    #[test]
    fn test_unknown_kind() {
        let mut bytes = sample().encode();
        bytes[0] = 0x7F;
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(DecodeError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_oversized_string_length() {
        let mut bytes = sample().encode();
        // Declare a 33-byte session id without supplying the bytes
        bytes[4] = 0x00;
        bytes[5] = 33;
        assert_eq!(
            Envelope::decode(&bytes),
            Err(DecodeError::FieldTooLong {
                field: "session id",
                len: 33,
                max: MAX_STRING_LEN,
            })
        );
    }

    #[test]
    fn test_oversized_payload_length() {
        let e = Envelope {
            payload: vec![0; 16],
            ..sample()
        };
        let mut bytes = e.encode();
        // Payload length prefix follows kind + two 2+len string fields
        let off = 4 + (2 + e.session_id.len()) + (2 + e.target.len());
        let declared = (MAX_PAYLOAD_LEN as u16 + 1).to_be_bytes();
        bytes[off] = declared[0];
        bytes[off + 1] = declared[1];
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(DecodeError::FieldTooLong { field: "payload", .. })
        ));
    }

    #[test]
    fn test_trailing_padding_ignored() {
        let e = sample();
        let mut bytes = e.encode();
        bytes.extend_from_slice(&[0u8; 16]);
        assert_eq!(Envelope::decode(&bytes).unwrap(), e);
    }

    #[test]
    fn test_validate_bounds() {
        let mut e = sample();
        assert!(e.validate().is_ok());
        e.session_id = "x".repeat(MAX_STRING_LEN + 1);
        assert!(e.validate().is_err());
        e.session_id = "s1".to_string();
        e.payload = vec![0; MAX_PAYLOAD_LEN + 1];
        assert!(e.validate().is_err());
    }
}
