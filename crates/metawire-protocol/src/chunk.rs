//! Binary chunk framing.
//!
//! Every binary WebSocket frame carries one chunk of one stream:
//!
//! ```text
//! [id_len: u8][id: id_len bytes, UTF-8][payload...]
//! ```
//!
//! The id prefix lets the receiver demultiplex chunks of concurrent streams
//! sharing a socket.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the id-length prefix.
const ID_LENGTH_BYTES: usize = 1;

/// Longest stream id that fits the one-byte length prefix.
pub const MAX_ID_LENGTH: usize = u8::MAX as usize;

/// Chunk encoding/decoding failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    /// The stream id was empty.
    #[error("stream id is empty")]
    EmptyId,
    /// The stream id exceeds [`MAX_ID_LENGTH`] bytes.
    #[error("stream id length {0} exceeds maximum of {MAX_ID_LENGTH} bytes")]
    IdTooLong(usize),
    /// The frame is shorter than its header claims.
    #[error("chunk truncated: header needs {needed} bytes, frame has {actual}")]
    Truncated {
        /// Bytes required by the header.
        needed: usize,
        /// Bytes actually present.
        actual: usize,
    },
    /// The id bytes are not valid UTF-8.
    #[error("stream id is not valid UTF-8")]
    InvalidId,
}

/// A decoded chunk borrowing from the received frame.
#[derive(Debug, PartialEq, Eq)]
pub struct Chunk<'a> {
    /// Owning stream id.
    pub id: &'a str,
    /// Payload bytes (may be empty).
    pub payload: &'a [u8],
}

/// Frame `payload` for the stream `id`.
pub fn encode(id: &str, payload: &[u8]) -> Result<Bytes, ChunkError> {
    let id_len = id.len();
    if id_len == 0 {
        return Err(ChunkError::EmptyId);
    }
    let Ok(prefix) = u8::try_from(id_len) else {
        return Err(ChunkError::IdTooLong(id_len));
    };
    let mut frame = BytesMut::with_capacity(ID_LENGTH_BYTES + id_len + payload.len());
    frame.put_u8(prefix);
    frame.put_slice(id.as_bytes());
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// Split a received frame into stream id and payload.
pub fn decode(frame: &[u8]) -> Result<Chunk<'_>, ChunkError> {
    let Some((&id_len, rest)) = frame.split_first() else {
        return Err(ChunkError::Truncated {
            needed: ID_LENGTH_BYTES,
            actual: 0,
        });
    };
    let id_len = usize::from(id_len);
    if id_len == 0 {
        return Err(ChunkError::EmptyId);
    }
    if rest.len() < id_len {
        return Err(ChunkError::Truncated {
            needed: ID_LENGTH_BYTES + id_len,
            actual: frame.len(),
        });
    }
    let (id, payload) = rest.split_at(id_len);
    let id = std::str::from_utf8(id).map_err(|_| ChunkError::InvalidId)?;
    Ok(Chunk { id, payload })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_prefixes_id_length() {
        let frame = encode("abc", b"xyz").unwrap();
        assert_eq!(&frame[..], b"\x03abcxyz");
    }

    #[test]
    fn decode_recovers_id_and_payload() {
        let frame = encode("0192e4c1-stream", b"\x00\x01\x02").unwrap();
        let chunk = decode(&frame).unwrap();
        assert_eq!(chunk.id, "0192e4c1-stream");
        assert_eq!(chunk.payload, b"\x00\x01\x02");
    }

    #[test]
    fn empty_payload_is_allowed() {
        let frame = encode("s1", b"").unwrap();
        let chunk = decode(&frame).unwrap();
        assert_eq!(chunk.id, "s1");
        assert!(chunk.payload.is_empty());
    }

    #[test]
    fn encode_rejects_empty_id() {
        assert_eq!(encode("", b"data"), Err(ChunkError::EmptyId));
    }

    #[test]
    fn encode_rejects_long_id() {
        let id = "x".repeat(256);
        assert_eq!(encode(&id, b""), Err(ChunkError::IdTooLong(256)));
        let id = "x".repeat(255);
        assert!(encode(&id, b"").is_ok());
    }

    #[test]
    fn decode_rejects_empty_frame() {
        assert!(matches!(decode(b""), Err(ChunkError::Truncated { .. })));
    }

    #[test]
    fn decode_rejects_truncated_header() {
        let err = decode(b"\x05ab").unwrap_err();
        assert_eq!(
            err,
            ChunkError::Truncated {
                needed: 6,
                actual: 3
            }
        );
    }

    #[test]
    fn decode_rejects_zero_length_id() {
        assert_eq!(decode(b"\x00payload"), Err(ChunkError::EmptyId));
    }

    #[test]
    fn decode_rejects_invalid_utf8_id() {
        assert_eq!(decode(b"\x02\xff\xfepayload"), Err(ChunkError::InvalidId));
    }

    #[test]
    fn multibyte_id_counts_bytes() {
        let frame = encode("ストリーム", b"p").unwrap();
        assert_eq!(usize::from(frame[0]), "ストリーム".len());
        assert_eq!(decode(&frame).unwrap().id, "ストリーム");
    }
}
