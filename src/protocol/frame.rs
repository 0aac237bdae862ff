//! Frame encoding and decoding.

use crc::{Crc, CRC_32_ISO_HDLC};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::types::{MiddlewareError, Result};

use super::{FLAG_ERROR, MSG_HEARTBEAT, PROTOCOL_VERSION};

/// Length of the fixed header: version(1) + type(2) + flags(1) + sequence(4)
/// + timestamp(8) + body_length(4) + checksum(4) + game_id_length(2)
/// + user_id_length(2).
pub const FIXED_HEADER_LEN: usize = 28;

const CHECKSUM_OFFSET: usize = 20;

/// CRC32-IEEE, the checksum every frame carries.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// One complete wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: u16,
    pub flags: u8,
    pub sequence: u32,
    pub timestamp: i64,
    pub game_id: String,
    pub user_id: String,
    pub body: Vec<u8>,
}

impl Frame {
    /// Total encoded length of this frame.
    pub fn encoded_len(&self) -> usize {
        FIXED_HEADER_LEN + self.game_id.len() + self.user_id.len() + self.body.len()
    }

    pub fn need_response(&self) -> bool {
        self.flags & super::FLAG_NEED_RESPONSE != 0
    }

    pub fn is_heartbeat(&self) -> bool {
        self.message_type == MSG_HEARTBEAT
    }

    /// Heartbeat frame the server emits on an idle session.
    pub fn heartbeat(sequence: u32, timestamp: i64) -> Self {
        Self {
            message_type: MSG_HEARTBEAT,
            flags: 0,
            sequence,
            timestamp,
            game_id: String::new(),
            user_id: String::new(),
            body: Vec::new(),
        }
    }

    /// Error reply mirroring a request frame: flags carry the error bit and
    /// the body is the JSON envelope `{code, message}`.
    pub fn error_reply(request: &Frame, timestamp: i64, err: &MiddlewareError) -> Self {
        let body = serde_json::json!({
            "code": err.code(),
            "message": err.to_string(),
        });
        Self {
            message_type: request.message_type,
            flags: FLAG_ERROR,
            sequence: request.sequence,
            timestamp,
            game_id: request.game_id.clone(),
            user_id: request.user_id.clone(),
            body: body.to_string().into_bytes(),
        }
    }

    /// Encode to wire bytes. Deterministic: the same frame always produces
    /// identical output.
    pub fn encode(&self, max_body: usize) -> Result<Vec<u8>> {
        if self.body.len() > max_body {
            return Err(MiddlewareError::Oversize {
                got: self.body.len(),
                limit: max_body,
            });
        }
        if self.game_id.len() > u16::MAX as usize || self.user_id.len() > u16::MAX as usize {
            return Err(MiddlewareError::ProtocolViolation(
                "game or user id exceeds u16 length field".to_string(),
            ));
        }

        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(PROTOCOL_VERSION);
        buf.extend_from_slice(&self.message_type.to_be_bytes());
        buf.push(self.flags);
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&(self.body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes()); // checksum slot, filled below
        buf.extend_from_slice(&(self.game_id.len() as u16).to_be_bytes());
        buf.extend_from_slice(&(self.user_id.len() as u16).to_be_bytes());
        buf.extend_from_slice(self.game_id.as_bytes());
        buf.extend_from_slice(self.user_id.as_bytes());
        buf.extend_from_slice(&self.body);

        let checksum = CRC32.checksum(&buf);
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_be_bytes());
        Ok(buf)
    }

    /// Decode a complete frame from `buf`. The buffer must hold exactly the
    /// frame; a short buffer is `Truncated`, a body over `max_body` is
    /// `Oversize`, and a checksum mismatch never yields a frame.
    pub fn decode(buf: &[u8], max_body: usize) -> Result<Frame> {
        if buf.len() < FIXED_HEADER_LEN {
            return Err(MiddlewareError::Truncated {
                need: FIXED_HEADER_LEN,
                have: buf.len(),
            });
        }
        if buf[0] != PROTOCOL_VERSION {
            return Err(MiddlewareError::BadMagic(buf[0]));
        }

        let message_type = u16::from_be_bytes([buf[1], buf[2]]);
        let flags = buf[3];
        let sequence = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let timestamp = i64::from_be_bytes([
            buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
        ]);
        let body_len = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]) as usize;
        let stored_checksum = u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]);
        let game_len = u16::from_be_bytes([buf[24], buf[25]]) as usize;
        let user_len = u16::from_be_bytes([buf[26], buf[27]]) as usize;

        if body_len > max_body {
            return Err(MiddlewareError::Oversize {
                got: body_len,
                limit: max_body,
            });
        }

        let total = FIXED_HEADER_LEN + game_len + user_len + body_len;
        if buf.len() < total {
            return Err(MiddlewareError::Truncated {
                need: total,
                have: buf.len(),
            });
        }

        // CRC covers the whole frame with the checksum field zeroed.
        let mut digest = CRC32.digest();
        digest.update(&buf[..CHECKSUM_OFFSET]);
        digest.update(&[0u8; 4]);
        digest.update(&buf[CHECKSUM_OFFSET + 4..total]);
        let computed = digest.finalize();
        if computed != stored_checksum {
            return Err(MiddlewareError::ChecksumMismatch {
                expected: computed,
                got: stored_checksum,
            });
        }

        let game_end = FIXED_HEADER_LEN + game_len;
        let user_end = game_end + user_len;
        let game_id = std::str::from_utf8(&buf[FIXED_HEADER_LEN..game_end])
            .map_err(|_| MiddlewareError::ProtocolViolation("game id is not utf-8".to_string()))?
            .to_string();
        let user_id = std::str::from_utf8(&buf[game_end..user_end])
            .map_err(|_| MiddlewareError::ProtocolViolation("user id is not utf-8".to_string()))?
            .to_string();

        Ok(Frame {
            message_type,
            flags,
            sequence,
            timestamp,
            game_id,
            user_id,
            body: buf[user_end..total].to_vec(),
        })
    }
}

/// Read one frame from an async byte stream.
///
/// Reads the fixed header first so an oversize body is rejected before any
/// allocation for it, then reads the variable sections and runs the full
/// decode (including the checksum) over the assembled bytes. A connection
/// closed mid-frame surfaces as `Truncated`.
pub async fn read_frame<R>(reader: &mut R, max_body: usize) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FIXED_HEADER_LEN];
    let mut filled = 0;
    while filled < FIXED_HEADER_LEN {
        let n = reader
            .read(&mut header[filled..])
            .await
            .map_err(MiddlewareError::from)?;
        if n == 0 {
            // EOF between frames is a clean close; EOF inside one is not.
            if filled == 0 {
                return Err(MiddlewareError::Cancelled(
                    "connection closed by peer".to_string(),
                ));
            }
            return Err(MiddlewareError::Truncated {
                need: FIXED_HEADER_LEN,
                have: filled,
            });
        }
        filled += n;
    }

    if header[0] != PROTOCOL_VERSION {
        return Err(MiddlewareError::BadMagic(header[0]));
    }
    let body_len = u32::from_be_bytes([header[16], header[17], header[18], header[19]]) as usize;
    if body_len > max_body {
        return Err(MiddlewareError::Oversize {
            got: body_len,
            limit: max_body,
        });
    }
    let game_len = u16::from_be_bytes([header[24], header[25]]) as usize;
    let user_len = u16::from_be_bytes([header[26], header[27]]) as usize;

    let total = FIXED_HEADER_LEN + game_len + user_len + body_len;
    let mut buf = vec![0u8; total];
    buf[..FIXED_HEADER_LEN].copy_from_slice(&header);
    reader
        .read_exact(&mut buf[FIXED_HEADER_LEN..])
        .await
        .map_err(map_read_err)?;

    Frame::decode(&buf, max_body)
}

fn map_read_err(e: std::io::Error) -> MiddlewareError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        MiddlewareError::Truncated { need: 0, have: 0 }
    } else {
        MiddlewareError::from(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FLAG_NEED_RESPONSE, MSG_HEARTBEAT};

    const MAX_BODY: usize = 64 * 1024;

    fn ping_frame() -> Frame {
        Frame {
            message_type: MSG_HEARTBEAT,
            flags: FLAG_NEED_RESPONSE,
            sequence: 42,
            timestamp: 1_700_000_000,
            game_id: "game1".to_string(),
            user_id: "u7".to_string(),
            body: br#"{"type":"ping"}"#.to_vec(),
        }
    }

    #[test]
    fn test_round_trip_and_determinism() {
        let frame = ping_frame();
        let a = frame.encode(MAX_BODY).expect("encode");
        let b = frame.encode(MAX_BODY).expect("encode");
        assert_eq!(a, b, "encoding must be deterministic");
        assert_eq!(a.len(), FIXED_HEADER_LEN + 5 + 2 + 15);

        let decoded = Frame::decode(&a, MAX_BODY).expect("decode");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_layout_offsets() {
        let frame = ping_frame();
        let buf = frame.encode(MAX_BODY).expect("encode");

        assert_eq!(buf[0], 1);
        assert_eq!(u16::from_be_bytes([buf[1], buf[2]]), MSG_HEARTBEAT);
        assert_eq!(buf[3], FLAG_NEED_RESPONSE);
        assert_eq!(u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]), 42);
        assert_eq!(
            i64::from_be_bytes([buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15]]),
            1_700_000_000
        );
        assert_eq!(u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]), 15);
        assert_eq!(u16::from_be_bytes([buf[24], buf[25]]), 5);
        assert_eq!(u16::from_be_bytes([buf[26], buf[27]]), 2);
        assert_eq!(&buf[28..33], b"game1");
        assert_eq!(&buf[33..35], b"u7");
    }

    #[test]
    fn test_any_flipped_body_byte_fails_checksum() {
        let frame = ping_frame();
        let encoded = frame.encode(MAX_BODY).expect("encode");
        let body_start = FIXED_HEADER_LEN + 5 + 2;

        for i in body_start..encoded.len() {
            let mut corrupted = encoded.clone();
            corrupted[i] ^= 0x01;
            match Frame::decode(&corrupted, MAX_BODY) {
                Err(MiddlewareError::ChecksumMismatch { .. }) => {}
                other => panic!("byte {i}: expected checksum mismatch, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_empty_body_round_trips() {
        let frame = Frame {
            body: Vec::new(),
            ..ping_frame()
        };
        let encoded = frame.encode(MAX_BODY).expect("encode");
        let decoded = Frame::decode(&encoded, MAX_BODY).expect("decode");
        assert!(decoded.body.is_empty());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_truncation_at_every_length() {
        let encoded = ping_frame().encode(MAX_BODY).expect("encode");
        for cut in 0..encoded.len() {
            match Frame::decode(&encoded[..cut], MAX_BODY) {
                Err(MiddlewareError::Truncated { .. }) => {}
                other => panic!("cut {cut}: expected truncated, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_oversize_body_rejected_on_both_sides() {
        let frame = Frame {
            body: vec![0u8; 128],
            ..ping_frame()
        };
        assert!(matches!(
            frame.encode(64),
            Err(MiddlewareError::Oversize { got: 128, limit: 64 })
        ));

        let encoded = frame.encode(MAX_BODY).expect("encode");
        assert!(matches!(
            Frame::decode(&encoded, 64),
            Err(MiddlewareError::Oversize { .. })
        ));
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut encoded = ping_frame().encode(MAX_BODY).expect("encode");
        encoded[0] = 9;
        assert!(matches!(
            Frame::decode(&encoded, MAX_BODY),
            Err(MiddlewareError::BadMagic(9))
        ));
    }

    #[test]
    fn test_heartbeat_checksum_treated_like_data_frames() {
        let hb = Frame::heartbeat(7, 1_700_000_123);
        let mut encoded = hb.encode(MAX_BODY).expect("encode");
        assert_eq!(Frame::decode(&encoded, MAX_BODY).expect("decode"), hb);

        encoded[4] ^= 0xFF; // corrupt the sequence field
        assert!(matches!(
            Frame::decode(&encoded, MAX_BODY),
            Err(MiddlewareError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_error_reply_carries_envelope() {
        let req = ping_frame();
        let err = MiddlewareError::RouteNotFound("no handler".to_string());
        let reply = Frame::error_reply(&req, 1_700_000_001, &err);

        assert_eq!(reply.sequence, req.sequence);
        assert_ne!(reply.flags & FLAG_ERROR, 0);
        let envelope: serde_json::Value = serde_json::from_slice(&reply.body).expect("json body");
        assert_eq!(envelope["code"], err.code());
    }

    #[tokio::test]
    async fn test_read_frame_from_stream() {
        let frame = ping_frame();
        let encoded = frame.encode(MAX_BODY).expect("encode");

        let mut reader = std::io::Cursor::new(encoded.clone());
        let decoded = read_frame(&mut reader, MAX_BODY).await.expect("read");
        assert_eq!(decoded, frame);

        // A stream cut mid-frame surfaces as truncation.
        let mut short = std::io::Cursor::new(encoded[..encoded.len() - 3].to_vec());
        assert!(matches!(
            read_frame(&mut short, MAX_BODY).await,
            Err(MiddlewareError::Truncated { .. })
        ));

        // EOF on a frame boundary is a clean close, not a violation.
        let mut empty = std::io::Cursor::new(Vec::new());
        assert!(matches!(
            read_frame(&mut empty, MAX_BODY).await,
            Err(MiddlewareError::Cancelled(_))
        ));
    }
}
