//! Binary wire protocol for the TCP surface.
//!
//! A frame is a fixed 28-byte header followed by three variable sections
//! (game id, user id, body). All multi-byte integers are big-endian. The
//! checksum is CRC32-IEEE computed over the entire frame with the checksum
//! field zeroed, so encoding is deterministic and any single-bit corruption is
//! detected on decode.

mod frame;

pub use frame::{read_frame, Frame, FIXED_HEADER_LEN};

/// Wire protocol version this build speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// Flags bit 0: the peer expects a response frame.
pub const FLAG_NEED_RESPONSE: u8 = 0b0000_0001;
/// Flags bit 1: the body is an error envelope `{code, message}`.
pub const FLAG_ERROR: u8 = 0b0000_0010;

/// Heartbeat probe/acknowledgement.
pub const MSG_HEARTBEAT: u16 = 4097;
/// Connection handshake.
pub const MSG_HANDSHAKE: u16 = 4098;
/// Player login (public).
pub const MSG_LOGIN: u16 = 4353;
/// Player data read/write.
pub const MSG_PLAYER_DATA: u16 = 4354;
