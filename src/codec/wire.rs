//! Wire format encoding and decoding.
//!
//! Every frame on the wire has the same shape:
//!
//! ```text
//! ┌──────┬─────────┬─────────┬─────────┬─────┐
//! │ Type │ Channel │ Size    │ Payload │ End │
//! │ 1 B  │ 2 B BE  │ 4 B BE  │ Size B  │ 1 B │
//! └──────┴─────────┴─────────┴─────────┴─────┘
//! ```
//!
//! `Size` counts payload bytes only. The end octet is always [`FRAME_END`].
//! All multi-byte integers are Big Endian.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{EngineError, Result};

/// Bytes the client sends before anything else to announce the protocol.
pub const PROTOCOL_HEADER: [u8; 8] = *b"MUXW\x00\x00\x01\x00";

/// Fixed per-frame overhead: type + channel + size + end octet.
pub const FRAME_OVERHEAD: usize = 8;

/// Sentinel octet terminating every frame.
pub const FRAME_END: u8 = 0xCE;

/// Smallest frame size either side may assume before tuning.
pub const FRAME_MIN_SIZE: u32 = 4096;

/// Channel id reserved for connection control methods.
pub const CONTROL_CHANNEL: u16 = 0;

/// Frame type octets.
pub mod frame_type {
    /// Method frame (method id + argument fields).
    pub const METHOD: u8 = 1;
    /// Content-header frame (properties + body size).
    pub const HEADER: u8 = 2;
    /// Content-body fragment.
    pub const BODY: u8 = 3;
    /// Heartbeat (channel 0, empty payload).
    pub const HEARTBEAT: u8 = 8;
}

/// Reply codes carried in close frames.
pub mod reply_code {
    /// Clean shutdown, not an error.
    pub const REPLY_SUCCESS: u16 = 200;
    /// Server forced the connection closed; treated as non-fatal.
    pub const CONNECTION_FORCED: u16 = 320;
    /// Malformed or oversized frame.
    pub const FRAME_ERROR: u16 = 501;
    /// Frame addressed to a channel that is not open.
    pub const CHANNEL_ERROR: u16 = 504;
    /// Frame that makes no sense in the current state.
    pub const UNEXPECTED_FRAME: u16 = 505;
}

/// A raw frame pulled off the wire: type, channel, undecoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Frame type octet (see [`frame_type`]).
    pub frame_type: u8,
    /// Channel the frame belongs to (0 = connection control).
    pub channel: u16,
    /// Payload bytes, zero-copy.
    pub payload: Bytes,
}

/// Encode a raw frame into a contiguous buffer.
pub fn encode_frame(frame_type: u8, channel: u16, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + payload.len());
    buf.put_u8(frame_type);
    buf.put_u16(channel);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.put_u8(FRAME_END);
    buf.freeze()
}

/// Encode a heartbeat frame (channel 0, empty payload).
pub fn heartbeat_frame() -> Bytes {
    encode_frame(frame_type::HEARTBEAT, CONTROL_CHANNEL, &[])
}

/// Encode a content-body fragment for the given channel.
pub fn body_frame(channel: u16, body: &[u8]) -> Bytes {
    encode_frame(frame_type::BODY, channel, body)
}

/// Try to parse one complete frame from the front of `buf`.
///
/// On success the frame's bytes are consumed from `buf` and the frame is
/// returned. Returns `Ok(None)` when the buffer holds only a prefix of a
/// frame; the caller keeps the buffer and retries after the next read.
///
/// # Errors
///
/// A payload larger than `frame_max` or a missing end octet is a protocol
/// error: the stream is corrupt and cannot be resynchronized.
pub fn parse_frame(buf: &mut BytesMut, frame_max: u32) -> Result<Option<RawFrame>> {
    // Need at least type + channel + size to know the frame length.
    if buf.len() < FRAME_OVERHEAD - 1 {
        return Ok(None);
    }

    let frame_type = buf[0];
    let channel = u16::from_be_bytes([buf[1], buf[2]]);
    let size = u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]);

    if size > frame_max.saturating_sub(FRAME_OVERHEAD as u32) {
        return Err(EngineError::Protocol(format!(
            "frame payload of {} bytes exceeds negotiated frame max {}",
            size, frame_max
        )));
    }

    let total = FRAME_OVERHEAD + size as usize;
    if buf.len() < total {
        return Ok(None);
    }

    let end = buf[total - 1];
    if end != FRAME_END {
        return Err(EngineError::Protocol(format!(
            "bad frame end octet {:#04x} (expected {:#04x})",
            end, FRAME_END
        )));
    }

    let mut frame = buf.split_to(total);
    let _ = frame.split_to(7); // type + channel + size
    frame.truncate(size as usize);

    Ok(Some(RawFrame {
        frame_type,
        channel,
        payload: frame.freeze(),
    }))
}
