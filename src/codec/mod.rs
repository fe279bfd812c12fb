//! Frame codec: wire format, control methods, and reassembly.
//!
//! Three layers:
//!
//! - [`wire`]: raw frame envelope (type, channel, size, end octet) and
//!   protocol constants
//! - [`method`]: connection-class methods and their MessagePack field
//!   encodings; content headers
//! - [`FrameBuffer`]: resumable reassembly of frames from fragmented reads

pub mod method;
pub mod wire;

mod frame_buffer;

pub use frame_buffer::FrameBuffer;
pub use method::{ContentHeader, Method};
pub use wire::{reply_code, RawFrame, CONTROL_CHANNEL, FRAME_OVERHEAD, PROTOCOL_HEADER};

use bytes::Bytes;

use crate::error::{EngineError, Result};

/// A decoded logical frame: the unit handed to the dispatch loop.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Channel the frame belongs to (0 = connection control).
    pub channel: u16,
    /// The frame's decoded content.
    pub body: FrameBody,
}

/// Frame content by type.
#[derive(Debug, Clone)]
pub enum FrameBody {
    /// A method with undecoded argument fields.
    Method(Method),
    /// Properties and body size announcing content-body frames.
    Header(ContentHeader),
    /// One content-body fragment.
    Body(Bytes),
    /// Liveness signal; counted as activity and otherwise ignored.
    Heartbeat,
}

/// Decode a raw frame into a logical one.
pub fn decode_frame(raw: RawFrame) -> Result<Frame> {
    let body = match raw.frame_type {
        wire::frame_type::METHOD => FrameBody::Method(Method::decode_payload(&raw.payload)?),
        wire::frame_type::HEADER => FrameBody::Header(ContentHeader::decode_payload(&raw.payload)?),
        wire::frame_type::BODY => FrameBody::Body(raw.payload),
        wire::frame_type::HEARTBEAT => FrameBody::Heartbeat,
        other => {
            return Err(EngineError::Protocol(format!(
                "unknown frame type {:#04x}",
                other
            )))
        }
    };
    Ok(Frame {
        channel: raw.channel,
        body,
    })
}

/// Encode a method frame for the wire.
pub fn encode_method_frame(channel: u16, method: &Method) -> Bytes {
    wire::encode_frame(wire::frame_type::METHOD, channel, &method.encode_payload())
}

/// Encode a content-header frame for the wire.
pub fn encode_header_frame(channel: u16, header: &ContentHeader) -> Bytes {
    wire::encode_frame(wire::frame_type::HEADER, channel, &header.encode_payload())
}
