//! Connection control methods and their field encodings.
//!
//! A method frame's payload is a 4-byte Big Endian method id
//! (`class << 16 | method`) followed by the method's argument fields,
//! encoded as a MessagePack map (`to_vec_named`, so fields travel by name).
//!
//! The engine only interprets methods of the connection class (channel 0).
//! Methods on any other channel pass through with their fields untouched.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Connection class number.
pub const CONNECTION_CLASS: u16 = 10;

const fn method_id(class: u16, index: u16) -> u32 {
    (class as u32) << 16 | index as u32
}

/// Method ids of the connection class.
pub mod connection {
    use super::{method_id, CONNECTION_CLASS};

    pub const START: u32 = method_id(CONNECTION_CLASS, 10);
    pub const START_OK: u32 = method_id(CONNECTION_CLASS, 11);
    pub const SECURE: u32 = method_id(CONNECTION_CLASS, 20);
    pub const SECURE_OK: u32 = method_id(CONNECTION_CLASS, 21);
    pub const TUNE: u32 = method_id(CONNECTION_CLASS, 30);
    pub const TUNE_OK: u32 = method_id(CONNECTION_CLASS, 31);
    pub const OPEN: u32 = method_id(CONNECTION_CLASS, 40);
    pub const OPEN_OK: u32 = method_id(CONNECTION_CLASS, 41);
    pub const CLOSE: u32 = method_id(CONNECTION_CLASS, 50);
    pub const CLOSE_OK: u32 = method_id(CONNECTION_CLASS, 51);
    pub const BLOCKED: u32 = method_id(CONNECTION_CLASS, 60);
    pub const UNBLOCKED: u32 = method_id(CONNECTION_CLASS, 61);
}

/// Human-readable name for a connection-class method id, for error messages.
pub fn method_name(id: u32) -> &'static str {
    match id {
        connection::START => "connection.start",
        connection::START_OK => "connection.start-ok",
        connection::SECURE => "connection.secure",
        connection::SECURE_OK => "connection.secure-ok",
        connection::TUNE => "connection.tune",
        connection::TUNE_OK => "connection.tune-ok",
        connection::OPEN => "connection.open",
        connection::OPEN_OK => "connection.open-ok",
        connection::CLOSE => "connection.close",
        connection::CLOSE_OK => "connection.close-ok",
        connection::BLOCKED => "connection.blocked",
        connection::UNBLOCKED => "connection.unblocked",
        _ => "unknown method",
    }
}

/// A method with undecoded argument fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    /// Method id (`class << 16 | method`).
    pub id: u32,
    /// Argument fields, MessagePack-encoded.
    pub args: Bytes,
}

impl Method {
    /// Build a method from typed fields.
    pub fn build<T: Serialize>(id: u32, fields: &T) -> Result<Self> {
        let args = rmp_serde::to_vec_named(fields)?;
        Ok(Self {
            id,
            args: Bytes::from(args),
        })
    }

    /// Decode this method's fields into a typed struct.
    pub fn fields<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(rmp_serde::from_slice(&self.args)?)
    }

    /// Encode id + fields into a method frame payload.
    pub fn encode_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.args.len());
        buf.put_u32(self.id);
        buf.put_slice(&self.args);
        buf.freeze()
    }

    /// Decode a method frame payload into id + fields.
    pub fn decode_payload(payload: &Bytes) -> Result<Self> {
        if payload.len() < 4 {
            return Err(EngineError::Protocol(
                "method frame payload shorter than method id".into(),
            ));
        }
        let id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        Ok(Self {
            id,
            args: payload.slice(4..),
        })
    }
}

/// Properties + body size announced ahead of content-body frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentHeader {
    /// Property class id.
    pub props_id: u16,
    /// Total body length across all following body frames.
    pub body_size: u64,
    /// Property fields, MessagePack-encoded.
    pub props: Bytes,
}

impl ContentHeader {
    /// Build a content header from typed properties.
    pub fn build<T: Serialize>(props_id: u16, body_size: u64, props: &T) -> Result<Self> {
        let props = rmp_serde::to_vec_named(props)?;
        Ok(Self {
            props_id,
            body_size,
            props: Bytes::from(props),
        })
    }

    /// Encode into a header frame payload.
    pub fn encode_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(10 + self.props.len());
        buf.put_u16(self.props_id);
        buf.put_u64(self.body_size);
        buf.put_slice(&self.props);
        buf.freeze()
    }

    /// Decode a header frame payload.
    pub fn decode_payload(payload: &Bytes) -> Result<Self> {
        if payload.len() < 10 {
            return Err(EngineError::Protocol(
                "content-header payload shorter than fixed fields".into(),
            ));
        }
        let props_id = u16::from_be_bytes([payload[0], payload[1]]);
        let body_size = u64::from_be_bytes([
            payload[2], payload[3], payload[4], payload[5], payload[6], payload[7], payload[8],
            payload[9],
        ]);
        Ok(Self {
            props_id,
            body_size,
            props: payload.slice(10..),
        })
    }
}

// Argument field structs for the connection class. Server-originated and
// client-originated methods both live here so tests can play the server side.

/// `connection.start`: server greets, advertises mechanisms and locales.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartFields {
    /// Space-separated SASL mechanism names.
    pub mechanisms: String,
    /// Space-separated locale names.
    pub locales: String,
    /// Server property table.
    #[serde(default)]
    pub server_properties: HashMap<String, String>,
}

/// `connection.start-ok`: client picks a mechanism and responds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartOkFields {
    /// Client property table.
    pub client_properties: HashMap<String, String>,
    /// Chosen SASL mechanism.
    pub mechanism: String,
    /// SASL response bytes.
    pub response: Vec<u8>,
    /// Chosen locale.
    pub locale: String,
}

/// `connection.secure`: SASL challenge. Not supported; its arrival during
/// the handshake is an error (PLAIN never challenges).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecureFields {
    pub challenge: Vec<u8>,
}

/// `connection.tune` / `connection.tune-ok`: limit negotiation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TuneFields {
    /// Max concurrent channels; 0 means no limit.
    pub channel_max: u16,
    /// Max frame size in bytes; 0 means no limit.
    pub frame_max: u32,
    /// Heartbeat interval in seconds; 0 disables heartbeating.
    pub heartbeat: u16,
}

/// `connection.open`: pick a virtual host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenFields {
    pub virtual_host: String,
}

/// `connection.open-ok`: handshake complete.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenOkFields {}

/// `connection.close`: either side initiates the closing handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseFields {
    /// Reply code (see [`reply_code`](crate::codec::reply_code)).
    pub reply_code: u16,
    /// Human-readable reason.
    pub reply_text: String,
    /// Class of the method that caused the close, or 0.
    pub class_id: u16,
    /// Method that caused the close, or 0.
    pub method_id: u16,
}

/// `connection.close-ok`: closing handshake confirmed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloseOkFields {}

/// `connection.blocked`: server stopped accepting new work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedFields {
    pub reason: String,
}

/// `connection.unblocked`: server resumed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnblockedFields {}
