//! Error types for the muxwire connection engine.

use thiserror::Error;

/// Main error type for all engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Field encode error (method arguments, property tables).
    #[error("field encode error: {0}")]
    FieldEncode(#[from] rmp_serde::encode::Error),

    /// Field decode error (method arguments, property tables).
    #[error("field decode error: {0}")]
    FieldDecode(#[from] rmp_serde::decode::Error),

    /// Handshake failed before open-ok was received.
    ///
    /// Handshake errors surface only through [`Connection::open`]; no
    /// connection-level event is emitted before steady state.
    ///
    /// [`Connection::open`]: crate::Connection::open
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Protocol violation (malformed frame, unexpected frame, unknown channel).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Channel id space exhausted.
    #[error("no channels left to allocate")]
    ChannelsExhausted,

    /// Operation attempted after the connection started closing or closed.
    ///
    /// Carries the diagnostic context captured when the close was initiated.
    #[error("illegal operation: {context}")]
    IllegalOperation {
        /// Why sends were invalidated (captured at close time).
        context: String,
    },

    /// The transport closed under us without a closing handshake.
    #[error("connection closed unexpectedly")]
    ConnectionClosed,

    /// No activity in either direction for two heartbeat intervals.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,
}

/// Result type alias using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;
