//! The opening handshake.
//!
//! ```text
//! client -> server
//!
//! protocol header ->
//!              <- start
//! start-ok     ->
//!              <- tune        (secure is an error: PLAIN never challenges)
//! tune-ok      ->
//! open         ->
//!              <- open-ok
//! ```
//!
//! Strict ordering, no retries: a single attempt either fully succeeds or
//! fails with an error naming what went wrong. The driver is a plain
//! `async fn`; "waiting for the next frame" is just awaiting [`Stepper::step`].

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::method::{
    connection, method_name, CloseFields, Method, OpenFields, OpenOkFields, StartFields,
    StartOkFields, TuneFields,
};
use crate::codec::{encode_method_frame, Frame, FrameBody, FrameBuffer, PROTOCOL_HEADER};
use crate::credentials::Credentials;
use crate::error::{EngineError, Result};
use crate::writer::DEFAULT_WRITE_HWM;

/// Frames of a message below this total size are coalesced into one write.
pub const DEFAULT_CHUNK_THRESHOLD: usize = 2048;

/// Desired connection parameters plus engine tunables.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// SASL credentials; the mechanism must be one the server advertises.
    pub credentials: Credentials,
    /// Message locale.
    pub locale: String,
    /// Desired max concurrent channels; 0 = no preference.
    pub channel_max: u16,
    /// Desired max frame size in bytes; 0 = no preference.
    pub frame_max: u32,
    /// Desired heartbeat interval in seconds; 0 = disabled.
    pub heartbeat: u16,
    /// Virtual host to open.
    pub virtual_host: String,
    /// Extra client properties merged over the defaults.
    pub client_properties: HashMap<String, String>,
    /// Per-channel write queue high-water mark, in chunks.
    pub write_hwm: usize,
    /// Coalescing threshold for small messages, in bytes.
    pub chunk_threshold: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            credentials: Credentials::default(),
            locale: "en_US".to_string(),
            channel_max: 0,
            frame_max: 0x1000,
            heartbeat: 0,
            virtual_host: "/".to_string(),
            client_properties: HashMap::new(),
            write_hwm: DEFAULT_WRITE_HWM,
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
        }
    }
}

impl OpenOptions {
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn virtual_host(mut self, vhost: impl Into<String>) -> Self {
        self.virtual_host = vhost.into();
        self
    }

    pub fn channel_max(mut self, channel_max: u16) -> Self {
        self.channel_max = channel_max;
        self
    }

    pub fn frame_max(mut self, frame_max: u32) -> Self {
        self.frame_max = frame_max;
        self
    }

    pub fn heartbeat(mut self, seconds: u16) -> Self {
        self.heartbeat = seconds;
        self
    }

    /// Client property table: defaults overlaid with user-supplied extras.
    fn properties(&self) -> HashMap<String, String> {
        let mut props = HashMap::from([
            ("product".to_string(), "muxwire".to_string()),
            (
                "version".to_string(),
                env!("CARGO_PKG_VERSION").to_string(),
            ),
            ("platform".to_string(), "rust".to_string()),
        ]);
        props.extend(self.client_properties.clone());
        props
    }
}

/// Limits in force once the handshake completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    /// Effective channel limit (0 negotiated → encoding maximum).
    pub channel_max: u16,
    /// Effective frame size limit (0 negotiated → encoding maximum).
    pub frame_max: u32,
    /// Heartbeat interval in seconds; 0 = disabled.
    pub heartbeat: u16,
}

/// Tune rule: whichever side places a limit wins; if both do, the lower.
///
/// `0` means "no limit" on either side, so `max` picks the limiting value
/// when one side offered 0, and `min` applies otherwise.
pub fn negotiate<T: Ord + Copy + Default>(server: T, desired: T) -> T {
    if server == T::default() || desired == T::default() {
        server.max(desired)
    } else {
        server.min(desired)
    }
}

/// Frame-at-a-time reader used only while the handshake runs.
///
/// The buffer it fills is handed to the dispatch loop afterwards, so bytes
/// the server sent past `open-ok` are not lost.
pub struct Stepper<'a, R> {
    reader: &'a mut R,
    buffer: &'a mut FrameBuffer,
}

impl<'a, R: AsyncRead + Unpin> Stepper<'a, R> {
    pub fn new(reader: &'a mut R, buffer: &'a mut FrameBuffer) -> Self {
        Self { reader, buffer }
    }

    /// Read until one complete frame is available.
    pub async fn step(&mut self) -> Result<Frame> {
        let mut chunk = [0u8; 8 * 1024];
        loop {
            if let Some(frame) = self.buffer.try_next()? {
                return Ok(frame);
            }
            let n = self.reader.read(&mut chunk).await.map_err(|e| {
                EngineError::Handshake(format!("transport error during opening handshake: {}", e))
            })?;
            if n == 0 {
                return Err(EngineError::Handshake(
                    "transport closed abruptly during opening handshake".into(),
                ));
            }
            self.buffer.extend(&chunk[..n]);
        }
    }

    /// Next control method: channel 0, method frame, anything else fails.
    async fn control_method(&mut self) -> Result<Method> {
        let frame = self.step().await?;
        if frame.channel != 0 {
            return Err(EngineError::Handshake(format!(
                "frame on channel {} during handshake",
                frame.channel
            )));
        }
        match frame.body {
            FrameBody::Method(method) => Ok(method),
            other => Err(EngineError::Handshake(format!(
                "non-method frame during handshake: {:?}",
                other
            ))),
        }
    }

    /// Next control method, which must be `expected`.
    async fn expect(&mut self, expected: u32) -> Result<Method> {
        let method = self.control_method().await?;
        if method.id != expected {
            return Err(EngineError::Handshake(format!(
                "expected {}; got {}",
                method_name(expected),
                method_name(method.id)
            )));
        }
        Ok(method)
    }
}

async fn send_method<W: AsyncWrite + Unpin>(writer: &mut W, method: &Method) -> Result<()> {
    let bytes = encode_method_frame(0, method);
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Drive the opening handshake to completion.
///
/// On success the negotiated limits are returned and `buffer` may already
/// hold frames that arrived after `open-ok`. On failure the connection is
/// unusable; the caller must not attempt further sends.
pub async fn run<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer: &mut FrameBuffer,
    options: &OpenOptions,
) -> Result<(Negotiated, OpenOkFields)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut stepper = Stepper::new(reader, buffer);

    // Prompt the server.
    writer.write_all(&PROTOCOL_HEADER).await?;
    writer.flush().await?;

    let start = stepper.expect(connection::START).await?;
    let start_fields: StartFields = start.fields()?;

    let mechanism = options.credentials.mechanism();
    if !start_fields
        .mechanisms
        .split_whitespace()
        .any(|m| m == mechanism)
    {
        return Err(EngineError::Handshake(format!(
            "SASL mechanism {} is not provided by the server (offered: {})",
            mechanism, start_fields.mechanisms
        )));
    }

    let start_ok = Method::build(
        connection::START_OK,
        &StartOkFields {
            client_properties: options.properties(),
            mechanism: mechanism.to_string(),
            response: options.credentials.response().to_vec(),
            locale: options.locale.clone(),
        },
    )?;
    send_method(writer, &start_ok).await?;

    // Next is tune in the happy path; secure and close are both failures.
    let reply = stepper.control_method().await?;
    let tune_fields: TuneFields = match reply.id {
        connection::SECURE => {
            return Err(EngineError::Handshake(
                "server requested secure negotiation, which is not supported".into(),
            ));
        }
        connection::CLOSE => {
            let close: CloseFields = reply.fields()?;
            return Err(EngineError::Handshake(format!(
                "handshake terminated by server: {} (code {})",
                close.reply_text, close.reply_code
            )));
        }
        connection::TUNE => reply.fields()?,
        other => {
            return Err(EngineError::Handshake(format!(
                "expected connection.secure, connection.close, or connection.tune; got {}",
                method_name(other)
            )));
        }
    };

    let tuned = TuneFields {
        channel_max: negotiate(tune_fields.channel_max, options.channel_max),
        frame_max: negotiate(tune_fields.frame_max, options.frame_max),
        heartbeat: negotiate(tune_fields.heartbeat, options.heartbeat),
    };
    tracing::debug!(
        channel_max = tuned.channel_max,
        frame_max = tuned.frame_max,
        heartbeat = tuned.heartbeat,
        "tuned connection limits"
    );

    send_method(writer, &Method::build(connection::TUNE_OK, &tuned)?).await?;
    send_method(
        writer,
        &Method::build(
            connection::OPEN,
            &OpenFields {
                virtual_host: options.virtual_host.clone(),
            },
        )?,
    )
    .await?;

    let open_ok = stepper.expect(connection::OPEN_OK).await?;
    let open_ok_fields: OpenOkFields = open_ok.fields()?;

    // 0 after negotiation means "no limit": impose the encoding maximum.
    let negotiated = Negotiated {
        channel_max: if tuned.channel_max == 0 {
            u16::MAX
        } else {
            tuned.channel_max
        },
        frame_max: if tuned.frame_max == 0 {
            u32::MAX
        } else {
            tuned.frame_max
        },
        heartbeat: tuned.heartbeat,
    };
    buffer.set_frame_max(negotiated.frame_max);

    Ok((negotiated, open_ok_fields))
}
