//! The connection: handshake, frame dispatch, channels, closing.
//!
//! One [`Connection`] owns one transport. [`Connection::open`] drives the
//! opening handshake and, on success, spawns the writer task, the heartbeat
//! monitor, and the dispatch loop. The dispatch loop is the only driver of
//! state transitions: it pulls bytes off the transport, reassembles frames,
//! and routes channel-0 frames to connection control and everything else to
//! the owning channel's delivery sender.
//!
//! # Closing
//!
//! The closing handshake is shared by both directions of initiative:
//!
//! ```text
//! RUNNING --- send close ---> CLOSING --- recv close-ok ---> CLOSED
//!    |                           |
//!    |                           +-- recv close: reply close-ok, keep waiting
//!    |
//!    +------ recv close: reply close-ok ---------------------> CLOSED
//! ```
//!
//! Entering CLOSING or CLOSED invalidates every send operation: callers get
//! an [`EngineError::IllegalOperation`] carrying the context captured when
//! the close began, rather than a hang or a silent no-op. A transport that
//! dies under us, and a heartbeat timeout, both take the unsolicited-close
//! path. Fatal close codes surface an [`ConnectionEvent::Error`] before the
//! [`ConnectionEvent::Close`] notification; `REPLY_SUCCESS` and
//! `CONNECTION_FORCED` are non-fatal and skip the error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};

use crate::channels::{ChannelSlots, Delivery, DeliverySender, Slot};
use crate::codec::method::{connection as method_id, method_name, CloseFields, CloseOkFields};
use crate::codec::method::{BlockedFields, Method};
use crate::codec::wire::{body_frame, heartbeat_frame, reply_code};
use crate::codec::{
    encode_header_frame, encode_method_frame, ContentHeader, Frame, FrameBody, FrameBuffer,
    FRAME_OVERHEAD,
};
use crate::error::{EngineError, Result};
use crate::handshake::{self, Negotiated, OpenOptions};
use crate::heartbeat::{self, HeartbeatHandle, Pulse};
use crate::transport::Transport;
use crate::writer::{spawn_writer, ChannelQueue, WriterHandle};

/// Connection-level notifications, in emission order.
///
/// When a close has a fatal cause, `Error` is always delivered before
/// `Close`, so observers can distinguish "why" from "it's over".
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Something fatal happened (protocol violation, transport failure,
    /// heartbeat timeout, fatal peer close).
    Error(String),
    /// The connection reached CLOSED. Carries the terminating cause, or
    /// `None` for a clean client-initiated close.
    Close { error: Option<String> },
    /// The server stopped accepting new work.
    Blocked(String),
    /// The server resumed.
    Unblocked,
}

/// Whether a peer close code should surface as an error.
///
/// `REPLY_SUCCESS` is a clean close and `CONNECTION_FORCED` is an
/// operator-driven one; neither is the application's fault.
pub fn is_fatal_code(code: u16) -> bool {
    !matches!(
        code,
        reply_code::REPLY_SUCCESS | reply_code::CONNECTION_FORCED
    )
}

/// Connection lifecycle state. Exactly one is active at a time and it fully
/// determines how incoming frames are interpreted.
enum Mode {
    /// Steady state: all frames accepted, sends allowed.
    Running,
    /// We sent close and await close-ok. Sends are invalidated; inbound
    /// frames other than close/close-ok are ignored.
    Closing {
        context: String,
        waiters: Vec<oneshot::Sender<()>>,
    },
    /// Terminal. Every public operation fails fast with `context`.
    Closed { context: String },
}

struct State {
    mode: Mode,
    slots: ChannelSlots,
    /// Channel 0's outbound queue; control methods always flow through it.
    control: ChannelQueue,
    heartbeat: Option<HeartbeatHandle>,
}

struct Inner {
    state: Mutex<State>,
    writer: WriterHandle,
    negotiated: Negotiated,
    chunk_threshold: usize,
    write_hwm: usize,
    sent_since_check: Arc<AtomicBool>,
    recv_since_check: Arc<AtomicBool>,
    /// Guards double-handling of transport termination: set once we end the
    /// transport ourselves, so the resulting read EOF is not an error.
    expect_transport_close: AtomicBool,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

/// A connection to a remote peer, past its opening handshake.
///
/// Cheap to clone; all clones share the same underlying connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    /// Open a connection over `transport`.
    ///
    /// Runs the handshake to completion before returning. A single attempt
    /// either fully succeeds, with the dispatch loop and (if negotiated)
    /// heartbeat monitor running, or fails with an [`EngineError::Handshake`]
    /// and the transport unusable. Handshake failures never emit events.
    pub async fn open<T: Transport>(
        transport: T,
        options: OpenOptions,
    ) -> Result<(Connection, mpsc::UnboundedReceiver<ConnectionEvent>)> {
        let (mut reader, mut writer_half) = tokio::io::split(transport);
        let mut buffer = FrameBuffer::new();

        let (negotiated, _open_ok) =
            handshake::run(&mut reader, &mut writer_half, &mut buffer, &options).await?;

        let (writer, writer_task) = spawn_writer(writer_half);
        let control = writer.queue(options.write_hwm);

        let sent = Arc::new(AtomicBool::new(false));
        let recv = Arc::new(AtomicBool::new(false));

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                mode: Mode::Running,
                slots: ChannelSlots::new(negotiated.channel_max),
                control,
                heartbeat: None,
            }),
            writer,
            negotiated,
            chunk_threshold: options.chunk_threshold,
            write_hwm: options.write_hwm,
            sent_since_check: sent.clone(),
            recv_since_check: recv.clone(),
            expect_transport_close: AtomicBool::new(false),
            events: events_tx,
        });

        // The monitor is not created at all when heartbeating is disabled.
        let pulses = if negotiated.heartbeat > 0 {
            let send_probe = {
                let sent = sent.clone();
                Box::new(move || sent.swap(false, Ordering::AcqRel)) as heartbeat::ActivityProbe
            };
            let recv_probe = {
                let recv = recv.clone();
                Box::new(move || recv.swap(false, Ordering::AcqRel)) as heartbeat::ActivityProbe
            };
            let (handle, pulses) = heartbeat::spawn(negotiated.heartbeat, send_probe, recv_probe);
            inner.state_guard().heartbeat = Some(handle);
            Some(pulses)
        } else {
            None
        };

        tokio::spawn(dispatch_loop(reader, buffer, inner.clone(), pulses));

        // A write-side failure ends the writer task; tear the connection
        // down instead of waiting for the read side to notice.
        let supervisor = inner.clone();
        tokio::spawn(async move {
            if let Ok(Err(e)) = writer_task.await {
                supervisor.on_writer_failed(e);
            }
        });

        Ok((Connection { inner }, events_rx))
    }

    /// Effective channel limit negotiated at open.
    pub fn channel_max(&self) -> u16 {
        self.inner.negotiated.channel_max
    }

    /// Effective frame size limit negotiated at open.
    pub fn frame_max(&self) -> u32 {
        self.inner.negotiated.frame_max
    }

    /// Negotiated heartbeat interval in seconds (0 = disabled).
    pub fn heartbeat(&self) -> u16 {
        self.inner.negotiated.heartbeat
    }

    /// Allocate the lowest free channel id and register its handler.
    ///
    /// Inbound frames for the id are forwarded to `deliveries` in wire
    /// order, ending with [`Delivery::Closed`] when the channel or the
    /// connection is torn down.
    pub fn allocate_channel(&self, deliveries: DeliverySender) -> Result<u16> {
        let mut st = self.inner.state_guard();
        self.inner.check_open(&st)?;
        let queue = self.inner.writer.queue(self.inner.write_hwm);
        st.slots.allocate(Slot { deliveries, queue })
    }

    /// Release a channel id.
    ///
    /// Unpipes the channel's outbound queue from the shared write path,
    /// then clears the slot. Ownership of "is this still allocated" lives
    /// with the caller; releasing an unallocated id is an error.
    pub fn release_channel(&self, id: u16) -> Result<()> {
        let mut st = self.inner.state_guard();
        self.inner.check_open(&st)?;
        match st.slots.release(id) {
            Some(slot) => {
                drop(slot); // queue unpiped here, before the slot is gone
                Ok(())
            }
            None => Err(EngineError::Protocol(format!(
                "release of unallocated channel {}",
                id
            ))),
        }
    }

    /// Send a method frame on a channel.
    ///
    /// Returns `Ok(true)` while the channel's queue is below its high-water
    /// mark; on `Ok(false)` the caller should pause and await [`drained`].
    ///
    /// [`drained`]: Connection::drained
    pub fn send_method(&self, channel: u16, method: &Method) -> Result<bool> {
        let st = self.inner.state_guard();
        self.inner.check_open(&st)?;
        let queue = self.inner.queue_for(&st, channel)?;
        self.inner.mark_sent();
        queue.write(encode_method_frame(channel, method))
    }

    /// Send a method, a content header, and a body on a channel.
    ///
    /// When everything fits under the coalescing threshold the three frames
    /// are written as one queue item, so another channel's frames cannot
    /// interleave mid-message. Larger bodies are fragmented at the
    /// negotiated frame size and may interleave with other channels between
    /// fragments.
    pub fn send_message(
        &self,
        channel: u16,
        method: &Method,
        props_id: u16,
        props: Bytes,
        body: Bytes,
    ) -> Result<bool> {
        let header = ContentHeader {
            props_id,
            body_size: body.len() as u64,
            props,
        };

        let st = self.inner.state_guard();
        self.inner.check_open(&st)?;
        let queue = self.inner.queue_for(&st, channel)?;
        self.inner.mark_sent();

        let mframe = encode_method_frame(channel, method);
        let hframe = encode_header_frame(channel, &header);

        let method_header_len = mframe.len() + hframe.len();
        let body_len = if body.is_empty() {
            0
        } else {
            body.len() + FRAME_OVERHEAD
        };

        if method_header_len + body_len < self.inner.chunk_threshold {
            let mut all = BytesMut::with_capacity(method_header_len + body_len);
            all.extend_from_slice(&mframe);
            all.extend_from_slice(&hframe);
            if !body.is_empty() {
                all.extend_from_slice(&body_frame(channel, &body));
            }
            return queue.write(all.freeze());
        }

        if method_header_len < self.inner.chunk_threshold {
            let mut both = BytesMut::with_capacity(method_header_len);
            both.extend_from_slice(&mframe);
            both.extend_from_slice(&hframe);
            queue.write(both.freeze())?;
        } else {
            queue.write(mframe)?;
            queue.write(hframe)?;
        }
        self.inner.write_body(queue, channel, &body)
    }

    /// Send a content body on a channel, fragmenting at the frame limit.
    pub fn send_body(&self, channel: u16, body: &[u8]) -> Result<bool> {
        let st = self.inner.state_guard();
        self.inner.check_open(&st)?;
        let queue = self.inner.queue_for(&st, channel)?;
        self.inner.mark_sent();
        self.inner.write_body(queue, channel, body)
    }

    /// Wait until a channel's outbound queue drops below its high-water
    /// mark. Returns immediately if it already is below.
    pub async fn drained(&self, channel: u16) -> Result<()> {
        let queue = {
            let st = self.inner.state_guard();
            self.inner.check_open(&st)?;
            self.inner.queue_for(&st, channel)?.clone()
        };
        queue.drained().await;
        Ok(())
    }

    /// Close the connection without giving a reason.
    pub async fn close(&self) -> Result<()> {
        self.close_with_reason("closed by client", reply_code::REPLY_SUCCESS)
            .await
    }

    /// Close with a reason and a reply code.
    ///
    /// Sends a close frame (once, no matter how many concurrent callers)
    /// and resolves when the closing handshake completes. All further send
    /// attempts fail immediately with the captured context.
    pub async fn close_with_reason(&self, reason: &str, code: u16) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.begin_close(reason, code, Some(tx))?;
        rx.await.map_err(|_| EngineError::ConnectionClosed)?;
        Ok(())
    }
}

impl Inner {
    fn state_guard(&self) -> MutexGuard<'_, State> {
        // Poisoning only happens if a holder panicked; the state itself is
        // still coherent for teardown.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_open(&self, st: &State) -> Result<()> {
        match &st.mode {
            Mode::Running => Ok(()),
            Mode::Closing { context, .. } | Mode::Closed { context } => {
                Err(EngineError::IllegalOperation {
                    context: context.clone(),
                })
            }
        }
    }

    fn queue_for<'a>(&self, st: &'a State, channel: u16) -> Result<&'a ChannelQueue> {
        if channel == 0 {
            return Ok(&st.control);
        }
        st.slots
            .get(channel)
            .map(|slot| &slot.queue)
            .ok_or_else(|| {
                EngineError::Protocol(format!("send on unallocated channel {}", channel))
            })
    }

    fn mark_sent(&self) {
        self.sent_since_check.store(true, Ordering::Release);
    }

    fn write_body(&self, queue: &ChannelQueue, channel: u16, body: &[u8]) -> Result<bool> {
        let max_body = (self.negotiated.frame_max as usize).saturating_sub(FRAME_OVERHEAD);
        let mut below = true;
        for fragment in body.chunks(max_body.max(1)) {
            below = queue.write(body_frame(channel, fragment))?;
        }
        Ok(below)
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    /// Route one inbound frame. Returns `false` once the connection is
    /// closed and the dispatch loop should stop.
    fn accept(&self, frame: Frame) -> bool {
        if frame.channel == 0 {
            self.accept_control(frame.body);
        } else {
            self.accept_channel(frame.channel, frame.body);
        }
        !matches!(self.state_guard().mode, Mode::Closed { .. })
    }

    fn accept_channel(&self, channel: u16, body: FrameBody) {
        let unknown = {
            let st = self.state_guard();
            match &st.mode {
                Mode::Running => match st.slots.get(channel) {
                    Some(slot) => {
                        // A dropped receiver means the owner went away;
                        // frames for it are discarded, not an engine error.
                        let _ = slot.deliveries.send(Delivery::Frame(body));
                        false
                    }
                    None => true,
                },
                // Anything not close-related is ignored while closing.
                Mode::Closing { .. } | Mode::Closed { .. } => false,
            }
        };

        if unknown {
            self.close_with_error(
                format!("frame on unknown channel {}", channel),
                reply_code::CHANNEL_ERROR,
            );
        }
    }

    fn accept_control(&self, body: FrameBody) {
        let method = match body {
            // Already counted as activity when the bytes arrived.
            FrameBody::Heartbeat => return,
            FrameBody::Method(method) => method,
            FrameBody::Header(_) | FrameBody::Body(_) => {
                self.close_with_error(
                    "content frame on channel 0".to_string(),
                    reply_code::UNEXPECTED_FRAME,
                );
                return;
            }
        };

        match method.id {
            method_id::CLOSE => self.on_peer_close(&method),
            method_id::CLOSE_OK => self.on_close_ok(),
            method_id::BLOCKED => {
                let reason = method
                    .fields::<BlockedFields>()
                    .map(|f| f.reason)
                    .unwrap_or_default();
                self.emit(ConnectionEvent::Blocked(reason));
            }
            method_id::UNBLOCKED => self.emit(ConnectionEvent::Unblocked),
            other => {
                let closing = matches!(self.state_guard().mode, Mode::Closing { .. });
                if !closing {
                    self.close_with_error(
                        format!("unexpected frame on channel 0: {}", method_name(other)),
                        reply_code::UNEXPECTED_FRAME,
                    );
                }
                // While closing, everything but close/close-ok is ignored.
            }
        }
    }

    /// Peer sent `connection.close`.
    fn on_peer_close(&self, method: &Method) {
        let fields = match method.fields::<CloseFields>() {
            Ok(fields) => fields,
            Err(e) => {
                self.emit(ConnectionEvent::Error(format!(
                    "malformed close frame: {}",
                    e
                )));
                self.to_closed("malformed close frame received".to_string(), None);
                return;
            }
        };

        // Either way we acknowledge; what differs is whether we were
        // already closing ourselves.
        let was_running = {
            let st = self.state_guard();
            let running = matches!(st.mode, Mode::Running);
            if !matches!(st.mode, Mode::Closed { .. }) {
                self.send_control_locked(&st, method_id::CLOSE_OK, &CloseOkFields::default());
            }
            running
        };

        if was_running {
            // Unsolicited close: no more frames will arrive, sends would be
            // ignored. Straight to CLOSED after the close-ok reply.
            let message = format!(
                "connection closed: {} (code {})",
                fields.reply_text, fields.reply_code
            );
            if is_fatal_code(fields.reply_code) {
                self.emit(ConnectionEvent::Error(message.clone()));
            }
            self.to_closed(message.clone(), Some(message));
        }
        // If we were CLOSING this was a simultaneous close; we replied
        // close-ok and keep waiting for our own close-ok.
    }

    /// Peer confirmed our close.
    fn on_close_ok(&self) {
        let closing = matches!(self.state_guard().mode, Mode::Closing { .. });
        if closing {
            self.to_closed("close-ok received".to_string(), None);
        } else {
            self.close_with_error(
                "unexpected connection.close-ok".to_string(),
                reply_code::UNEXPECTED_FRAME,
            );
        }
    }

    /// Encode and queue a control method while holding the state lock.
    fn send_control_locked<T: serde::Serialize>(&self, st: &State, id: u32, fields: &T) {
        match Method::build(id, fields) {
            Ok(method) => {
                self.mark_sent();
                if let Err(e) = st.control.write(encode_method_frame(0, &method)) {
                    tracing::debug!("control send after writer shutdown: {}", e);
                }
            }
            Err(e) => tracing::error!("failed to encode control method: {}", e),
        }
    }

    /// Emit an error, then initiate the closing handshake.
    fn close_with_error(&self, detail: String, code: u16) {
        tracing::warn!("{}", detail);
        self.emit(ConnectionEvent::Error(detail.clone()));
        let _ = self.begin_close(&detail, code, None);
    }

    /// Move RUNNING → CLOSING, sending exactly one close frame.
    ///
    /// Concurrent callers while already CLOSING just add their waiter; a
    /// call after CLOSED fails with the captured context.
    fn begin_close(
        &self,
        reason: &str,
        code: u16,
        waiter: Option<oneshot::Sender<()>>,
    ) -> Result<()> {
        let mut st = self.state_guard();
        match &mut st.mode {
            Mode::Running => {}
            Mode::Closing { waiters, .. } => {
                if let Some(w) = waiter {
                    waiters.push(w);
                }
                return Ok(());
            }
            Mode::Closed { context } => {
                return Err(EngineError::IllegalOperation {
                    context: context.clone(),
                })
            }
        }

        self.send_control_locked(
            &st,
            method_id::CLOSE,
            &CloseFields {
                reply_code: code,
                reply_text: reason.to_string(),
                class_id: 0,
                method_id: 0,
            },
        );
        st.mode = Mode::Closing {
            context: format!("connection closing: {}", reason),
            waiters: waiter.into_iter().collect(),
        };
        Ok(())
    }

    /// Terminal transition. Cascade-closes every channel, invalidates all
    /// sends, stops the heartbeat monitor, ends the transport, and emits
    /// the close notification. Idempotent: only the first call acts.
    fn to_closed(&self, context: String, error: Option<String>) {
        let (slots, heartbeat, waiters) = {
            let mut st = self.state_guard();
            if matches!(st.mode, Mode::Closed { .. }) {
                return;
            }
            let previous = std::mem::replace(
                &mut st.mode,
                Mode::Closed {
                    context: format!("connection closed ({})", context),
                },
            );
            let waiters = match previous {
                Mode::Closing { waiters, .. } => waiters,
                _ => Vec::new(),
            };
            (st.slots.drain(), st.heartbeat.take(), waiters)
        };

        tracing::debug!(context = %context, "connection closed");

        for (id, slot) in slots {
            tracing::trace!(channel = id, "cascading close to channel");
            let _ = slot.deliveries.send(Delivery::Closed(context.clone()));
            // Dropping the slot unpipes its queue before the id is freed.
        }

        if let Some(hb) = heartbeat {
            hb.clear();
        }

        for waiter in waiters {
            let _ = waiter.send(());
        }

        // The transport ending after this point is expected, not an error.
        self.expect_transport_close.store(true, Ordering::Release);
        self.writer.shutdown();
        self.emit(ConnectionEvent::Close { error });
    }

    /// Transport ended or errored outside a closing handshake.
    fn on_transport_failed(&self, error: Option<std::io::Error>) {
        if self.expect_transport_close.swap(true, Ordering::AcqRel) {
            return;
        }
        let message = match error {
            Some(e) => e.to_string(),
            None => "unexpected transport close".to_string(),
        };
        self.emit(ConnectionEvent::Error(message.clone()));
        self.to_closed(message.clone(), Some(message));
    }

    /// The writer task died on a transport write error.
    fn on_writer_failed(&self, error: EngineError) {
        if self.expect_transport_close.swap(true, Ordering::AcqRel) {
            return;
        }
        let message = format!("write path failed: {}", error);
        self.emit(ConnectionEvent::Error(message.clone()));
        self.to_closed(message.clone(), Some(message));
    }

    /// A frame failed to decode or violated framing: protocol state is
    /// corrupt, the loop cannot continue.
    fn on_frame_error(&self, error: EngineError) {
        let message = error.to_string();
        self.emit(ConnectionEvent::Error(message.clone()));
        self.to_closed(message.clone(), Some(message));
    }

    /// Heartbeat monitor declared the peer dead.
    fn on_heartbeat_timeout(&self) {
        let message = EngineError::HeartbeatTimeout.to_string();
        self.emit(ConnectionEvent::Error(message.clone()));
        self.to_closed(message.clone(), Some(message));
    }

    /// Heartbeat monitor asked for a liveness frame.
    fn send_heartbeat(&self) {
        self.mark_sent();
        if let Err(e) = self.writer.write_raw(heartbeat_frame()) {
            tracing::debug!("heartbeat send after writer shutdown: {}", e);
        }
    }
}

/// The frame dispatch loop: sole consumer of the transport's read side.
///
/// Frames are dispatched strictly in arrival order; no two passes for the
/// same connection ever run concurrently.
async fn dispatch_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    mut buffer: FrameBuffer,
    inner: Arc<Inner>,
    mut pulses: Option<mpsc::Receiver<Pulse>>,
) {
    let mut chunk = vec![0u8; 64 * 1024];

    loop {
        // Drain every complete frame already buffered before reading more;
        // one read may have carried several frames.
        loop {
            match buffer.try_next() {
                Ok(Some(frame)) => {
                    if !inner.accept(frame) {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    inner.on_frame_error(e);
                    return;
                }
            }
        }

        tokio::select! {
            read = reader.read(&mut chunk) => match read {
                Ok(0) => {
                    inner.on_transport_failed(None);
                    return;
                }
                Ok(n) => {
                    inner.recv_since_check.store(true, Ordering::Release);
                    buffer.extend(&chunk[..n]);
                }
                Err(e) => {
                    inner.on_transport_failed(Some(e));
                    return;
                }
            },
            pulse = recv_pulse(&mut pulses) => match pulse {
                Pulse::Beat => inner.send_heartbeat(),
                Pulse::Timeout => {
                    inner.on_heartbeat_timeout();
                    return;
                }
            },
        }
    }
}

/// Await the next heartbeat pulse, or forever if heartbeating is disabled.
async fn recv_pulse(pulses: &mut Option<mpsc::Receiver<Pulse>>) -> Pulse {
    match pulses {
        Some(rx) => match rx.recv().await {
            Some(pulse) => pulse,
            None => {
                // Monitor gone (cleared); stop polling this branch.
                *pulses = None;
                std::future::pending().await
            }
        },
        None => std::future::pending().await,
    }
}
