//! muxwire is the client-side connection engine for a multiplexed,
//! message-oriented binary protocol. One connection carries many logical
//! channels over a single transport; the engine owns the opening handshake,
//! frame reassembly and dispatch, channel id allocation, the shared write
//! path with per-channel backpressure, heartbeat liveness, and the two-way
//! closing handshake.
//!
//! ```text
//!                        ┌───────────────────────────────┐
//!  channel owners ──────►│ ChannelQueue  ChannelQueue  … │
//!       ▲                │        └──────┬──────┘        │
//!       │ Delivery       │          writer task ─────────┼──► transport
//!       │                │                               │
//!       └── dispatch ◄───┼── FrameBuffer ◄───────────────┼──◄ transport
//!            loop        │   heartbeat monitor           │
//!                        └───────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! Open a connection over any transport implementing [`Transport`] (a TCP
//! stream from [`tcp_connect`], or an in-memory duplex in tests), allocate
//! channels, and send methods and messages:
//!
//! ```no_run
//! use muxwire::{Connection, Credentials, OpenOptions};
//!
//! # async fn demo() -> muxwire::Result<()> {
//! let transport = muxwire::tcp_connect("127.0.0.1:5672", &Default::default()).await?;
//! let options = OpenOptions::default()
//!     .credentials(Credentials::plain("guest", "guest"))
//!     .heartbeat(30);
//! let (connection, mut events) = Connection::open(transport, options).await?;
//!
//! let (tx, mut deliveries) = tokio::sync::mpsc::unbounded_channel();
//! let channel = connection.allocate_channel(tx)?;
//! # let _ = (channel, deliveries.recv().await, events.recv().await);
//! # connection.close().await
//! # }
//! ```
//!
//! Inbound frames for a channel arrive on its delivery sender in wire
//! order; connection-level notifications (errors, close, server blocked)
//! arrive on the event receiver returned by [`Connection::open`].

pub mod channels;
pub mod codec;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod handshake;
pub mod heartbeat;
pub mod transport;
pub mod writer;

pub use channels::{Delivery, DeliverySender};
pub use codec::{ContentHeader, Frame, FrameBody, FrameBuffer, Method};
pub use connection::{is_fatal_code, Connection, ConnectionEvent};
pub use credentials::Credentials;
pub use error::{EngineError, Result};
pub use handshake::{negotiate, Negotiated, OpenOptions};
pub use transport::{tcp_connect, TcpOptions, Transport};
pub use writer::DEFAULT_WRITE_HWM;
