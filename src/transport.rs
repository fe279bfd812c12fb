//! Transport adapter.
//!
//! The engine works over any bidirectional byte stream; this module only
//! supplies the [`Transport`] bound and a thin TCP connector that applies
//! socket options before the engine ever sees the stream. TLS or in-memory
//! duplex streams (used throughout the tests) plug in the same way.

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::error::{EngineError, Result};

/// Anything the connection engine can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for T {}

/// Socket options applied before the handshake starts.
#[derive(Debug, Clone, Default)]
pub struct TcpOptions {
    /// Disable Nagle's algorithm.
    pub no_delay: bool,
    /// Enable TCP keep-alive probes after this idle time.
    pub keep_alive: Option<Duration>,
    /// Abort the connect attempt after this long.
    pub connect_timeout: Option<Duration>,
}

/// Connect a TCP stream with the given options.
///
/// Connection setup policy (address selection, retries, TLS upgrade)
/// belongs to the caller; the engine only needs the finished stream.
pub async fn tcp_connect(addr: impl ToSocketAddrs, options: &TcpOptions) -> Result<TcpStream> {
    let connect = TcpStream::connect(addr);
    let stream = match options.connect_timeout {
        Some(limit) => tokio::time::timeout(limit, connect)
            .await
            .map_err(|_| EngineError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)))??,
        None => connect.await?,
    };

    stream.set_nodelay(options.no_delay)?;
    if let Some(idle) = options.keep_alive {
        let keepalive = TcpKeepalive::new().with_time(idle);
        SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
    }

    Ok(stream)
}
