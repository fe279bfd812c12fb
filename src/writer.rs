//! Multiplexed write path.
//!
//! All channels write through one dedicated writer task:
//!
//! ```text
//! channel 0 queue ─┐
//! channel 1 queue ─┼─► mpsc ─► writer task ─► transport
//! channel N queue ─┘
//! ```
//!
//! Each channel owns a [`ChannelQueue`] cloned off the shared sender. A
//! queue never blocks the caller: [`ChannelQueue::write`] always accepts the
//! chunk and returns whether the queue is still below its high-water mark.
//! Once `write` returns `false` the producer should pause and await
//! [`ChannelQueue::drained`]; resuming is the producer's job, the engine
//! only signals.
//!
//! The writer task batches ready chunks and flushes them with a single
//! vectored write where possible, so frames queued back-to-back by one
//! channel don't cost one syscall each.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::error::{EngineError, Result};

/// Default per-channel high-water mark, in queued chunks.
pub const DEFAULT_WRITE_HWM: usize = 1024;

/// Maximum chunks to batch into one vectored write.
const MAX_BATCH_SIZE: usize = 64;

/// One queued write: a contiguous span of encoded frame bytes.
struct Chunk {
    bytes: Bytes,
    /// Pending counter of the owning channel queue, if any.
    pending: Option<Arc<AtomicUsize>>,
    drain: Option<Arc<Notify>>,
    hwm: usize,
}

impl Chunk {
    /// Mark this chunk flushed: drop it from its queue's pending count and
    /// fire the drain signal when the queue falls back below its mark.
    fn complete(&self) {
        if let Some(pending) = &self.pending {
            let prev = pending.fetch_sub(1, Ordering::AcqRel);
            if prev == self.hwm {
                if let Some(drain) = &self.drain {
                    drain.notify_waiters();
                }
            }
        }
    }
}

enum WriteItem {
    Chunk(Chunk),
    /// Flush everything queued so far, end the transport's write side, stop.
    Shutdown,
}

/// Per-channel outbound queue bound to the shared write path.
///
/// Dropping the queue unpipes the channel: chunks already queued still
/// flush, nothing new can be written.
#[derive(Clone)]
pub struct ChannelQueue {
    tx: mpsc::UnboundedSender<WriteItem>,
    pending: Arc<AtomicUsize>,
    drain: Arc<Notify>,
    hwm: usize,
}

impl ChannelQueue {
    /// Queue a chunk of encoded frame bytes.
    ///
    /// Returns `Ok(true)` while the queue is below its high-water mark and
    /// `Ok(false)` once it has reached it; the chunk is accepted either way.
    pub fn write(&self, bytes: Bytes) -> Result<bool> {
        let count = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        let chunk = Chunk {
            bytes,
            pending: Some(self.pending.clone()),
            drain: Some(self.drain.clone()),
            hwm: self.hwm,
        };
        self.tx
            .send(WriteItem::Chunk(chunk))
            .map_err(|_| EngineError::ConnectionClosed)?;
        Ok(count < self.hwm)
    }

    /// Wait until the queue has dropped back below its high-water mark.
    ///
    /// Returns immediately if it already is.
    pub async fn drained(&self) {
        loop {
            // Register for the signal before checking the counter: the
            // crossing is notified exactly once, and `notify_waiters` only
            // reaches waiters that are already registered.
            let notified = self.drain.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending.load(Ordering::Acquire) < self.hwm {
                return;
            }
            notified.await;
        }
    }

    /// Chunks queued but not yet flushed.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Handle owned by the connection: mints channel queues and drives shutdown.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<WriteItem>,
}

impl WriterHandle {
    /// Pipe a new channel queue into the shared write path.
    pub fn queue(&self, hwm: usize) -> ChannelQueue {
        ChannelQueue {
            tx: self.tx.clone(),
            pending: Arc::new(AtomicUsize::new(0)),
            drain: Arc::new(Notify::new()),
            hwm,
        }
    }

    /// Write bytes outside any channel queue (heartbeats).
    pub fn write_raw(&self, bytes: Bytes) -> Result<()> {
        let chunk = Chunk {
            bytes,
            pending: None,
            drain: None,
            hwm: 0,
        };
        self.tx
            .send(WriteItem::Chunk(chunk))
            .map_err(|_| EngineError::ConnectionClosed)
    }

    /// Flush queued chunks, then end the transport's write side.
    pub fn shutdown(&self) {
        let _ = self.tx.send(WriteItem::Shutdown);
    }
}

/// Spawn the writer task over the transport's write half.
pub fn spawn_writer<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(writer_loop(rx, writer));
    (WriterHandle { tx }, task)
}

async fn writer_loop<W>(mut rx: mpsc::UnboundedReceiver<WriteItem>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch: Vec<Chunk> = Vec::with_capacity(MAX_BATCH_SIZE);

    loop {
        let first = match rx.recv().await {
            Some(item) => item,
            // All queues dropped: clean shutdown.
            None => return Ok(()),
        };

        let mut shutdown = false;
        match first {
            WriteItem::Chunk(chunk) => batch.push(chunk),
            WriteItem::Shutdown => shutdown = true,
        }

        // Collect whatever else is already queued, without waiting.
        while !shutdown && batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(WriteItem::Chunk(chunk)) => batch.push(chunk),
                Ok(WriteItem::Shutdown) => shutdown = true,
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            let result = write_batch(&mut writer, &batch).await;
            for chunk in batch.drain(..) {
                chunk.complete();
            }
            result?;
        }

        if shutdown {
            tracing::debug!("writer shutting down");
            writer.shutdown().await?;
            return Ok(());
        }
    }
}

/// Write a batch of chunks with vectored I/O, handling partial writes.
async fn write_batch<W>(writer: &mut W, batch: &[Chunk]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = batch.iter().map(|c| c.bytes.len()).sum();
    let mut written = 0usize;

    while written < total {
        let slices = remaining_slices(batch, written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        written += n;
    }

    writer.flush().await?;
    Ok(())
}

/// Build the IoSlice list for everything past `skip_bytes`.
fn remaining_slices(batch: &[Chunk], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut passed = 0usize;

    for chunk in batch {
        let end = passed + chunk.bytes.len();
        if skip_bytes < end && !chunk.bytes.is_empty() {
            let start = skip_bytes.saturating_sub(passed);
            slices.push(IoSlice::new(&chunk.bytes[start..]));
        }
        passed = end;
    }

    slices
}
