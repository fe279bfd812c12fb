//! Frame reassembly over arbitrarily fragmented reads.
//!
//! The transport hands us chunks with no alignment to frame boundaries: a
//! read may end mid-header, mid-payload, or carry several frames at once.
//! [`FrameBuffer`] retains undecoded bytes between reads so that decoding is
//! resumable: feeding a stream one byte at a time yields exactly the same
//! frame sequence as feeding it whole.

use bytes::BytesMut;

use super::wire::{parse_frame, FRAME_MIN_SIZE};
use super::{decode_frame, Frame};
use crate::error::Result;

/// Buffer accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Unconsumed bytes retained across reads.
    rest: BytesMut,
    /// Current maximum frame size; starts at the protocol minimum and is
    /// raised once tuning completes.
    frame_max: u32,
}

impl FrameBuffer {
    /// Create a buffer with the pre-negotiation frame size limit.
    pub fn new() -> Self {
        Self {
            rest: BytesMut::with_capacity(8 * 1024),
            frame_max: FRAME_MIN_SIZE,
        }
    }

    /// Raise (or lower) the frame size limit after tuning.
    pub fn set_frame_max(&mut self, frame_max: u32) {
        self.frame_max = frame_max;
    }

    /// Append raw bytes from a transport read.
    pub fn extend(&mut self, data: &[u8]) {
        self.rest.extend_from_slice(data);
    }

    /// Try to decode the next complete frame from the retained bytes.
    ///
    /// Returns `Ok(None)` when only a partial frame is buffered.
    pub fn try_next(&mut self) -> Result<Option<Frame>> {
        match parse_frame(&mut self.rest, self.frame_max)? {
            Some(raw) => Ok(Some(decode_frame(raw)?)),
            None => Ok(None),
        }
    }

    /// Append bytes and extract every complete frame now available.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.extend(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.try_next()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Number of buffered, undecoded bytes.
    pub fn len(&self) -> usize {
        self.rest.len()
    }

    /// Whether no partial frame is pending.
    pub fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
