//! Channel id allocation and slot bookkeeping.
//!
//! Channel ids are small integers allocated by the connection; id 0 is the
//! connection control channel and is never handed out. Allocation picks the
//! lowest free id so the backing vector stays dense, and a released slot is
//! set back to `None` rather than removed, ready for reuse.

use tokio::sync::mpsc;

use crate::codec::FrameBody;
use crate::error::{EngineError, Result};
use crate::writer::ChannelQueue;

/// What a channel owner receives from the dispatch loop.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// An inbound frame addressed to this channel, in wire order.
    Frame(FrameBody),
    /// The channel (or the whole connection) was torn down; no further
    /// deliveries follow and the sender is dropped.
    Closed(String),
}

/// Sender half registered by a channel owner at allocation time.
pub type DeliverySender = mpsc::UnboundedSender<Delivery>;

/// One allocated channel: its inbound handler and its outbound queue.
pub struct Slot {
    /// Where the dispatch loop forwards this channel's frames.
    pub deliveries: DeliverySender,
    /// Outbound queue piped into the shared write path.
    pub queue: ChannelQueue,
}

/// Dense id → slot map with lowest-free-id allocation.
pub struct ChannelSlots {
    /// Index 0 is permanently reserved for connection control.
    slots: Vec<Option<Slot>>,
    channel_max: u16,
}

impl ChannelSlots {
    /// Create an empty slot table allowing ids `1..=channel_max`.
    pub fn new(channel_max: u16) -> Self {
        Self {
            slots: vec![None],
            channel_max,
        }
    }

    /// Highest id this table will allocate.
    pub fn channel_max(&self) -> u16 {
        self.channel_max
    }

    /// Allocate the lowest free id and store the slot there.
    pub fn allocate(&mut self, slot: Slot) -> Result<u16> {
        for id in 1..=usize::from(self.channel_max) {
            if id == self.slots.len() {
                self.slots.push(Some(slot));
                return Ok(id as u16);
            }
            if self.slots[id].is_none() {
                self.slots[id] = Some(slot);
                return Ok(id as u16);
            }
        }
        Err(EngineError::ChannelsExhausted)
    }

    /// Look up an allocated slot.
    pub fn get(&self, id: u16) -> Option<&Slot> {
        self.slots.get(usize::from(id)).and_then(|s| s.as_ref())
    }

    /// Release an id, returning its slot.
    ///
    /// The returned slot's queue must be dropped by the caller; that is
    /// what unpipes it from the shared write path. Releasing an id that is
    /// not allocated is a caller bug.
    pub fn release(&mut self, id: u16) -> Option<Slot> {
        self.slots.get_mut(usize::from(id)).and_then(|s| s.take())
    }

    /// Take every allocated slot, for cascade close.
    pub fn drain(&mut self) -> Vec<(u16, Slot)> {
        let mut taken = Vec::new();
        for (id, entry) in self.slots.iter_mut().enumerate().skip(1) {
            if let Some(slot) = entry.take() {
                taken.push((id as u16, slot));
            }
        }
        taken
    }

    /// Number of currently allocated channels.
    pub fn allocated(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}
