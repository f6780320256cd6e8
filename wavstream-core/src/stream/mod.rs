//! Per-channel streaming state.
//!
//! A `StreamDescriptor` exists for every channel playing a sound that does
//! not fit in one chunk. It owns two device buffers tagged by role:
//!
//! - **Active**: the buffer the mixer is currently playing (or just played).
//! - **Pending**: the buffer being filled, or queued to play next.
//!
//! On every hand-off the roles are swapped by value and the new Pending
//! buffer is refilled from disk. Only the sync worker mutates a descriptor,
//! and only while holding the channel-table mutex.

pub mod source;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::buffering::{AllocatorHandle, DeviceBuffer};
use crate::output::SequenceId;
use source::LoadedSound;

/// The two stream-owned buffers, addressed by role.
#[derive(Debug)]
pub(crate) struct BufferPair {
    pub(crate) active: DeviceBuffer,
    pub(crate) pending: DeviceBuffer,
}

impl BufferPair {
    pub(crate) fn new(active: DeviceBuffer, pending: DeviceBuffer) -> Self {
        Self { active, pending }
    }

    /// Exchange roles: the buffer that was being filled is now the one playing.
    pub(crate) fn swap(&mut self) {
        std::mem::swap(&mut self.active, &mut self.pending);
    }
}

/// Streaming state for one channel.
#[derive(Debug)]
pub struct StreamDescriptor {
    pub(crate) sound: Arc<LoadedSound>,
    pub(crate) looping: bool,
    /// Absolute file offset of the next byte to read.
    pub(crate) cursor: u64,
    pub(crate) end_of_file: bool,
    pub(crate) finished: bool,
    /// `None` once returned to the pool.
    pub(crate) buffers: Option<BufferPair>,
    /// Submission that was playing before `pending_seq` started.
    pub(crate) active_seq: Option<SequenceId>,
    /// Most recent submission on this channel.
    pub(crate) pending_seq: Option<SequenceId>,
    /// Whether the mixer has been seen playing `pending_seq`.
    pub(crate) pending_started: bool,
    /// Advisory playback time estimate.
    pub(crate) elapsed_secs: f64,
}

impl StreamDescriptor {
    /// New stream whose primer was just submitted as `primer_seq`.
    pub(crate) fn new(
        sound: Arc<LoadedSound>,
        looping: bool,
        buffers: BufferPair,
        primer_seq: SequenceId,
    ) -> Self {
        let cursor = sound.first_refill_offset();
        Self {
            sound,
            looping,
            cursor,
            end_of_file: false,
            finished: false,
            buffers: Some(buffers),
            active_seq: None,
            pending_seq: Some(primer_seq),
            pending_started: false,
            elapsed_secs: 0.0,
        }
    }

    pub fn sound(&self) -> &Arc<LoadedSound> {
        &self.sound
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes left between the cursor and the end of the data region.
    pub(crate) fn remaining_bytes(&self) -> u64 {
        self.sound.format().data_end().saturating_sub(self.cursor)
    }

    /// Pool bytes owned by the buffer pair, zero once released.
    pub(crate) fn held_bytes(&self) -> usize {
        self.buffers
            .as_ref()
            .map_or(0, |pair| pair.active.len() + pair.pending.len())
    }

    /// Rewind to the first byte after the primer for a loop restart.
    pub(crate) fn rewind(&mut self, primer_seq: SequenceId) {
        self.cursor = self.sound.first_refill_offset();
        self.end_of_file = false;
        self.elapsed_secs = 0.0;
        self.active_seq = None;
        self.pending_seq = Some(primer_seq);
        self.pending_started = false;
    }

    /// Return both buffers to the pool. The caller guarantees the mixer no
    /// longer references them. Idempotent.
    pub(crate) fn release(&mut self, allocator: &AllocatorHandle) {
        if let Some(pair) = self.buffers.take() {
            allocator.free(pair.active);
            allocator.free(pair.pending);
        }
        self.active_seq = None;
        self.pending_seq = None;
    }

    pub fn status(&self, channel: usize) -> StreamStatus {
        let format = self.sound.format();
        StreamStatus {
            channel,
            position_bytes: self.cursor.saturating_sub(format.data_offset),
            data_size: format.data_size,
            end_of_file: self.end_of_file,
            looping: self.looping,
            elapsed_secs: self.elapsed_secs,
            active_seq: self.active_seq,
            pending_seq: self.pending_seq,
        }
    }
}

/// Read-only snapshot of a channel's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub channel: usize,
    /// Read cursor relative to the start of the data region.
    pub position_bytes: u64,
    pub data_size: u64,
    pub end_of_file: bool,
    pub looping: bool,
    pub elapsed_secs: f64,
    pub active_seq: Option<SequenceId>,
    pub pending_seq: Option<SequenceId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::BufferId;

    #[test]
    fn swap_exchanges_roles_by_value() {
        let mut pair = BufferPair::new(
            DeviceBuffer::new(BufferId(1), 4),
            DeviceBuffer::new(BufferId(2), 4),
        );
        pair.swap();
        assert_eq!(pair.active.id(), BufferId(2));
        assert_eq!(pair.pending.id(), BufferId(1));
        pair.swap();
        assert_eq!(pair.active.id(), BufferId(1));
    }
}
