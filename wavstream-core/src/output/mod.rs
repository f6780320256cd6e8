//! Audio output (mixer) abstraction.
//!
//! The `AudioOutput` trait mirrors a hardware mixer with per-channel wave
//! buffer queues: the engine configures a channel, submits buffers, and polls
//! the sequence id of the buffer currently playing to learn when the mixer
//! has moved on. Swap in [`soft::SoftMixer`] (software, default) or any
//! hardware-backed implementation without touching the engine.

pub mod clock;
#[cfg(feature = "audio-cpal")]
pub mod device;
pub mod soft;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::buffering::{DeviceBuffer, SharedBuffer};
use crate::error::Result;
use crate::format::{Encoding, FormatDescriptor};

/// Identifier assigned by the output to each submitted buffer.
///
/// Monotonically increasing across the whole output, so a later submission
/// always compares greater than an earlier one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SequenceId(pub u64);

/// Per-channel playback parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub encoding: Encoding,
}

impl From<&FormatDescriptor> for ChannelConfig {
    fn from(format: &FormatDescriptor) -> Self {
        Self {
            sample_rate: format.sample_rate,
            channels: format.channels,
            encoding: format.encoding,
        }
    }
}

/// A buffer queued for playback.
#[derive(Debug, Clone)]
pub struct WaveBuf {
    pub buffer: SharedBuffer,
    /// Sample frames to play from the start of `buffer`.
    pub sample_count: u64,
    /// Repeat until the queue is cleared.
    pub looping: bool,
}

impl WaveBuf {
    pub fn new(buffer: SharedBuffer, sample_count: u64, looping: bool) -> Self {
        Self {
            buffer,
            sample_count,
            looping,
        }
    }
}

/// Contract for mixer backends.
///
/// All methods take `&self`; implementations synchronise internally because
/// the engine calls them from both the caller thread and the sync worker.
pub trait AudioOutput: Send + Sync + 'static {
    /// Bring the backend up. Called once by `Engine::new`.
    ///
    /// # Errors
    /// Returns `HardwareInit` if the backend cannot start.
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Tear the backend down. Called once by `Engine::shutdown`.
    fn shutdown(&self) {}

    /// Reset `channel` and apply rate, channel count and encoding.
    fn configure(&self, channel: usize, config: ChannelConfig);

    /// Append `wave` to the channel queue.
    fn submit(&self, channel: usize, wave: WaveBuf) -> SequenceId;

    /// Sequence id of the buffer currently playing, `None` when idle.
    fn current_sequence(&self, channel: usize) -> Option<SequenceId>;

    /// Drop every queued buffer on `channel`. Once this returns the mixer
    /// holds no reference to them.
    fn clear_queue(&self, channel: usize);

    /// Make the first `len` bytes of `buffer` visible to the mixer.
    fn flush(&self, buffer: &DeviceBuffer, len: usize);
}

/// Thread-safe reference-counted handle to any `AudioOutput`.
#[derive(Clone)]
pub struct OutputHandle(pub Arc<dyn AudioOutput>);

impl OutputHandle {
    pub fn new<O: AudioOutput>(output: O) -> Self {
        Self(Arc::new(output))
    }
}

impl std::ops::Deref for OutputHandle {
    type Target = dyn AudioOutput;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl std::fmt::Debug for OutputHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputHandle").finish_non_exhaustive()
    }
}
