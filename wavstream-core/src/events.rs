//! Playback events broadcast to the host.
//!
//! Emitted by the sync worker (and by `Engine::play`/`stop`) on a
//! `tokio::sync::broadcast` channel; subscribe with `Engine::subscribe_events`.
//! Slow subscribers lag rather than block the worker.

use serde::{Deserialize, Serialize};

use crate::output::SequenceId;

/// One playback event on one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub channel: usize,
    pub kind: PlaybackEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum PlaybackEventKind {
    /// Playback began on the channel.
    Started { streamed: bool, looping: bool },
    /// A refilled chunk was queued on the mixer.
    ChunkQueued { sequence: SequenceId, bytes: usize },
    /// The mixer ran out of queued audio before the next chunk was ready.
    Underrun,
    /// A refill read came back short or failed; the gap was zero-filled.
    ReadError { message: String },
    /// End of file reached on a looping stream; playback restarted.
    Looped,
    /// Playback ended and the channel's buffers were released.
    Finished,
    /// Playback was stopped by the host.
    Stopped,
}
