//! Sync worker: one background thread refilling every streamed channel.
//!
//! ## Per-channel state machine (one step per scan)
//!
//! ```text
//! Idle ──play──► Playing ──mixer reaches Pending──► swap, read, flush, submit ──┐
//!                   ▲                                                            │
//!                   └────────────────────────── not at EOF ◄─────────────────────┘
//!                   │
//!                   └─ at EOF, Pending played out ─► looping? rewind + resubmit primer
//!                                                    else     free buffers, Finished
//! ```
//!
//! Completion is detected by comparing the mixer's current sequence id with
//! the stream's Active and Pending ids. The refill target is always the
//! buffer whose submission the mixer has already moved past, so a queued
//! buffer is never overwritten or freed.
//!
//! The whole scan runs under the channel-table mutex; `Engine::play`/`stop`
//! take the same mutex.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{ChannelState, ChannelTable, Shared};
use crate::events::PlaybackEventKind;
use crate::output::{SequenceId, WaveBuf};
use crate::stream::StreamDescriptor;

#[derive(Default)]
pub struct WorkerDiagnostics {
    pub scans: AtomicUsize,
    pub handoffs: AtomicUsize,
    pub chunks_read: AtomicUsize,
    pub underruns: AtomicUsize,
    pub read_errors: AtomicUsize,
    pub loops: AtomicUsize,
    pub finished: AtomicUsize,
}

impl WorkerDiagnostics {
    pub fn reset(&self) {
        self.scans.store(0, Ordering::Relaxed);
        self.handoffs.store(0, Ordering::Relaxed);
        self.chunks_read.store(0, Ordering::Relaxed);
        self.underruns.store(0, Ordering::Relaxed);
        self.read_errors.store(0, Ordering::Relaxed);
        self.loops.store(0, Ordering::Relaxed);
        self.finished.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            scans: self.scans.load(Ordering::Relaxed),
            handoffs: self.handoffs.load(Ordering::Relaxed),
            chunks_read: self.chunks_read.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            loops: self.loops.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub scans: usize,
    pub handoffs: usize,
    /// Refill reads performed by the worker (the primer read at load time is not counted).
    pub chunks_read: usize,
    pub underruns: usize,
    pub read_errors: usize,
    pub loops: usize,
    pub finished: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Playing,
    Finished,
}

/// Run scans every `interval` until `stop_rx` fires or disconnects.
pub(crate) fn run(shared: Arc<Shared>, interval: Duration, stop_rx: Receiver<()>) {
    info!(?interval, "sync worker started");

    loop {
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let mut table = shared.table.lock();
        scan(&shared, &mut table);
    }

    info!("sync worker stopped");
}

/// One pass over every channel slot. Caller holds the table lock.
pub(crate) fn scan(shared: &Shared, table: &mut ChannelTable) {
    shared.diagnostics.scans.fetch_add(1, Ordering::Relaxed);

    for channel in 0..table.slots.len() {
        let done = match table.slots[channel].as_mut() {
            None => false,
            // Whole-file playback: nothing to refill, just notice when it ends.
            Some(ChannelState::Resident { .. }) => {
                shared.output.current_sequence(channel).is_none()
            }
            Some(ChannelState::Streaming(stream)) => {
                step_stream(shared, channel, stream) == Step::Finished
            }
        };

        if done {
            table.slots[channel] = None;
            shared.diagnostics.finished.fetch_add(1, Ordering::Relaxed);
            info!(channel, "playback finished");
            shared.emit(channel, PlaybackEventKind::Finished);
        }
    }
}

/// Clear `channel`'s mixer queue and release whatever is bound to it.
///
/// Returns `true` if a sound was bound. The queue is cleared first so the
/// stream buffers are unreferenced by the time they are freed.
pub(crate) fn retire_channel(shared: &Shared, table: &mut ChannelTable, channel: usize) -> bool {
    shared.output.clear_queue(channel);
    match table.slots.get_mut(channel).and_then(Option::take) {
        Some(ChannelState::Streaming(mut stream)) => {
            stream.release(&shared.allocator);
            true
        }
        Some(ChannelState::Resident { .. }) => true,
        None => false,
    }
}

fn step_stream(shared: &Shared, channel: usize, stream: &mut StreamDescriptor) -> Step {
    if stream.finished {
        return Step::Finished;
    }

    let current = shared.output.current_sequence(channel);

    // Pending has started playing: the previously active buffer is free.
    if let Some(pending) = stream.pending_seq {
        if !stream.pending_started && reached(current, pending) {
            if current.is_none() {
                warn!(channel, sequence = pending.0, "mixer ran dry before hand-off was seen");
                shared.diagnostics.underruns.fetch_add(1, Ordering::Relaxed);
                shared.emit(channel, PlaybackEventKind::Underrun);
            }
            stream.pending_started = true;
            stream.elapsed_secs += stream.sound.plan().chunk_secs(stream.sound.format());
            shared.diagnostics.handoffs.fetch_add(1, Ordering::Relaxed);

            if !stream.end_of_file {
                refill(shared, channel, stream);
            }
        }
    }

    if let Some(active) = stream.active_seq {
        if current != Some(active) {
            stream.active_seq = None;
        }
    }

    let drained = stream.end_of_file
        && stream.pending_started
        && stream.active_seq.is_none()
        && current != stream.pending_seq;
    if !drained {
        return Step::Playing;
    }

    if stream.looping && restart_loop(shared, channel, stream) {
        return Step::Playing;
    }

    stream.release(&shared.allocator);
    stream.finished = true;
    Step::Finished
}

/// Whether the mixer has started (or already finished) `pending`.
///
/// An idle channel counts: the queue ran dry before the worker looked.
fn reached(current: Option<SequenceId>, pending: SequenceId) -> bool {
    match current {
        Some(cur) => cur >= pending,
        None => true,
    }
}

/// Swap roles, read the next chunk into the Pending buffer and queue it.
fn refill(shared: &Shared, channel: usize, stream: &mut StreamDescriptor) {
    let frame_bytes = stream.sound.format().frame_bytes();
    let data_end = stream.sound.format().data_end();
    let len = stream
        .remaining_bytes()
        .min(stream.sound.plan().chunk_bytes as u64) as usize;
    let frames = len / frame_bytes;

    if frames == 0 {
        // Only a partial trailing frame (or nothing) left.
        stream.cursor = data_end;
        stream.end_of_file = true;
        debug!(channel, "no whole frame left to stream");
        return;
    }

    let Some(buffers) = stream.buffers.as_mut() else {
        return;
    };
    buffers.swap();

    match stream.sound.read_chunk(stream.cursor, &buffers.pending, len) {
        Ok(n) if n == len => {}
        Ok(n) => {
            warn!(channel, expected = len, got = n, "short chunk read, zero-filled");
            shared.diagnostics.read_errors.fetch_add(1, Ordering::Relaxed);
            shared.emit(
                channel,
                PlaybackEventKind::ReadError {
                    message: format!("short read: {n} of {len} bytes"),
                },
            );
        }
        Err(e) => {
            warn!(channel, "chunk read failed, zero-filled: {e}");
            shared.diagnostics.read_errors.fetch_add(1, Ordering::Relaxed);
            shared.emit(
                channel,
                PlaybackEventKind::ReadError {
                    message: e.to_string(),
                },
            );
        }
    }
    shared.diagnostics.chunks_read.fetch_add(1, Ordering::Relaxed);

    stream.cursor += len as u64;
    if stream.cursor >= data_end {
        stream.end_of_file = true;
    }

    shared.output.flush(&buffers.pending, len);
    let seq = shared.output.submit(
        channel,
        WaveBuf::new(buffers.pending.share(), frames as u64, false),
    );

    stream.active_seq = stream.pending_seq;
    stream.pending_seq = Some(seq);
    stream.pending_started = false;

    debug!(
        channel,
        sequence = seq.0,
        bytes = len,
        eof = stream.end_of_file,
        "chunk queued"
    );
    shared.emit(
        channel,
        PlaybackEventKind::ChunkQueued {
            sequence: seq,
            bytes: len,
        },
    );
}

/// Requeue the primer and rewind the cursor. `false` if the sound has been
/// unloaded underneath the stream.
fn restart_loop(shared: &Shared, channel: usize, stream: &mut StreamDescriptor) -> bool {
    let sound = Arc::clone(&stream.sound);
    let submitted = sound.with_primer(|primer| {
        shared.output.flush(primer, sound.plan().chunk_bytes);
        shared.output.submit(channel, sound.primer_wave(primer, false))
    });

    let Some(seq) = submitted else {
        warn!(channel, "loop restart without a primer, finishing stream");
        return false;
    };

    stream.rewind(seq);
    shared.diagnostics.loops.fetch_add(1, Ordering::Relaxed);
    debug!(channel, sequence = seq.0, "stream looped");
    shared.emit(channel, PlaybackEventKind::Looped);
    true
}
