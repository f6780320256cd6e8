//! `SoftMixer`: software implementation of the mixer queue.
//!
//! Each channel owns a FIFO of submitted wave buffers; the head of the FIFO
//! is the buffer "playing". Buffers are consumed either explicitly with
//! [`SoftMixer::finish_current`] (deterministic stepping) or by pulling
//! interleaved f32 frames out of [`SoftMixer::render`] (real-time playback
//! through [`super::clock::ClockDriver`] or a cpal output stream).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{AudioOutput, ChannelConfig, SequenceId, WaveBuf};
use crate::buffering::{BufferId, DeviceBuffer};
use crate::format::Encoding;

struct QueuedWave {
    seq: SequenceId,
    wave: WaveBuf,
}

#[derive(Default)]
struct MixerChannel {
    config: Option<ChannelConfig>,
    queue: VecDeque<QueuedWave>,
    /// Fractional frame position inside the head buffer.
    position: f64,
}

#[derive(Default)]
struct MixerCounters {
    submitted: AtomicUsize,
    completed: AtomicUsize,
    flushed: AtomicUsize,
    cleared: AtomicUsize,
    double_queued: AtomicUsize,
}

/// Snapshot of mixer activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MixerStats {
    pub submitted: usize,
    pub completed: usize,
    pub flushed: usize,
    pub cleared: usize,
    /// Submissions of a buffer that was still queued on the same channel.
    /// Anything other than zero means a playing buffer was overwritten.
    pub double_queued: usize,
}

/// Software mixer with `channel_count` independent queues.
pub struct SoftMixer {
    channels: Mutex<Vec<MixerChannel>>,
    next_seq: AtomicU64,
    counters: MixerCounters,
}

impl SoftMixer {
    pub fn new(channel_count: usize) -> Self {
        let mut channels = Vec::with_capacity(channel_count);
        channels.resize_with(channel_count, MixerChannel::default);
        Self {
            channels: Mutex::new(channels),
            next_seq: AtomicU64::new(1),
            counters: MixerCounters::default(),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// Complete the buffer at the head of `channel`, as if the hardware had
    /// played its last sample. A looping head restarts instead of leaving.
    ///
    /// Returns the sequence id that completed, or `None` if the channel was idle.
    pub fn finish_current(&self, channel: usize) -> Option<SequenceId> {
        let mut channels = self.channels.lock();
        let ch = channels.get_mut(channel)?;
        ch.position = 0.0;
        let head = ch.queue.front()?;
        let seq = head.seq;
        if !head.wave.looping {
            ch.queue.pop_front();
        }
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        Some(seq)
    }

    /// Sequence ids queued on `channel`, head first.
    pub fn queued(&self, channel: usize) -> Vec<SequenceId> {
        self.channels
            .lock()
            .get(channel)
            .map(|ch| ch.queue.iter().map(|q| q.seq).collect())
            .unwrap_or_default()
    }

    /// Buffer ids referenced by `channel`'s queue, head first.
    pub fn queued_buffers(&self, channel: usize) -> Vec<BufferId> {
        self.channels
            .lock()
            .get(channel)
            .map(|ch| ch.queue.iter().map(|q| q.wave.buffer.id()).collect())
            .unwrap_or_default()
    }

    pub fn config(&self, channel: usize) -> Option<ChannelConfig> {
        self.channels.lock().get(channel).and_then(|ch| ch.config)
    }

    pub fn stats(&self) -> MixerStats {
        MixerStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            flushed: self.counters.flushed.load(Ordering::Relaxed),
            cleared: self.counters.cleared.load(Ordering::Relaxed),
            double_queued: self.counters.double_queued.load(Ordering::Relaxed),
        }
    }

    /// Mix every channel into `out` (interleaved, `out_channels` wide) at
    /// `out_rate`, consuming queued buffers as their samples are played.
    pub fn render(&self, out: &mut [f32], out_rate: u32, out_channels: u16) {
        let mut channels = self.channels.lock();
        self.render_locked(&mut channels, out, out_rate, out_channels);
    }

    /// Like [`render`](Self::render) but never blocks: writes silence and
    /// returns `false` when the mixer is busy. For audio callbacks.
    pub fn try_render(&self, out: &mut [f32], out_rate: u32, out_channels: u16) -> bool {
        match self.channels.try_lock() {
            Some(mut channels) => {
                self.render_locked(&mut channels, out, out_rate, out_channels);
                true
            }
            None => {
                out.fill(0.0);
                false
            }
        }
    }

    fn render_locked(
        &self,
        channels: &mut [MixerChannel],
        out: &mut [f32],
        out_rate: u32,
        out_channels: u16,
    ) {
        out.fill(0.0);
        if out_rate == 0 || out_channels == 0 {
            return;
        }
        let width = out_channels as usize;
        let frames = out.len() / width;

        for ch in channels.iter_mut() {
            let Some(config) = ch.config else {
                continue;
            };
            let step = config.sample_rate as f64 / out_rate as f64;
            let mut frame = 0;

            while frame < frames {
                let Some(head) = ch.queue.front() else {
                    break;
                };
                let total = head.wave.sample_count;
                let looping = head.wave.looping;
                {
                    let data = head.wave.buffer.read();
                    while frame < frames && (ch.position as u64) < total {
                        let (left, right) = decode_frame(&data, config, ch.position as usize);
                        let slot = &mut out[frame * width..(frame + 1) * width];
                        if width == 1 {
                            slot[0] += (left + right) * 0.5;
                        } else {
                            slot[0] += left;
                            slot[1] += right;
                        }
                        ch.position += step;
                        frame += 1;
                    }
                }

                if (ch.position as u64) >= total {
                    ch.position = if total > 0 {
                        ch.position - total as f64
                    } else {
                        0.0
                    };
                    if looping && total > 0 {
                        continue;
                    }
                    ch.queue.pop_front();
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
    }
}

/// Decode one frame as a (left, right) pair in [-1, 1]. Mono is duplicated.
fn decode_frame(data: &[u8], config: ChannelConfig, frame: usize) -> (f32, f32) {
    let bytes = config.encoding.bytes_per_sample() as usize;
    let base = frame * bytes * config.channels as usize;
    let sample = |index: usize| -> f32 {
        let offset = base + index * bytes;
        match config.encoding {
            Encoding::Pcm8 => data
                .get(offset)
                .map_or(0.0, |b| (*b as f32 - 128.0) / 128.0),
            Encoding::Pcm16 => data
                .get(offset..offset + 2)
                .map_or(0.0, |b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0),
        }
    };

    if config.channels == 1 {
        let s = sample(0);
        (s, s)
    } else {
        (sample(0), sample(1))
    }
}

impl AudioOutput for SoftMixer {
    fn configure(&self, channel: usize, config: ChannelConfig) {
        let mut channels = self.channels.lock();
        let Some(ch) = channels.get_mut(channel) else {
            warn!(channel, "configure on a channel the mixer does not have");
            return;
        };
        ch.queue.clear();
        ch.position = 0.0;
        ch.config = Some(config);
        debug!(
            channel,
            rate = config.sample_rate,
            channels = config.channels,
            encoding = config.encoding.name(),
            "channel configured"
        );
    }

    fn submit(&self, channel: usize, wave: WaveBuf) -> SequenceId {
        let seq = SequenceId(self.next_seq.fetch_add(1, Ordering::Relaxed));
        let mut channels = self.channels.lock();
        let Some(ch) = channels.get_mut(channel) else {
            warn!(channel, "submit on a channel the mixer does not have");
            return seq;
        };

        let buffer_id = wave.buffer.id();
        if ch.queue.iter().any(|q| q.wave.buffer.id() == buffer_id) {
            warn!(channel, buffer = buffer_id.0, "buffer submitted while still queued");
            self.counters.double_queued.fetch_add(1, Ordering::Relaxed);
        }

        ch.queue.push_back(QueuedWave { seq, wave });
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        seq
    }

    fn current_sequence(&self, channel: usize) -> Option<SequenceId> {
        self.channels
            .lock()
            .get(channel)
            .and_then(|ch| ch.queue.front().map(|q| q.seq))
    }

    fn clear_queue(&self, channel: usize) {
        if let Some(ch) = self.channels.lock().get_mut(channel) {
            ch.queue.clear();
            ch.position = 0.0;
            self.counters.cleared.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn flush(&self, buffer: &DeviceBuffer, len: usize) {
        if len > buffer.len() {
            warn!(
                buffer = buffer.id().0,
                len,
                capacity = buffer.len(),
                "flush range exceeds buffer"
            );
        }
        self.counters.flushed.fetch_add(1, Ordering::Relaxed);
    }
}
