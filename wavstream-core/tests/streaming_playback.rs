use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use wavstream_core::{
    AllocatorHandle, AudioOutput, ChannelConfig, ChunkSize, DeviceBuffer, Encoding, Engine,
    EngineConfig, LinearPool, OutputHandle, PlaybackEvent, PlaybackEventKind, SequenceId,
    SoftMixer, WavStreamError, WaveBuf,
};

const CHANNEL: usize = 0;

/// 16-bit mono ramp written through hound, `samples` frames at `rate`.
fn write_ramp(dir: &Path, name: &str, rate: u32, channels: u16, samples: u32) -> PathBuf {
    let path = dir.join(name);
    let spec = hound::WavSpec {
        channels,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).expect("create wav");
    for i in 0..samples {
        for _ in 0..channels {
            writer.write_sample((i % 1_000) as i16).expect("write sample");
        }
    }
    writer.finalize().expect("finalize wav");
    path
}

struct Harness {
    engine: Engine,
    mixer: Arc<SoftMixer>,
    pool: Arc<LinearPool>,
}

/// The worker never wakes on its own: every scan is an explicit `sync_now`.
fn harness(pool_bytes: usize) -> Harness {
    let mixer = Arc::new(SoftMixer::new(wavstream_core::MAX_CHANNELS));
    let pool = Arc::new(LinearPool::new(pool_bytes));
    let config = EngineConfig {
        poll_interval: Duration::from_secs(3_600),
        ..EngineConfig::default()
    };
    let engine = Engine::new(
        config,
        OutputHandle(mixer.clone()),
        AllocatorHandle(pool.clone()),
    )
    .expect("engine starts");
    Harness {
        engine,
        mixer,
        pool,
    }
}

impl Harness {
    /// Every buffer the mixer references is still owned by someone, and no
    /// buffer was ever queued twice.
    fn assert_queue_sound(&self, channel: usize) {
        for id in self.mixer.queued_buffers(channel) {
            assert!(self.pool.is_live(id), "queued buffer {id:?} was freed");
        }
        assert_eq!(self.mixer.stats().double_queued, 0, "buffer overwritten while queued");
    }

    /// Alternate mixer completions and worker scans until the channel is
    /// released. Returns the number of completed buffers.
    fn play_out(&self, channel: usize, max_steps: usize) -> usize {
        let mut completed = 0;
        for _ in 0..max_steps {
            self.engine.sync_now();
            self.assert_queue_sound(channel);
            if !self.engine.is_playing(channel) {
                return completed;
            }
            if self.mixer.finish_current(channel).is_some() {
                completed += 1;
            }
        }
        panic!("channel {channel} still playing after {max_steps} steps");
    }
}

fn recv_event_with_timeout(
    rx: &mut broadcast::Receiver<PlaybackEvent>,
    timeout: Duration,
) -> PlaybackEvent {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(ev) => return ev,
            Err(TryRecvError::Empty) => {
                if start.elapsed() >= timeout {
                    panic!("timed out waiting for playback event");
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => panic!("event channel closed unexpectedly"),
        }
    }
}

fn drain_kinds(rx: &mut broadcast::Receiver<PlaybackEvent>) -> Vec<PlaybackEventKind> {
    let mut kinds = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        kinds.push(ev.kind);
    }
    kinds
}

#[test]
fn divisible_file_is_read_exactly_once_per_chunk() {
    let dir = tempfile::tempdir().expect("tempdir");
    // 1 s of 16-bit mono at 8 kHz = 16_000 bytes, 0.25 s chunks of 4_000 bytes.
    let path = write_ramp(dir.path(), "even.wav", 8_000, 1, 8_000);
    let h = harness(1 << 20);

    h.engine
        .load_file(&path, ChunkSize::Seconds(0.25))
        .expect("load");
    let plan = h.engine.chunk_plan().expect("plan");
    assert_eq!(plan.chunk_bytes, 4_000);
    assert_eq!(plan.reads_for(16_000), 4);

    h.engine.play(CHANNEL, false).expect("play");
    let completed = h.play_out(CHANNEL, 64);

    let diag = h.engine.diagnostics();
    assert_eq!(diag.chunks_read as u64 + 1, plan.reads_for(16_000));
    assert_eq!(completed, 4);
    assert_eq!(diag.finished, 1);
    assert_eq!(diag.underruns, 0);
    // Only the primer remains.
    assert_eq!(h.pool.used_bytes(), 4_000);
}

#[test]
fn trailing_partial_chunk_is_read_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    // 10_000 frames, 3_000-frame chunks: 3 full chunks + 1_000 frames.
    let path = write_ramp(dir.path(), "odd.wav", 10_000, 1, 10_000);
    let h = harness(1 << 20);

    h.engine
        .load_file(&path, ChunkSize::Seconds(0.3))
        .expect("load");
    let plan = h.engine.chunk_plan().expect("plan");
    assert_eq!(plan.chunk_samples, 3_000);

    let mut rx = h.engine.subscribe_events();
    h.engine.play(CHANNEL, false).expect("play");
    h.play_out(CHANNEL, 64);

    assert_eq!(h.engine.diagnostics().chunks_read, 3);
    let queued: Vec<usize> = drain_kinds(&mut rx)
        .into_iter()
        .filter_map(|kind| match kind {
            PlaybackEventKind::ChunkQueued { bytes, .. } => Some(bytes),
            _ => None,
        })
        .collect();
    assert_eq!(queued, vec![6_000, 6_000, 2_000]);
}

#[test]
fn refill_waits_for_the_mixer_to_reach_pending() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_ramp(dir.path(), "wait.wav", 8_000, 1, 8_000);
    let h = harness(1 << 20);
    h.engine
        .load_file(&path, ChunkSize::Seconds(0.25))
        .expect("load");
    h.engine.play(CHANNEL, false).expect("play");

    // First scan sees the primer playing and queues chunk two.
    h.engine.sync_now();
    assert_eq!(h.engine.diagnostics().chunks_read, 1);
    assert_eq!(h.mixer.queued(CHANNEL).len(), 2);

    // Nothing moved on the mixer: further scans must not read again.
    for _ in 0..5 {
        h.engine.sync_now();
    }
    assert_eq!(h.engine.diagnostics().chunks_read, 1);
    h.assert_queue_sound(CHANNEL);

    h.mixer.finish_current(CHANNEL);
    h.engine.sync_now();
    assert_eq!(h.engine.diagnostics().chunks_read, 2);
    h.assert_queue_sound(CHANNEL);

    let status = h.engine.stream_status(CHANNEL).expect("streaming");
    assert_eq!(status.position_bytes, 12_000);
    assert!(status.elapsed_secs > 0.0);
}

#[test]
fn underrun_is_reported_and_playback_recovers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_ramp(dir.path(), "dry.wav", 8_000, 1, 8_000);
    let h = harness(1 << 20);
    h.engine
        .load_file(&path, ChunkSize::Seconds(0.25))
        .expect("load");
    h.engine.play(CHANNEL, false).expect("play");
    h.engine.sync_now();

    // Mixer plays both queued buffers before the worker looks again.
    h.mixer.finish_current(CHANNEL);
    h.mixer.finish_current(CHANNEL);
    assert!(h.mixer.queued(CHANNEL).is_empty());

    h.engine.sync_now();
    assert_eq!(h.engine.diagnostics().underruns, 1);
    assert_eq!(h.mixer.queued(CHANNEL).len(), 1);
    h.play_out(CHANNEL, 64);
    assert_eq!(h.engine.diagnostics().chunks_read, 3);
}

#[test]
fn looping_stream_rewinds_and_stop_frees_buffers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_ramp(dir.path(), "loop.wav", 8_000, 2, 4_000);
    let h = harness(1 << 20);
    h.engine
        .load_file(&path, ChunkSize::Seconds(0.2))
        .expect("load");
    let plan = h.engine.chunk_plan().expect("plan");
    assert_eq!(plan.chunk_bytes, 6_400);

    let mut rx = h.engine.subscribe_events();
    h.engine.play(CHANNEL, true).expect("play");

    let mut looped = false;
    for _ in 0..64 {
        h.engine.sync_now();
        h.assert_queue_sound(CHANNEL);
        if drain_kinds(&mut rx).contains(&PlaybackEventKind::Looped) {
            looped = true;
            break;
        }
        h.mixer.finish_current(CHANNEL);
    }
    assert!(looped, "stream never looped");

    let status = h.engine.stream_status(CHANNEL).expect("still streaming");
    assert_eq!(status.position_bytes, plan.chunk_bytes as u64);
    assert!(!status.end_of_file);
    assert!(h.engine.is_playing(CHANNEL));

    // Second lap reads the same chunks again.
    let first_lap = h.engine.diagnostics().chunks_read;
    for _ in 0..64 {
        h.engine.sync_now();
        h.assert_queue_sound(CHANNEL);
        if h.engine.diagnostics().loops == 2 {
            break;
        }
        h.mixer.finish_current(CHANNEL);
    }
    assert_eq!(h.engine.diagnostics().chunks_read, first_lap * 2);

    h.engine.stop(CHANNEL).expect("stop");
    assert_eq!(h.pool.used_bytes(), plan.chunk_bytes);
    assert!(h.mixer.queued(CHANNEL).is_empty());
    assert!(h.engine.stream_status(CHANNEL).is_none());
}

#[test]
fn whole_file_plays_without_stream_buffers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_ramp(dir.path(), "short.wav", 8_000, 1, 2_000);
    let h = harness(1 << 20);
    let mut rx = h.engine.subscribe_events();

    h.engine.load_file(&path, ChunkSize::WholeFile).expect("load");
    h.engine.play(CHANNEL, false).expect("play");
    assert_eq!(h.pool.used_bytes(), 4_000);
    assert!(h.engine.stream_status(CHANNEL).is_none());
    assert!(!h.engine.is_idle());

    h.play_out(CHANNEL, 8);
    assert!(h.engine.is_idle());
    assert_eq!(h.engine.diagnostics().chunks_read, 0);

    let kinds = drain_kinds(&mut rx);
    assert_eq!(
        kinds,
        vec![
            PlaybackEventKind::Started {
                streamed: false,
                looping: false
            },
            PlaybackEventKind::Finished,
        ]
    );
}

#[test]
fn oversized_chunk_request_collapses_to_whole_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_ramp(dir.path(), "clamp.wav", 8_000, 1, 2_000);
    let h = harness(1 << 20);

    h.engine
        .load_file(&path, ChunkSize::Seconds(10.0))
        .expect("load");
    let plan = h.engine.chunk_plan().expect("plan");
    assert!(plan.whole_file);
    assert_eq!(plan.chunk_samples, 2_000);
}

#[test]
fn looping_whole_file_stays_on_the_mixer() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_ramp(dir.path(), "resident.wav", 8_000, 1, 800);
    let h = harness(1 << 20);
    h.engine.load_file(&path, ChunkSize::WholeFile).expect("load");
    h.engine.play(CHANNEL, true).expect("play");

    for _ in 0..5 {
        h.mixer.finish_current(CHANNEL);
        h.engine.sync_now();
    }
    assert!(h.engine.is_playing(CHANNEL));
    assert_eq!(h.mixer.queued(CHANNEL).len(), 1);

    h.engine.stop(CHANNEL).expect("stop");
    assert!(!h.engine.is_playing(CHANNEL));
}

#[test]
fn stop_on_idle_channel_is_a_no_op() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_ramp(dir.path(), "busy.wav", 8_000, 1, 8_000);
    let h = harness(1 << 20);
    h.engine
        .load_file(&path, ChunkSize::Seconds(0.25))
        .expect("load");
    h.engine.play(2, false).expect("play");
    h.engine.sync_now();

    let channels_before = h.engine.active_channels();
    let status_before = h.engine.stream_status(2);
    let queued_before = h.mixer.queued(2);
    let used_before = h.pool.used_bytes();

    assert!(h.engine.stop(5).is_ok());

    assert_eq!(h.engine.active_channels(), channels_before);
    assert_eq!(h.engine.stream_status(2), status_before);
    assert_eq!(h.mixer.queued(2), queued_before);
    assert_eq!(h.pool.used_bytes(), used_before);
    assert!(h.engine.is_playing(2));
    assert!(matches!(
        h.engine.play(wavstream_core::MAX_CHANNELS, false),
        Err(WavStreamError::InvalidChannel { .. })
    ));
}

#[test]
fn truncated_file_degrades_but_finishes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_ramp(dir.path(), "truncated.wav", 8_000, 1, 8_000);
    let h = harness(1 << 20);
    h.engine
        .load_file(&path, ChunkSize::Seconds(0.25))
        .expect("load");

    // Keep the header plus 6_000 of the 16_000 data bytes.
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .expect("reopen fixture");
    file.set_len(44 + 6_000).expect("truncate fixture");
    drop(file);

    let mut rx = h.engine.subscribe_events();
    h.engine.play(CHANNEL, false).expect("play");
    h.play_out(CHANNEL, 64);

    let diag = h.engine.diagnostics();
    assert_eq!(diag.chunks_read, 3);
    assert_eq!(diag.read_errors, 3);
    assert_eq!(diag.finished, 1);

    let kinds = drain_kinds(&mut rx);
    let read_errors: Vec<&String> = kinds
        .iter()
        .filter_map(|kind| match kind {
            PlaybackEventKind::ReadError { message } => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(read_errors.len(), 3);
    assert!(read_errors[0].contains("2000 of 4000"), "got {}", read_errors[0]);
    assert_eq!(kinds.last(), Some(&PlaybackEventKind::Finished));

    assert!(!h.engine.is_playing(CHANNEL));
    // Only the primer is left.
    assert_eq!(h.pool.used_bytes(), 4_000);
    assert_eq!(h.pool.live_count(), 1);
}

#[test]
fn missing_file_is_file_not_found() {
    let h = harness(1 << 20);
    let err = h
        .engine
        .load_file("/no/such/file.wav", ChunkSize::WholeFile)
        .unwrap_err();
    assert!(matches!(err, WavStreamError::FileNotFound { .. }));
    assert!(h.engine.loaded_format().is_none());
}

#[test]
fn out_of_memory_on_load_leaks_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_ramp(dir.path(), "big.wav", 8_000, 2, 8_000);
    let h = harness(10_000);

    let err = h
        .engine
        .load_file(&path, ChunkSize::WholeFile)
        .unwrap_err();
    assert!(matches!(
        err,
        WavStreamError::OutOfMemory {
            requested: 32_000,
            available: 10_000
        }
    ));
    assert_eq!(h.pool.live_count(), 0);
    assert!(h.engine.loaded_format().is_none());
}

#[test]
fn float_wav_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("float.wav");
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8_000,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(&path, spec).expect("create wav");
    for _ in 0..100 {
        writer.write_sample(0.5f32).expect("write sample");
    }
    writer.finalize().expect("finalize wav");

    let h = harness(1 << 20);
    let err = h.engine.load_file(&path, ChunkSize::WholeFile).unwrap_err();
    assert!(
        matches!(err, WavStreamError::UnsupportedFormat(_)),
        "unexpected error: {err:?}"
    );
    assert_eq!(h.pool.live_count(), 0);
}

#[test]
fn cd_quality_tenth_of_a_second_chunk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_ramp(dir.path(), "cd.wav", 44_100, 2, 44_100);
    let h = harness(1 << 20);

    let format = h
        .engine
        .load_file(&path, ChunkSize::Seconds(0.1))
        .expect("load");
    assert_eq!(format.encoding, Encoding::Pcm16);
    assert_eq!(format.data_size, 176_400);
    let plan = h.engine.chunk_plan().expect("plan");
    assert_eq!(plan.chunk_samples, 4_410);
    assert_eq!(plan.chunk_bytes, 17_640);
    assert_eq!(plan.reads_for(format.data_size), 10);

    h.engine.play(CHANNEL, false).expect("play");
    assert_eq!(
        h.mixer.config(CHANNEL),
        Some(ChannelConfig {
            sample_rate: 44_100,
            channels: 2,
            encoding: Encoding::Pcm16
        })
    );
    h.play_out(CHANNEL, 128);
    assert_eq!(h.engine.diagnostics().chunks_read, 9);
}

#[test]
fn unload_stops_every_channel_playing_the_sound() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_ramp(dir.path(), "multi.wav", 8_000, 1, 8_000);
    let h = harness(1 << 20);
    h.engine
        .load_file(&path, ChunkSize::Seconds(0.25))
        .expect("load");
    h.engine.play(0, false).expect("play 0");
    h.engine.play(7, true).expect("play 7");
    h.engine.sync_now();
    assert_eq!(h.engine.active_channels(), 2);

    h.engine.unload();
    h.engine.unload();
    assert_eq!(h.engine.active_channels(), 0);
    assert_eq!(h.pool.live_count(), 0);
    assert!(matches!(h.engine.play(0, false), Err(WavStreamError::NotLoaded)));
}

#[test]
fn background_worker_streams_with_a_running_clock() {
    let dir = tempfile::tempdir().expect("tempdir");
    // 0.5 s at 8 kHz, 50 ms chunks.
    let path = write_ramp(dir.path(), "clocked.wav", 8_000, 1, 4_000);
    let mixer = Arc::new(SoftMixer::new(4));
    let pool = Arc::new(LinearPool::new(1 << 20));
    let engine = Engine::new(
        EngineConfig {
            channel_count: 4,
            ..EngineConfig::default()
        },
        OutputHandle(mixer.clone()),
        AllocatorHandle(pool.clone()),
    )
    .expect("engine");
    let mut clock =
        wavstream_core::ClockDriver::spawn(mixer.clone(), 8_000, 1).expect("clock starts");

    engine
        .load_file(&path, ChunkSize::Seconds(0.05))
        .expect("load");
    let mut rx = engine.subscribe_events();
    engine.play(1, false).expect("play");

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let ev = recv_event_with_timeout(&mut rx, Duration::from_secs(5));
        if ev.kind == PlaybackEventKind::Finished {
            assert_eq!(ev.channel, 1);
            break;
        }
        assert!(Instant::now() < deadline, "playback did not finish");
    }

    clock.stop();
    assert_eq!(engine.diagnostics().chunks_read, 9);
    assert!(engine.is_idle());
    assert_eq!(mixer.stats().double_queued, 0);
    engine.shutdown();
    assert_eq!(pool.live_count(), 0);
}

struct BrokenOutput;

impl AudioOutput for BrokenOutput {
    fn initialize(&self) -> wavstream_core::Result<()> {
        Err(WavStreamError::HardwareInit("no DSP firmware".into()))
    }

    fn configure(&self, _channel: usize, _config: ChannelConfig) {}

    fn submit(&self, _channel: usize, _wave: WaveBuf) -> SequenceId {
        SequenceId(0)
    }

    fn current_sequence(&self, _channel: usize) -> Option<SequenceId> {
        None
    }

    fn clear_queue(&self, _channel: usize) {}

    fn flush(&self, _buffer: &DeviceBuffer, _len: usize) {}
}

#[test]
fn failing_output_is_a_hardware_init_error() {
    let err = Engine::new(
        EngineConfig::default(),
        OutputHandle::new(BrokenOutput),
        AllocatorHandle::new(LinearPool::new(1_024)),
    )
    .unwrap_err();
    assert!(matches!(err, WavStreamError::HardwareInit(msg) if msg.contains("firmware")));
}

#[test]
fn shutdown_releases_everything_and_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_ramp(dir.path(), "bye.wav", 8_000, 1, 8_000);
    let h = harness(1 << 20);
    h.engine
        .load_file(&path, ChunkSize::Seconds(0.25))
        .expect("load");
    h.engine.play(2, false).expect("play");

    h.engine.shutdown();
    h.engine.shutdown();
    assert_eq!(h.pool.live_count(), 0);
    assert!(h.mixer.queued(2).is_empty());
    assert!(matches!(h.engine.play(2, false), Err(WavStreamError::ShutDown)));
}
