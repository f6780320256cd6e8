//! `Engine`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! Engine::new()            → output initialized, sync worker spawned
//!     └─► load_file()      → header parsed, primer chunk resident
//!         └─► play(ch)     → channel configured, primer queued, stream bound
//!             └─► stop(ch) → queue cleared, stream buffers freed
//!         └─► unload()     → every channel using the sound stopped, primer freed
//! shutdown() / drop        → worker signalled + joined, everything released
//! ```
//!
//! ## Threading
//!
//! Two threads touch playback state: the caller and the sync worker. They
//! share one `parking_lot::Mutex` around the channel table; the worker holds
//! it for a full scan, `play`/`stop`/`unload` hold it while swapping a slot.
//! Lock order is always loaded-sound slot first, then channel table.

pub mod worker;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::{
    buffering::AllocatorHandle,
    error::{Result, WavStreamError},
    events::{PlaybackEvent, PlaybackEventKind},
    format::{
        chunk::{ChunkPlan, ChunkSize},
        FormatDescriptor,
    },
    output::{ChannelConfig, OutputHandle},
    stream::{source::LoadedSound, BufferPair, StreamDescriptor, StreamStatus},
};
use worker::{DiagnosticsSnapshot, WorkerDiagnostics};

/// Channel slots on the mixer.
pub const MAX_CHANNELS: usize = 24;

/// Broadcast channel capacity: 256 playback events buffered for slow consumers.
const EVENT_CAP: usize = 256;

/// Configuration for `Engine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of channel slots scanned by the worker. Default: 24.
    pub channel_count: usize,
    /// Sleep between worker scans. Default: 1 ms.
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_count: MAX_CHANNELS,
            poll_interval: Duration::from_millis(1),
        }
    }
}

/// What a channel slot is bound to.
pub(crate) enum ChannelState {
    /// Whole file in the primer; the mixer plays (and loops) it unaided.
    Resident { sound: Arc<LoadedSound> },
    /// Refilled by the worker.
    Streaming(StreamDescriptor),
}

impl ChannelState {
    fn sound(&self) -> &Arc<LoadedSound> {
        match self {
            ChannelState::Resident { sound } => sound,
            ChannelState::Streaming(stream) => stream.sound(),
        }
    }
}

pub(crate) struct ChannelTable {
    pub(crate) slots: Vec<Option<ChannelState>>,
}

impl ChannelTable {
    fn new(channel_count: usize) -> Self {
        let mut slots = Vec::with_capacity(channel_count);
        slots.resize_with(channel_count, || None);
        Self { slots }
    }
}

/// State shared between the engine handle and the sync worker.
pub(crate) struct Shared {
    pub(crate) table: Mutex<ChannelTable>,
    pub(crate) output: OutputHandle,
    pub(crate) allocator: AllocatorHandle,
    pub(crate) diagnostics: WorkerDiagnostics,
    events: broadcast::Sender<PlaybackEvent>,
    event_seq: AtomicU64,
}

impl Shared {
    pub(crate) fn emit(&self, channel: usize, kind: PlaybackEventKind) {
        let seq = self.event_seq.fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(PlaybackEvent { seq, channel, kind });
    }
}

struct WorkerHandle {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

/// The streaming engine.
///
/// `Engine` is `Send + Sync`; wrap it in an `Arc` to share it between the
/// host's threads.
pub struct Engine {
    config: EngineConfig,
    shared: Arc<Shared>,
    loaded: Mutex<Option<Arc<LoadedSound>>>,
    worker: Mutex<Option<WorkerHandle>>,
    shut_down: AtomicBool,
}

impl Engine {
    /// Initialize `output` and start the sync worker.
    ///
    /// # Errors
    /// `HardwareInit` if the output fails to initialize or the worker thread
    /// cannot be spawned.
    pub fn new(config: EngineConfig, output: OutputHandle, allocator: AllocatorHandle) -> Result<Self> {
        output.initialize().map_err(|e| match e {
            WavStreamError::HardwareInit(_) => e,
            other => WavStreamError::HardwareInit(other.to_string()),
        })?;

        let (events, _) = broadcast::channel(EVENT_CAP);
        let shared = Arc::new(Shared {
            table: Mutex::new(ChannelTable::new(config.channel_count)),
            output,
            allocator,
            diagnostics: WorkerDiagnostics::default(),
            events,
            event_seq: AtomicU64::new(0),
        });

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let worker_shared = Arc::clone(&shared);
        let interval = config.poll_interval;
        let thread = std::thread::Builder::new()
            .name("wavstream-sync".into())
            .spawn(move || worker::run(worker_shared, interval, stop_rx))
            .map_err(|e| {
                shared.output.shutdown();
                WavStreamError::HardwareInit(format!("failed to spawn sync worker: {e}"))
            })?;

        info!(
            channels = config.channel_count,
            ?interval,
            "engine started"
        );

        Ok(Self {
            config,
            shared,
            loaded: Mutex::new(None),
            worker: Mutex::new(Some(WorkerHandle { stop_tx, thread })),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Load a WAV file, replacing (and unloading) any previous one.
    ///
    /// # Errors
    /// `FileNotFound`, `InvalidContainer`, `UnsupportedFormat`,
    /// `InvalidChunkDuration`, `OutOfMemory`, `Io`, or `ShutDown`.
    pub fn load_file(&self, path: impl AsRef<Path>, size: ChunkSize) -> Result<FormatDescriptor> {
        self.ensure_running()?;

        let mut loaded = self.loaded.lock();
        if let Some(previous) = loaded.take() {
            self.unload_sound(previous);
        }

        let sound = LoadedSound::open(path.as_ref(), size, &self.shared.allocator)?;
        let format = *sound.format();
        *loaded = Some(Arc::new(sound));
        Ok(format)
    }

    /// Start the loaded sound on `channel`, replacing whatever played there.
    ///
    /// Files that fit in one chunk loop on the mixer itself; streamed files
    /// are looped by the sync worker rewinding the file cursor.
    ///
    /// # Errors
    /// `InvalidChannel`, `NotLoaded`, `OutOfMemory` (streamed files need two
    /// more chunk buffers), or `ShutDown`.
    pub fn play(&self, channel: usize, looping: bool) -> Result<()> {
        self.ensure_running()?;
        self.check_channel(channel)?;

        let loaded = self.loaded.lock();
        let sound = loaded.as_ref().ok_or(WavStreamError::NotLoaded)?;
        let shared = &*self.shared;
        let streamed = sound.is_streamed();

        let mut table = shared.table.lock();
        if streamed {
            // Buffers held by the stream being replaced count as free.
            let needed = sound.plan().chunk_bytes * 2;
            let reclaimable = match table.slots.get(channel) {
                Some(Some(ChannelState::Streaming(stream))) => stream.held_bytes(),
                _ => 0,
            };
            let available = shared.allocator.available_bytes() + reclaimable;
            if available < needed {
                return Err(WavStreamError::OutOfMemory {
                    requested: needed,
                    available,
                });
            }
        }
        worker::retire_channel(shared, &mut table, channel);

        let buffers = if streamed {
            let bytes = sound.plan().chunk_bytes;
            shared.allocator.ensure_available(bytes * 2)?;
            let first = shared.allocator.alloc(bytes)?;
            let second = match shared.allocator.alloc(bytes) {
                Ok(buf) => buf,
                Err(e) => {
                    shared.allocator.free(first);
                    return Err(e);
                }
            };
            Some(BufferPair::new(first, second))
        } else {
            None
        };

        shared
            .output
            .configure(channel, ChannelConfig::from(sound.format()));
        let submitted = sound.with_primer(|primer| {
            shared.output.flush(primer, sound.plan().chunk_bytes);
            shared
                .output
                .submit(channel, sound.primer_wave(primer, looping && !streamed))
        });

        let Some(seq) = submitted else {
            if let Some(pair) = buffers {
                shared.allocator.free(pair.active);
                shared.allocator.free(pair.pending);
            }
            return Err(WavStreamError::NotLoaded);
        };

        table.slots[channel] = Some(match buffers {
            Some(pair) => ChannelState::Streaming(StreamDescriptor::new(
                Arc::clone(sound),
                looping,
                pair,
                seq,
            )),
            None => ChannelState::Resident {
                sound: Arc::clone(sound),
            },
        });
        drop(table);

        info!(channel, looping, streamed, sequence = seq.0, "playback started");
        shared.emit(channel, PlaybackEventKind::Started { streamed, looping });
        Ok(())
    }

    /// Clear `channel`'s queue and release its stream.
    ///
    /// A channel with nothing bound is left as it is; no error.
    ///
    /// # Errors
    /// `InvalidChannel` for an index beyond the table.
    pub fn stop(&self, channel: usize) -> Result<()> {
        self.check_channel(channel)?;
        if self.shut_down.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut table = self.shared.table.lock();
        if worker::retire_channel(&self.shared, &mut table, channel) {
            info!(channel, "playback stopped");
            self.shared.emit(channel, PlaybackEventKind::Stopped);
        }
        Ok(())
    }

    /// Stop every channel.
    pub fn stop_all(&self) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let mut table = self.shared.table.lock();
        for channel in 0..table.slots.len() {
            if worker::retire_channel(&self.shared, &mut table, channel) {
                self.shared.emit(channel, PlaybackEventKind::Stopped);
            }
        }
    }

    /// Stop every channel playing the loaded sound and release it. Idempotent.
    pub fn unload(&self) {
        let mut loaded = self.loaded.lock();
        if let Some(sound) = loaded.take() {
            self.unload_sound(sound);
        }
    }

    fn unload_sound(&self, sound: Arc<LoadedSound>) {
        {
            let mut table = self.shared.table.lock();
            for channel in 0..table.slots.len() {
                let bound = table.slots[channel]
                    .as_ref()
                    .is_some_and(|state| Arc::ptr_eq(state.sound(), &sound));
                if bound && worker::retire_channel(&self.shared, &mut table, channel) {
                    self.shared.emit(channel, PlaybackEventKind::Stopped);
                }
            }
        }
        sound.release(&self.shared.allocator);
    }

    /// Run one worker scan on the calling thread.
    pub fn sync_now(&self) {
        let mut table = self.shared.table.lock();
        worker::scan(&self.shared, &mut table);
    }

    /// Signal the worker, wait for it to exit, then release every buffer and
    /// shut the output down. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.stop_tx.send(());
            if worker.thread.join().is_err() {
                error!("sync worker panicked");
            }
        }

        {
            let mut table = self.shared.table.lock();
            for channel in 0..table.slots.len() {
                worker::retire_channel(&self.shared, &mut table, channel);
            }
        }
        self.unload();
        self.shared.output.shutdown();
        info!("engine shut down");
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn loaded_format(&self) -> Option<FormatDescriptor> {
        self.loaded.lock().as_ref().map(|s| *s.format())
    }

    pub fn chunk_plan(&self) -> Option<ChunkPlan> {
        self.loaded.lock().as_ref().map(|s| *s.plan())
    }

    /// Summary of the loaded sound, if any.
    pub fn describe_loaded(&self) -> Option<String> {
        self.loaded.lock().as_ref().map(|s| s.describe())
    }

    /// Whether `channel` still has audio to play.
    pub fn is_playing(&self, channel: usize) -> bool {
        let table = self.shared.table.lock();
        self.channel_busy(&table, channel)
    }

    /// `true` once no channel has anything left to play.
    pub fn is_idle(&self) -> bool {
        let table = self.shared.table.lock();
        (0..table.slots.len()).all(|channel| !self.channel_busy(&table, channel))
    }

    fn channel_busy(&self, table: &ChannelTable, channel: usize) -> bool {
        match table.slots.get(channel) {
            Some(Some(ChannelState::Streaming(stream))) => !stream.is_finished(),
            Some(Some(ChannelState::Resident { .. })) => {
                self.shared.output.current_sequence(channel).is_some()
            }
            _ => false,
        }
    }

    /// Snapshot of `channel`'s stream, `None` unless it is streaming.
    pub fn stream_status(&self, channel: usize) -> Option<StreamStatus> {
        match self.shared.table.lock().slots.get(channel) {
            Some(Some(ChannelState::Streaming(stream))) => Some(stream.status(channel)),
            _ => None,
        }
    }

    /// Number of bound channel slots.
    pub fn active_channels(&self) -> usize {
        self.shared
            .table
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.shared.diagnostics.snapshot()
    }

    pub fn reset_diagnostics(&self) {
        self.shared.diagnostics.reset();
    }

    /// Subscribe to playback events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.shared.events.subscribe()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(WavStreamError::ShutDown);
        }
        Ok(())
    }

    fn check_channel(&self, channel: usize) -> Result<()> {
        if channel >= self.config.channel_count {
            return Err(WavStreamError::InvalidChannel {
                channel,
                count: self.config.channel_count,
            });
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::{linear::LinearPool, DeviceAllocator};
    use crate::format::tests::wav_bytes;
    use crate::output::soft::SoftMixer;
    use std::path::PathBuf;

    struct Rig {
        engine: Engine,
        mixer: Arc<SoftMixer>,
        pool: Arc<LinearPool>,
        _dir: tempfile::TempDir,
        path: PathBuf,
    }

    /// Engine whose worker never wakes on its own; tests drive it with `sync_now`.
    fn rig(data_len: usize, pool_bytes: usize) -> Rig {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fixture.wav");
        std::fs::write(&path, wav_bytes(1, 1_000, 8, data_len)).expect("write fixture");

        let mixer = Arc::new(SoftMixer::new(MAX_CHANNELS));
        let pool = Arc::new(LinearPool::new(pool_bytes));
        let config = EngineConfig {
            poll_interval: Duration::from_secs(3_600),
            ..EngineConfig::default()
        };
        let engine = Engine::new(config, OutputHandle(mixer.clone()), AllocatorHandle(pool.clone()))
            .expect("engine");
        Rig {
            engine,
            mixer,
            pool,
            _dir: dir,
            path,
        }
    }

    #[test]
    fn play_without_load_is_rejected() {
        let r = rig(100, 1_000);
        assert!(matches!(r.engine.play(0, false), Err(WavStreamError::NotLoaded)));
    }

    #[test]
    fn out_of_range_channel_is_rejected() {
        let r = rig(100, 1_000);
        let err = r.engine.stop(MAX_CHANNELS).unwrap_err();
        assert!(matches!(
            err,
            WavStreamError::InvalidChannel {
                channel: 24,
                count: 24
            }
        ));
    }

    #[test]
    fn streamed_play_reserves_two_chunks() {
        let r = rig(1_000, 10_000);
        r.engine
            .load_file(&r.path, ChunkSize::Seconds(0.1))
            .expect("load");
        assert_eq!(r.pool.used_bytes(), 100);

        r.engine.play(3, false).expect("play");
        assert_eq!(r.pool.used_bytes(), 300);
        assert_eq!(r.mixer.queued(3).len(), 1);
        assert!(r.engine.is_playing(3));

        let status = r.engine.stream_status(3).expect("streaming");
        assert_eq!(status.position_bytes, 100);
        assert!(!status.end_of_file);

        r.engine.stop(3).expect("stop");
        assert_eq!(r.pool.used_bytes(), 100);
        assert!(r.mixer.queued(3).is_empty());
        assert!(!r.engine.is_playing(3));
    }

    #[test]
    fn replaying_a_channel_retires_the_previous_stream() {
        let r = rig(1_000, 10_000);
        r.engine
            .load_file(&r.path, ChunkSize::Seconds(0.1))
            .expect("load");
        r.engine.play(0, false).expect("first play");
        r.engine.play(0, true).expect("second play");
        assert_eq!(r.pool.used_bytes(), 300);
        assert_eq!(r.engine.active_channels(), 1);
        assert!(r.engine.stream_status(0).expect("status").looping);
    }

    #[test]
    fn play_without_room_for_stream_buffers_leaves_pool_unchanged() {
        let r = rig(1_000, 250);
        r.engine
            .load_file(&r.path, ChunkSize::Seconds(0.1))
            .expect("load");
        let err = r.engine.play(0, false).unwrap_err();
        assert!(matches!(err, WavStreamError::OutOfMemory { requested: 200, .. }));
        assert_eq!(r.pool.used_bytes(), 100);
        assert_eq!(r.engine.active_channels(), 0);
    }

    #[test]
    fn replay_counts_the_replaced_stream_as_free() {
        let r = rig(1_000, 450);
        r.engine
            .load_file(&r.path, ChunkSize::Seconds(0.1))
            .expect("load");
        r.engine.play(0, false).expect("play");
        let filler = r.pool.alloc(100).expect("filler");
        assert_eq!(r.pool.available_bytes(), 50);

        let err = r.engine.play(1, false).unwrap_err();
        assert!(matches!(
            err,
            WavStreamError::OutOfMemory {
                requested: 200,
                available: 50
            }
        ));
        assert!(r.engine.is_playing(0));
        assert_eq!(r.mixer.queued(0).len(), 1);
        assert_eq!(r.pool.used_bytes(), 400);

        r.engine.play(0, true).expect("replay busy channel");
        assert!(r.engine.stream_status(0).expect("status").looping);
        assert_eq!(r.pool.used_bytes(), 400);

        r.pool.free(filler);
    }

    #[test]
    fn loading_again_replaces_the_previous_sound() {
        let r = rig(1_000, 10_000);
        r.engine
            .load_file(&r.path, ChunkSize::Seconds(0.1))
            .expect("load");
        r.engine.play(1, false).expect("play");

        let format = r
            .engine
            .load_file(&r.path, ChunkSize::WholeFile)
            .expect("reload");
        assert_eq!(format.data_size, 1_000);
        assert_eq!(r.engine.active_channels(), 0);
        assert_eq!(r.pool.used_bytes(), 1_000);
        assert!(r.engine.chunk_plan().expect("plan").whole_file);
    }

    #[test]
    fn stop_all_clears_every_bound_channel() {
        let r = rig(1_000, 10_000);
        r.engine
            .load_file(&r.path, ChunkSize::Seconds(0.1))
            .expect("load");
        let mut rx = r.engine.subscribe_events();
        for channel in [0, 5, 23] {
            r.engine.play(channel, false).expect("play");
        }
        r.engine.sync_now();
        assert!(r.engine.diagnostics().chunks_read >= 3);

        r.engine.stop_all();
        assert!(r.engine.is_idle());
        assert_eq!(r.engine.active_channels(), 0);
        assert_eq!(r.pool.used_bytes(), 100);

        let stopped = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|ev| ev.kind == PlaybackEventKind::Stopped)
            .count();
        assert_eq!(stopped, 3);

        r.engine.reset_diagnostics();
        assert_eq!(r.engine.diagnostics(), DiagnosticsSnapshot::default());
    }

    #[test]
    fn operations_after_shutdown_fail() {
        let r = rig(100, 1_000);
        r.engine.shutdown();
        r.engine.shutdown();
        assert!(matches!(
            r.engine.load_file(&r.path, ChunkSize::WholeFile),
            Err(WavStreamError::ShutDown)
        ));
        assert!(r.engine.stop(0).is_ok());
    }
}
