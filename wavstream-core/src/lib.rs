//! # wavstream-core
//!
//! Streams PCM audio from WAV files on disk into a handful of fixed-size,
//! device-visible buffers that are queued on an audio mixer, refilling them
//! just in time so arbitrarily long files play with bounded memory.
//!
//! ## Architecture
//!
//! ```text
//! WAV file → format::parse_header → FormatDescriptor + ChunkPlan
//!                                          │
//!                              LoadedSound (resident first chunk)
//!                                          │
//!                 Engine::play ──► AudioOutput::submit (primer)
//!                                          │
//!     sync worker (one thread, one mutex) ─┴─► swap Active/Pending,
//!                                              read next chunk, flush, submit
//! ```
//!
//! The mixer side is a trait (`AudioOutput`); `SoftMixer` is the software
//! implementation used by the host binary and by the tests.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod buffering;
pub mod engine;
pub mod error;
pub mod events;
pub mod format;
pub mod output;
pub mod stream;

// Convenience re-exports for downstream crates
pub use buffering::{linear::LinearPool, AllocatorHandle, DeviceAllocator, DeviceBuffer};
pub use engine::{worker::DiagnosticsSnapshot, Engine, EngineConfig, MAX_CHANNELS};
pub use error::{Result, WavStreamError};
pub use events::{PlaybackEvent, PlaybackEventKind};
pub use format::{
    chunk::{ChunkPlan, ChunkSize},
    Encoding, FormatDescriptor,
};
pub use output::{
    clock::ClockDriver, soft::SoftMixer, AudioOutput, ChannelConfig, OutputHandle, SequenceId,
    WaveBuf,
};
pub use stream::{source::LoadedSound, StreamStatus};

#[cfg(feature = "audio-cpal")]
pub use output::device::OutputDevice;
