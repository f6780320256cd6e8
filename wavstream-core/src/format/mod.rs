//! Canonical WAV/PCM header parsing.
//!
//! Only the canonical 44-byte layout is understood:
//!
//! ```text
//! 0   "RIFF"        4   riff size     8   "WAVE"
//! 12  "fmt "        16  fmt size = 16 20  format tag = 1 (PCM)
//! 22  channels      24  sample rate   28  byte rate
//! 32  block align   34  bits/sample   36  "data" + size
//! 44  interleaved PCM samples to end of file
//! ```
//!
//! The data chunk is assumed to start at offset 44. Files carrying extra
//! chunks (LIST, fact, extensible fmt) before the samples are not searched
//! and will be rejected or misread.

pub mod chunk;

use std::fmt;
use std::io::{Read, Seek, SeekFrom};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, WavStreamError};

/// Byte offset of the first PCM sample.
pub const DATA_OFFSET: u64 = 44;

const HEADER_LEN: usize = 44;
const FORMAT_TAG_PCM: u16 = 1;
const PCM_FMT_CHUNK_LEN: u32 = 16;

/// Sample encoding understood by the mixer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Unsigned 8-bit PCM.
    Pcm8,
    /// Signed 16-bit little-endian PCM.
    Pcm16,
}

impl Encoding {
    /// Map a per-channel sample byte depth to an encoding.
    pub fn from_bytes_per_sample(bytes: u16) -> Option<Self> {
        match bytes {
            1 => Some(Encoding::Pcm8),
            2 => Some(Encoding::Pcm16),
            _ => None,
        }
    }

    pub fn bytes_per_sample(self) -> u16 {
        match self {
            Encoding::Pcm8 => 1,
            Encoding::Pcm16 => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Encoding::Pcm8 => "PCM8",
            Encoding::Pcm16 => "PCM16",
        }
    }
}

/// Playback parameters derived once from a WAV header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatDescriptor {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// 1 (mono) or 2 (stereo).
    pub channels: u16,
    pub encoding: Encoding,
    pub bits_per_sample: u16,
    /// Byte depth of one sample of one channel.
    pub bytes_per_sample: u16,
    /// Block alignment as declared in the header (informational).
    pub block_align: u16,
    /// Number of sample frames in the data region.
    pub total_samples: u64,
    /// Raw data region size in bytes.
    pub data_size: u64,
    /// Offset of the data region within the file.
    pub data_offset: u64,
}

impl FormatDescriptor {
    /// Bytes in one interleaved sample frame.
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * self.bytes_per_sample as usize
    }

    /// Absolute file offset one past the last data byte.
    pub fn data_end(&self) -> u64 {
        self.data_offset + self.data_size
    }

    pub fn duration_secs(&self) -> f64 {
        self.total_samples as f64 / self.sample_rate as f64
    }

    /// Human-readable multi-line summary (diagnostics only).
    pub fn describe(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FormatDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Sample rate:        {} Hz", self.sample_rate)?;
        writeln!(f, "Channels:           {}", self.channels)?;
        writeln!(f, "Encoding:           {}", self.encoding.name())?;
        writeln!(f, "Bytes per sample:   {}", self.bytes_per_sample)?;
        writeln!(f, "Samples:            {}", self.total_samples)?;
        writeln!(f, "Audio data size:    {} bytes", self.data_size)?;
        write!(f, "Duration:           {:.3} s", self.duration_secs())
    }
}

/// Parse the canonical header of a WAV stream.
///
/// The data size is everything from offset 44 to the end of the stream. The
/// reader position is left unspecified afterwards.
///
/// # Errors
/// - `InvalidContainer` for short streams and bad RIFF/WAVE/fmt markers.
/// - `UnsupportedFormat` for anything other than 8/16-bit integer PCM with
///   one or two channels and a 16-byte fmt chunk.
pub fn parse_header<R: Read + Seek>(reader: &mut R) -> Result<FormatDescriptor> {
    let stream_len = reader.seek(SeekFrom::End(0))?;
    if stream_len < HEADER_LEN as u64 {
        return Err(WavStreamError::InvalidContainer(format!(
            "stream is {stream_len} bytes, shorter than the {HEADER_LEN}-byte header"
        )));
    }

    let mut header = [0u8; HEADER_LEN];
    reader.seek(SeekFrom::Start(0))?;
    reader.read_exact(&mut header)?;

    parse_header_bytes(&header, stream_len)
}

/// Decode an already-read 44-byte header for a stream of `stream_len` bytes.
pub fn parse_header_bytes(header: &[u8; HEADER_LEN], stream_len: u64) -> Result<FormatDescriptor> {
    expect_marker(header, 0, b"RIFF")?;
    expect_marker(header, 8, b"WAVE")?;
    expect_marker(header, 12, b"fmt ")?;

    let fmt_len = u32_at(header, 16);
    if fmt_len != PCM_FMT_CHUNK_LEN {
        return Err(WavStreamError::UnsupportedFormat(format!(
            "fmt chunk is {fmt_len} bytes, PCM requires {PCM_FMT_CHUNK_LEN}"
        )));
    }

    let format_tag = u16_at(header, 20);
    if format_tag != FORMAT_TAG_PCM {
        return Err(WavStreamError::UnsupportedFormat(format!(
            "format tag {format_tag} is not integer PCM"
        )));
    }

    let channels = u16_at(header, 22);
    if !(1..=2).contains(&channels) {
        return Err(WavStreamError::UnsupportedFormat(format!(
            "must have 1 or 2 channels, found {channels}"
        )));
    }

    let sample_rate = u32_at(header, 24);
    if sample_rate == 0 {
        return Err(WavStreamError::UnsupportedFormat(
            "sample rate is zero".into(),
        ));
    }

    let block_align = u16_at(header, 32);
    let bits_per_sample = u16_at(header, 34);
    let bytes_per_sample = bits_per_sample / 8;
    let encoding = match Encoding::from_bytes_per_sample(bytes_per_sample) {
        Some(enc) if bits_per_sample % 8 == 0 => enc,
        _ => {
            return Err(WavStreamError::UnsupportedFormat(format!(
                "{bits_per_sample}-bit samples; must be PCM8 or PCM16"
            )))
        }
    };

    let frame_bytes = channels as u64 * bytes_per_sample as u64;
    if block_align as u64 != frame_bytes {
        warn!(
            block_align,
            frame_bytes, "header block alignment disagrees with channel layout, using computed"
        );
    }

    let data_size = stream_len - DATA_OFFSET;
    let total_samples = data_size / frame_bytes;
    if total_samples == 0 {
        return Err(WavStreamError::InvalidContainer(
            "data region holds no complete sample frame".into(),
        ));
    }

    Ok(FormatDescriptor {
        sample_rate,
        channels,
        encoding,
        bits_per_sample,
        bytes_per_sample,
        block_align,
        total_samples,
        data_size,
        data_offset: DATA_OFFSET,
    })
}

fn expect_marker(header: &[u8], offset: usize, marker: &[u8; 4]) -> Result<()> {
    if &header[offset..offset + 4] == marker {
        Ok(())
    } else {
        Err(WavStreamError::InvalidContainer(format!(
            "missing \"{}\" marker at offset {offset}",
            String::from_utf8_lossy(marker)
        )))
    }
}

fn u16_at(header: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([header[offset], header[offset + 1]])
}

fn u32_at(header: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        header[offset],
        header[offset + 1],
        header[offset + 2],
        header[offset + 3],
    ])
}
