//! Chunk sizing: how much audio is moved per refill.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::FormatDescriptor;
use crate::error::{Result, WavStreamError};

/// Requested refill granularity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChunkSize {
    /// Keep the whole file resident; no background streaming.
    WholeFile,
    /// Stream in chunks of this many seconds.
    Seconds(f64),
}

impl ChunkSize {
    /// Negative durations select [`ChunkSize::WholeFile`].
    pub fn from_seconds(seconds: f64) -> Self {
        if seconds < 0.0 {
            ChunkSize::WholeFile
        } else {
            ChunkSize::Seconds(seconds)
        }
    }
}

/// Resolved chunk geometry for one loaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPlan {
    /// Sample frames per chunk. Never exceeds the file's total.
    pub chunk_samples: u64,
    /// `chunk_samples * channels * bytes_per_sample`.
    pub chunk_bytes: usize,
    /// Whether the chunk covers the entire data region.
    pub whole_file: bool,
}

impl ChunkPlan {
    /// Resolve `size` against `format`.
    ///
    /// Durations round to the nearest sample, are clamped to the file length
    /// and never drop below one sample.
    ///
    /// # Errors
    /// `InvalidChunkDuration` for zero, NaN or infinite durations.
    pub fn new(format: &FormatDescriptor, size: ChunkSize) -> Result<Self> {
        let chunk_samples = match size {
            ChunkSize::WholeFile => format.total_samples,
            ChunkSize::Seconds(seconds) => {
                if !seconds.is_finite() || seconds <= 0.0 {
                    return Err(WavStreamError::InvalidChunkDuration(seconds));
                }
                let requested = (seconds * format.sample_rate as f64).round() as u64;
                requested.clamp(1, format.total_samples)
            }
        };

        let chunk_bytes = chunk_samples as usize * format.frame_bytes();
        Ok(Self {
            chunk_samples,
            chunk_bytes,
            whole_file: chunk_samples == format.total_samples,
        })
    }

    /// Nominal playback time of one full chunk.
    pub fn chunk_secs(&self, format: &FormatDescriptor) -> f64 {
        self.chunk_samples as f64 / format.sample_rate as f64
    }

    /// Number of chunk reads needed to cover `data_size` bytes.
    pub fn reads_for(&self, data_size: u64) -> u64 {
        if self.chunk_bytes == 0 {
            return 0;
        }
        data_size.div_ceil(self.chunk_bytes as u64)
    }
}

impl fmt::Display for ChunkPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Stream chunk size:  {} bytes", self.chunk_bytes)?;
        write!(
            f,
            "Samples per chunk:  {}{}",
            self.chunk_samples,
            if self.whole_file { " (whole file)" } else { "" }
        )
    }
}
