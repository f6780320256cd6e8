//! Sine test tone writer.

use std::f64::consts::TAU;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::info;

#[derive(Debug, Clone, Copy)]
pub struct ToneSpec {
    pub seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits: u16,
    pub frequency: f64,
}

impl Default for ToneSpec {
    fn default() -> Self {
        Self {
            seconds: 5.0,
            sample_rate: 44_100,
            channels: 1,
            bits: 16,
            frequency: 440.0,
        }
    }
}

/// Peak amplitude as a fraction of full scale.
const AMPLITUDE: f64 = 0.5;

/// Write a canonical 44-byte-header PCM file. Returns the frame count.
pub fn write_tone(path: &Path, spec: &ToneSpec) -> Result<u64> {
    if !(spec.seconds.is_finite() && spec.seconds > 0.0) {
        bail!("tone length must be positive, got {}", spec.seconds);
    }
    if !matches!(spec.bits, 8 | 16) {
        bail!("bits must be 8 or 16, got {}", spec.bits);
    }
    if !matches!(spec.channels, 1 | 2) {
        bail!("channels must be 1 or 2, got {}", spec.channels);
    }
    if spec.sample_rate == 0 {
        bail!("sample rate must be non-zero");
    }

    let wav_spec = hound::WavSpec {
        channels: spec.channels,
        sample_rate: spec.sample_rate,
        bits_per_sample: spec.bits,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, wav_spec)
        .with_context(|| format!("creating {}", path.display()))?;

    let frames = (spec.seconds * spec.sample_rate as f64).round() as u64;
    let step = TAU * spec.frequency / spec.sample_rate as f64;
    for n in 0..frames {
        let value = AMPLITUDE * (step * n as f64).sin();
        for _ in 0..spec.channels {
            if spec.bits == 8 {
                writer.write_sample((value * i8::MAX as f64).round() as i8)?;
            } else {
                writer.write_sample((value * i16::MAX as f64).round() as i16)?;
            }
        }
    }
    writer.finalize().context("finalizing tone file")?;

    info!(
        path = %path.display(),
        frames,
        rate = spec.sample_rate,
        channels = spec.channels,
        bits = spec.bits,
        "tone written"
    );
    Ok(frames)
}
