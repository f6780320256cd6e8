//! Audio output via cpal backend.
//!
//! Renders a shared [`SoftMixer`] from the device callback. The callback
//! runs on an OS audio thread at elevated priority, so it only ever
//! `try_lock`s the mixer and plays silence if the sync worker or the caller
//! thread holds it at that instant.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms. `OutputDevice` must be
//! created and dropped on the same thread; the mixer it renders is shared
//! freely.

use std::sync::Arc;

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};
use tracing::{error, info};

use super::soft::SoftMixer;
use crate::error::{Result, WavStreamError};

/// Handle to an open output stream. Dropping it closes the device.
pub struct OutputDevice {
    _stream: Stream,
    /// Device sample rate (Hz).
    pub sample_rate: u32,
    /// Device channel count.
    pub channels: u16,
}

impl OutputDevice {
    /// Open the system default output device and start rendering `mixer`.
    ///
    /// # Errors
    /// `HardwareInit` when no device is available or the stream cannot be built.
    pub fn open_default(mixer: Arc<SoftMixer>) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| WavStreamError::HardwareInit("no default output device".into()))?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening output device"
        );

        let supported = device
            .default_output_config()
            .map_err(|e| WavStreamError::HardwareInit(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, "output config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                let mixer = Arc::clone(&mixer);
                device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _info| {
                        mixer.try_render(data, sample_rate, channels);
                    },
                    |err| error!("audio output error: {err}"),
                    None,
                )
            }

            SampleFormat::I16 => {
                let mixer = Arc::clone(&mixer);
                let mut scratch: Vec<f32> = Vec::new();
                device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _info| {
                        scratch.resize(data.len(), 0.0);
                        mixer.try_render(&mut scratch, sample_rate, channels);
                        for (dst, src) in data.iter_mut().zip(&scratch) {
                            *dst = (src * i16::MAX as f32) as i16;
                        }
                    },
                    |err| error!("audio output error: {err}"),
                    None,
                )
            }

            fmt => {
                return Err(WavStreamError::HardwareInit(format!(
                    "unsupported output sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| WavStreamError::HardwareInit(e.to_string()))?;

        stream
            .play()
            .map_err(|e| WavStreamError::HardwareInit(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            sample_rate,
            channels,
        })
    }
}
