//! `ClockDriver`: pulls a `SoftMixer` at real-time pace without an audio device.
//!
//! Used for headless playback: buffers drain exactly as fast as a device
//! running at `output_rate` would drain them, and the rendered frames are
//! discarded.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{error, info};

use super::soft::SoftMixer;
use crate::error::{Result, WavStreamError};

/// Render period (10 ms).
const TICK: Duration = Duration::from_millis(10);

pub struct ClockDriver {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ClockDriver {
    /// Spawn the driver thread.
    pub fn spawn(mixer: Arc<SoftMixer>, output_rate: u32, output_channels: u16) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread = std::thread::Builder::new()
            .name("wavstream-clock".into())
            .spawn(move || {
                info!(output_rate, "clock driver started");
                let width = output_channels.max(1) as usize;
                let mut scratch = Vec::new();
                let mut last = Instant::now();
                let mut carry = 0f64;

                loop {
                    match stop_rx.recv_timeout(TICK) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }

                    let now = Instant::now();
                    let exact = now.duration_since(last).as_secs_f64() * output_rate as f64 + carry;
                    last = now;
                    let frames = exact.floor() as usize;
                    carry = exact - frames as f64;

                    scratch.resize(frames * width, 0.0);
                    mixer.render(&mut scratch, output_rate, output_channels);
                }
                info!("clock driver stopped");
            })
            .map_err(|e| {
                error!("failed to spawn clock driver: {e}");
                WavStreamError::HardwareInit(e.to_string())
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Stop and join the driver thread. Idempotent.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ClockDriver {
    fn drop(&mut self) {
        self.stop();
    }
}
